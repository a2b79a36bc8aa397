//! The forwarding path for one HTTP exchange.
//!
//! For every request served on an inbound connection:
//!
//! 1. Resolve the target (tunnel origin, absolute URL, or Host header)
//! 2. Buffer the body and snapshot the request
//! 3. Apply the host filter, pausing the request for the operator when
//!    request interception is active
//! 4. Send upstream over the connection's [`UpstreamSession`]
//! 5. Buffer the response, pausing it when response interception is active
//! 6. Return it to the client and record the exchange
//!
//! Unedited messages go out with their original header map, so header
//! order and case survive the trip. Edited messages are rebuilt from the
//! snapshot with their framing headers corrected.

use super::capture::CaptureBuf;
use super::config::ProxyConfig;
use super::connect::{PendingTunnel, handle_connect};
use super::error::ProxyError;
use super::filter::{HostDecision, HostFilter};
use super::intercept::{Direction, InterceptStatus, InterceptedTransaction, Release};
use super::message::{
    EditedPayload, Header, RequestSnapshot, ResponseSnapshot, headers_from_map, headers_to_map,
};
use super::recorder::{Size, Timing, TrafficRecord, elapsed_ms};
use super::server::Services;
use super::upstream::{Scheme, Target, UpstreamSession};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderValue, TRANSFER_ENCODING,
};
use hyper::http::{Extensions, request, response};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request headers addressed to this proxy rather than the origin.
const PROXY_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Per-connection state shared by the exchanges served on it.
pub(crate) struct ConnectionState {
    pub(crate) id: u64,
    pub(crate) local_addr: SocketAddr,
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) filter: HostFilter,
    pub(crate) services: Arc<Services>,
    /// Bytes read from the client since the last message head.
    pub(crate) capture: CaptureBuf,
    /// Origin of a CONNECT tunnel; requests inside it are origin-form.
    tunnel: Option<Target>,
    tls_handshake_ms: Option<u64>,
    upstream: Mutex<UpstreamSession>,
    /// A CONNECT waiting for hyper to release the socket.
    pending_tunnel: std::sync::Mutex<Option<PendingTunnel>>,
}

impl ConnectionState {
    pub(crate) fn new(
        id: u64,
        local_addr: SocketAddr,
        config: Arc<ProxyConfig>,
        services: Arc<Services>,
    ) -> Self {
        let filter = HostFilter::from_config(&config);
        Self {
            id,
            local_addr,
            config,
            filter,
            services,
            capture: CaptureBuf::default(),
            tunnel: None,
            tls_handshake_ms: None,
            upstream: Mutex::new(UpstreamSession::new()),
            pending_tunnel: std::sync::Mutex::new(None),
        }
    }

    /// State for the tunnel to `target` opened on this connection.
    pub(crate) fn for_tunnel(&self, target: Target, tls_handshake_ms: Option<u64>) -> Self {
        Self {
            tunnel: Some(target),
            tls_handshake_ms,
            ..Self::new(self.id, self.local_addr, self.config.clone(), self.services.clone())
        }
    }

    pub(crate) fn park_tunnel(&self, tunnel: PendingTunnel) {
        *self
            .pending_tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tunnel);
    }

    pub(crate) fn take_tunnel(&self) -> Option<PendingTunnel> {
        self.pending_tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn target_for(&self, parts: &request::Parts) -> Result<Target, String> {
        if let Some(tunnel) = &self.tunnel {
            return Ok(tunnel.clone());
        }
        if parts.uri.scheme().is_some() {
            return Target::from_uri(&parts.uri);
        }

        // Origin-form sent straight to the proxy; fall back to Host
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| "request has neither an absolute URL nor a Host header".to_string())?;
        let target = Target::from_authority(Scheme::Http, host)?;
        if self.is_self(&target) {
            return Err(format!("{} is this proxy, not an origin", host));
        }
        Ok(target)
    }

    fn is_self(&self, target: &Target) -> bool {
        if target.port != self.local_addr.port() {
            return false;
        }
        match target.host.parse::<IpAddr>() {
            Ok(ip) => ip == self.local_addr.ip() || ip.is_loopback(),
            Err(_) => target.host.eq_ignore_ascii_case("localhost"),
        }
    }
}

/// Serve one request: filter, intercept, forward, record.
pub(crate) async fn handle_request(
    conn: Arc<ConnectionState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    if req.method() == Method::CONNECT && conn.tunnel.is_none() {
        return handle_connect(conn, req).await;
    }

    let mut log = ExchangeLog::start(conn.clone());
    let (parts, body) = req.into_parts();
    let headers = conn.capture.request_headers(&parts.method, &parts.headers);
    conn.capture.mark();

    let target = conn.target_for(&parts);
    let url = match &target {
        Ok(target) => target.url(path_and_query(&parts.uri)),
        Err(_) => parts.uri.to_string(),
    };
    let mut request = RequestSnapshot {
        method: parts.method.to_string(),
        url,
        headers,
        body: Bytes::new(),
    };
    log.request = Some(request.clone());

    if parts.method == Method::CONNECT {
        return Ok(log.local_response(
            StatusCode::BAD_REQUEST,
            "CONNECT is not supported inside a tunnel",
            true,
        ));
    }

    let collected = body.collect().await;
    conn.capture.mark();
    match collected {
        Ok(collected) => request.body = collected.to_bytes(),
        Err(e) => {
            return Ok(log.local_response(
                StatusCode::BAD_REQUEST,
                &format!("Malformed request body: {}", e),
                true,
            ));
        }
    }
    log.request = Some(request.clone());

    let mut target = match target {
        Ok(target) => target,
        Err(message) => return Ok(log.local_response(StatusCode::BAD_REQUEST, &message, false)),
    };

    let intercept = match conn.filter.evaluate(&target.host) {
        HostDecision::Block => {
            info!("Blocking request to {}", request.url);
            let message = format!("Requests to {} are blocked", target.host);
            return Ok(log.local_response(StatusCode::FORBIDDEN, &message, false));
        }
        HostDecision::PassThrough => false,
        HostDecision::Intercept => true,
    };

    let mut request_edit = None;
    if intercept && conn.config.intercepts_requests() {
        let transaction = InterceptedTransaction::request(conn.id, &request);
        match log.pause(Direction::Request, transaction).await {
            Release::Forward(Some(edit)) => {
                request.apply(&edit);
                request_edit = Some(edit);
            }
            Release::Forward(None) | Release::TimedOut => {}
            Release::Drop => return Err(log.abandoned()),
        }
        log.request = Some(request.clone());
    }

    if let Some(edit) = &request_edit
        && edit.url.is_some()
    {
        target = match parse_url(&request.url).and_then(|uri| Target::from_uri(&uri)) {
            Ok(target) => target,
            Err(message) => {
                let message = format!("Edited URL rejected: {}", message);
                return Ok(log.local_response(StatusCode::BAD_REQUEST, &message, false));
            }
        };
    }

    let outbound = match build_request(parts, &request, &target, request_edit.as_ref()) {
        Ok(outbound) => outbound,
        Err(message) => return Ok(log.local_response(StatusCode::BAD_REQUEST, &message, false)),
    };

    let upstream_result = {
        let mut session = conn.upstream.lock().await;
        session
            .send(&target, outbound, &conn.config, &conn.services.connectors)
            .await
    };

    let mut response_parts = None;
    let mut response = match upstream_result {
        Ok((upstream, headers)) => {
            let (parts, body) = upstream.into_parts();
            match body.collect().await {
                Ok(collected) => {
                    let snapshot = ResponseSnapshot {
                        status: parts.status.as_u16(),
                        headers,
                        body: collected.to_bytes(),
                    };
                    response_parts = Some(parts);
                    snapshot
                }
                Err(e) => log.bad_gateway(&target, e.into()),
            }
        }
        Err(e) => log.bad_gateway(&target, e),
    };

    let mut response_edit = None;
    if intercept && conn.config.intercepts_responses() {
        let transaction = InterceptedTransaction::response(conn.id, &request, &response);
        match log.pause(Direction::Response, transaction).await {
            Release::Forward(Some(edit)) => {
                response.apply(&edit);
                response_edit = Some(edit);
            }
            Release::Forward(None) | Release::TimedOut => {}
            Release::Drop => return Err(log.abandoned()),
        }
    }

    let head_request = request.method.eq_ignore_ascii_case("HEAD");
    let client_response =
        match build_response(response_parts, &response, response_edit.as_ref(), head_request) {
            Ok(client_response) => client_response,
            Err(message) => {
                warn!("Edited response for {} rejected: {}", request.url, message);
                let message = format!("Edited response rejected: {}", message);
                return Ok(log.local_response(StatusCode::BAD_GATEWAY, &message, false));
            }
        };

    debug!(
        "{} {} -> {}",
        request.method,
        request.url,
        client_response.status().as_u16()
    );
    log.finish(Some(response));
    Ok(client_response)
}

/// Build the upstream request.
///
/// Starts from the inbound parts so unedited headers keep their order and
/// case; edited pieces are swapped in from the snapshot.
fn build_request(
    mut parts: request::Parts,
    request: &RequestSnapshot,
    target: &Target,
    edit: Option<&EditedPayload>,
) -> Result<Request<Full<Bytes>>, String> {
    parts.uri = origin_form(&request.url)?;
    parts.version = Version::HTTP_11;

    if let Some(edit) = edit {
        if edit.method.is_some() {
            parts.method = Method::from_bytes(request.method.as_bytes())
                .map_err(|_| format!("invalid method '{}'", request.method))?;
        }
        if edit.headers.is_some() {
            parts.headers = headers_to_map(&request.headers)?;
            // Recorded header case no longer matches the map
            parts.extensions = Extensions::new();
        }
        if edit.url.is_some() {
            parts.headers.insert(HOST, host_value(target)?);
        }
        if edit.touches_framing() {
            fix_framing(&mut parts.headers, request.body.len(), false);
        }
    }

    if !parts.headers.contains_key(HOST) {
        parts.headers.insert(HOST, host_value(target)?);
    }
    for name in PROXY_HEADERS {
        parts.headers.remove(name);
    }

    Ok(Request::from_parts(parts, Full::new(request.body.clone())))
}

/// Build the response returned to the client.
///
/// Without upstream parts (a synthetic response) everything comes from the
/// snapshot.
fn build_response(
    parts: Option<response::Parts>,
    response: &ResponseSnapshot,
    edit: Option<&EditedPayload>,
    head_request: bool,
) -> Result<Response<Full<Bytes>>, String> {
    let rebuild = parts.is_none();
    let mut parts = parts.unwrap_or_else(|| Response::new(()).into_parts().0);

    if rebuild || edit.is_some_and(|e| e.status.is_some()) {
        parts.status = StatusCode::from_u16(response.status)
            .map_err(|_| format!("invalid status {}", response.status))?;
    }
    if rebuild || edit.is_some_and(|e| e.headers.is_some()) {
        parts.headers = headers_to_map(&response.headers)?;
        parts.extensions = Extensions::new();
    }
    if (rebuild || edit.is_some_and(EditedPayload::touches_framing))
        && body_allowed(parts.status, head_request)
    {
        fix_framing(&mut parts.headers, response.body.len(), true);
    }

    Ok(Response::from_parts(parts, Full::new(response.body.clone())))
}

/// Make the framing headers agree with a buffered body.
///
/// Chunked messages lose any `Content-Length`; the others get one matching
/// the body. An empty body only gets `Content-Length: 0` when
/// `declare_empty` is set or a length was already present.
fn fix_framing(headers: &mut HeaderMap, body_len: usize, declare_empty: bool) {
    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .is_ok_and(|v| v.to_ascii_lowercase().contains("chunked"))
    });

    if chunked {
        headers.remove(CONTENT_LENGTH);
        return;
    }
    if body_len > 0 || declare_empty || headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    }
}

fn body_allowed(status: StatusCode, head_request: bool) -> bool {
    !(head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn host_value(target: &Target) -> Result<HeaderValue, String> {
    HeaderValue::from_str(&target.host_header())
        .map_err(|_| format!("invalid host '{}'", target.host))
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

fn parse_url(url: &str) -> Result<Uri, String> {
    url.parse::<Uri>()
        .map_err(|e| format!("invalid URL '{}': {}", url, e))
}

/// Origin-form (`/path?query`) of an absolute URL.
fn origin_form(url: &str) -> Result<Uri, String> {
    let uri = parse_url(url)?;
    Uri::try_from(path_and_query(&uri)).map_err(|e| format!("invalid path in '{}': {}", url, e))
}

/// A `text/plain` answer from the proxy itself.
pub(crate) fn plain_response(
    status: StatusCode,
    message: &str,
    close: bool,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
    if close {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

/// Accumulates what happens to one exchange and records it exactly once.
///
/// Dropped unfinished (the client went away mid-exchange), it records the
/// exchange as abandoned.
struct ExchangeLog {
    conn: Arc<ConnectionState>,
    started_at: DateTime<Utc>,
    started: Instant,
    request: Option<RequestSnapshot>,
    request_intercept: Option<InterceptStatus>,
    response_intercept: Option<InterceptStatus>,
    error: Option<String>,
    finished: bool,
}

impl ExchangeLog {
    fn start(conn: Arc<ConnectionState>) -> Self {
        Self {
            conn,
            started_at: Utc::now(),
            started: Instant::now(),
            request: None,
            request_intercept: None,
            response_intercept: None,
            error: None,
            finished: false,
        }
    }

    /// Park a transaction in the queue and wait for its release.
    async fn pause(
        &mut self,
        direction: Direction,
        transaction: InterceptedTransaction,
    ) -> Release {
        self.set_intercept(direction, InterceptStatus::Pending);

        let queue = &self.conn.services.queue;
        let pending = queue.enqueue(transaction, self.conn.config.timeout());
        let release = pending.wait().await;

        self.set_intercept(direction, release.status());
        release
    }

    fn set_intercept(&mut self, direction: Direction, status: InterceptStatus) {
        match direction {
            Direction::Request => self.request_intercept = Some(status),
            Direction::Response => self.response_intercept = Some(status),
        }
    }

    /// Answer the client from the proxy itself and record it.
    fn local_response(
        &mut self,
        status: StatusCode,
        message: &str,
        close: bool,
    ) -> Response<Full<Bytes>> {
        let response = plain_response(status, message, close);
        self.error = Some(message.to_string());
        self.finish(Some(ResponseSnapshot {
            status: status.as_u16(),
            headers: headers_from_map(response.headers()),
            body: Bytes::from(message.to_string()),
        }));
        response
    }

    /// Synthetic response for an upstream failure.
    fn bad_gateway(&mut self, target: &Target, error: ProxyError) -> ResponseSnapshot {
        warn!("Upstream {} failed: {}", target, error);
        let body = format!("Bad Gateway: {}", error);
        self.error = Some(error.to_string());
        ResponseSnapshot {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            headers: vec![
                Header::new("content-type", "text/plain"),
                Header::new("content-length", body.len().to_string()),
            ],
            body: Bytes::from(body),
        }
    }

    /// Record an operator drop; the error closes the client connection.
    fn abandoned(&mut self) -> ProxyError {
        self.error = Some("abandoned by operator".to_string());
        self.finish(None);
        ProxyError::Abandoned
    }

    fn finish(&mut self, response: Option<ResponseSnapshot>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let Some(request) = self.request.take() else {
            return;
        };
        let size = Size {
            request_bytes: request.body.len() as u64,
            response_bytes: response.as_ref().map_or(0, |r| r.body.len() as u64),
        };

        self.conn.services.recorder.record(TrafficRecord {
            id: Uuid::new_v4(),
            connection_id: self.conn.id,
            request,
            response,
            timing: Timing {
                started_at: self.started_at,
                tls_handshake_ms: self.conn.tls_handshake_ms,
                total_ms: elapsed_ms(self.started),
            },
            size,
            request_intercept: self.request_intercept,
            response_intercept: self.response_intercept,
            error: self.error.take(),
        });
    }
}

impl Drop for ExchangeLog {
    fn drop(&mut self) {
        if self.finished || self.request.is_none() {
            return;
        }

        for status in [&mut self.request_intercept, &mut self.response_intercept] {
            if *status == Some(InterceptStatus::Pending) {
                *status = Some(InterceptStatus::Abandoned);
            }
        }
        self.error
            .get_or_insert_with(|| "client disconnected".to_string());

        debug!("Connection {}: exchange ended before completion", self.conn.id);
        self.finish(None);
    }
}
