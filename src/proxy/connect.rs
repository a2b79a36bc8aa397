//! Inbound connection handling.
//!
//! Every accepted socket is served by hyper's HTTP/1 server with upgrades
//! enabled, so absolute-form requests and CONNECT can share one keep-alive
//! connection. A CONNECT is answered from the host filter:
//!
//! - blocked hosts get `403 Forbidden` and the connection is closed
//! - pass-through hosts get `200` once the origin is reachable, then a
//!   blind byte tunnel
//! - every other host gets `200`, a TLS handshake presenting a leaf for the
//!   host, and HTTP/1.1 served on the decrypted stream
//!
//! hyper hands the socket back once the `200` is written. The tunnel then
//! runs in the connection's own task, so draining waits for it. Opening a
//! tunnel is raced against the shutdown signal and bounded by the
//! handshake timeout, so a stalled client cannot hold a stopping proxy open.

use super::capture::HeadCapture;
use super::error::ProxyError;
use super::filter::HostDecision;
use super::forward::{ConnectionState, handle_request, plain_response};
use super::message::{Header, RequestSnapshot, ResponseSnapshot};
use super::recorder::{Size, Timing, TrafficRecord, elapsed_ms};
use super::tls::accept_client;
use super::upstream::{Scheme, Target, open_stream};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, Join, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// The client side of a tunnel as hyper hands it back.
type ClientIo = TokioIo<Upgraded>;

/// A stream whose first bytes were already read, put back in front.
type Rewound<I> = Join<tokio::io::Chain<Cursor<Vec<u8>>, ReadHalf<I>>, WriteHalf<I>>;

/// A CONNECT answered with `200`, waiting for hyper to release the socket.
pub(crate) struct PendingTunnel {
    upgrade: OnUpgrade,
    connect: ConnectRequest,
    mode: TunnelMode,
}

enum TunnelMode {
    /// Relay bytes to this origin socket without looking at them.
    Blind(TcpStream),
    /// Terminate TLS (or read cleartext HTTP) and forward each request.
    Intercept,
}

/// What a CONNECT asked for, kept for its traffic record.
struct ConnectRequest {
    target: Target,
    headers: Vec<Header>,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// A tunnel after its first bytes.
enum Opened {
    /// Closed before anything useful happened.
    Closed,
    /// TLS terminated; HTTP/1.1 is served on the decrypted stream.
    Terminated {
        stream: Box<HeadCapture<TlsStream<Rewound<ClientIo>>>>,
        state: Arc<ConnectionState>,
    },
    /// The tunnel carries cleartext HTTP.
    Cleartext {
        stream: HeadCapture<Rewound<ClientIo>>,
        state: Arc<ConnectionState>,
    },
    /// Relayed without interception.
    Blind {
        client: ClientIo,
        upstream: TcpStream,
        connect: ConnectRequest,
    },
}

/// Serve one accepted client connection until it closes or the proxy stops.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    state: ConnectionState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let state = Arc::new(state);
    let io = HeadCapture::new(stream, state.capture.clone());
    serve_http(io, state.clone(), &mut shutdown).await?;

    let Some(tunnel) = state.take_tunnel() else {
        return Ok(());
    };

    let opened = tokio::select! {
        opened = open_tunnel(tunnel, &state) => opened?,
        _ = shutdown_signal(&mut shutdown) => {
            debug!("Connection {} closed during tunnel setup by shutdown", state.id);
            return Ok(());
        }
    };

    match opened {
        Opened::Closed => Ok(()),
        Opened::Terminated { stream, state } => serve_http(stream, state, &mut shutdown).await,
        Opened::Cleartext { stream, state } => serve_http(stream, state, &mut shutdown).await,
        Opened::Blind {
            client,
            upstream,
            connect,
        } => blind_tunnel(client, upstream, &state, connect, &mut shutdown).await,
    }
}

/// Resolves once shutdown is signalled or the signal source is gone.
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Answer a CONNECT from the host filter.
///
/// A tunnel about to open is parked on the connection state; hyper releases
/// the socket once the `200` is written.
pub(crate) async fn handle_connect(
    conn: Arc<ConnectionState>,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    let started_at = Utc::now();
    let started = Instant::now();
    let headers = conn.capture.request_headers(req.method(), req.headers());
    conn.capture.mark();

    let target = match req.uri().authority() {
        Some(authority) => Target::from_authority(Scheme::Https, authority.as_str()),
        None => Err(format!("'{}' is not a host:port authority", req.uri())),
    };
    let target = match target {
        Ok(target) => target,
        Err(message) => {
            let error = ProxyError::InvalidConnect(message);
            debug!("Connection {}: {}", conn.id, error);
            return Ok(plain_response(StatusCode::BAD_REQUEST, &error.to_string(), true));
        }
    };
    debug!("Connection {}: CONNECT {}", conn.id, target.authority());

    let connect = ConnectRequest {
        target: target.clone(),
        headers,
        started_at,
        started,
    };

    let mode = match conn.filter.evaluate(&target.host) {
        HostDecision::Block => {
            info!("Blocking CONNECT to {}", target.authority());
            let message = format!("Connection to {} is blocked", target.host);
            let status = StatusCode::FORBIDDEN;
            let error = Some(message.clone());
            record_connect(&conn, &connect, status, &message, Size::default(), error);
            return Ok(plain_response(status, &message, true));
        }
        HostDecision::PassThrough => {
            match open_stream(&target.host, target.port, &conn.config).await {
                Ok(upstream) => TunnelMode::Blind(upstream),
                Err(e) => {
                    let message = format!("Bad Gateway: {}", e);
                    let status = StatusCode::BAD_GATEWAY;
                    let error = Some(e.to_string());
                    record_connect(&conn, &connect, status, &message, Size::default(), error);
                    return Ok(plain_response(status, &message, true));
                }
            }
        }
        HostDecision::Intercept => {
            // Issue the leaf before answering; a failure closes the connection
            let ca = conn.services.ca.clone();
            let host = target.host.clone();
            let issued = tokio::task::spawn_blocking(move || ca.certificate_for_host(&host))
                .await
                .map_err(|e| ProxyError::Channel(e.to_string()))?;
            if let Err(e) = issued {
                warn!("Cannot intercept {}: {}", target.authority(), e);
                return Err(e.into());
            }
            TunnelMode::Intercept
        }
    };

    conn.park_tunnel(PendingTunnel {
        upgrade: hyper::upgrade::on(&mut req),
        connect,
        mode,
    });
    Ok(established())
}

fn established() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Wait for the socket and look at what the client sends first.
async fn open_tunnel(tunnel: PendingTunnel, state: &ConnectionState) -> Result<Opened, ProxyError> {
    let mut client = TokioIo::new(tunnel.upgrade.await?);

    if let TunnelMode::Blind(upstream) = tunnel.mode {
        return Ok(Opened::Blind {
            client,
            upstream,
            connect: tunnel.connect,
        });
    }

    let target = tunnel.connect.target;
    let handshake_timeout = state.config.handshake_timeout();

    let mut first = [0u8; 1];
    if timeout(handshake_timeout, client.read(&mut first)).await?? == 0 {
        return Ok(Opened::Closed);
    }
    let client = rewind(client, first.to_vec());

    if first[0] != TLS_HANDSHAKE_RECORD {
        debug!("Tunnel to {} carries cleartext HTTP", target.authority());
        let tunnel = state.for_tunnel(Target::new(Scheme::Http, target.host, target.port), None);
        return Ok(Opened::Cleartext {
            stream: HeadCapture::new(client, tunnel.capture.clone()),
            state: Arc::new(tunnel),
        });
    }

    let handshake_started = Instant::now();
    let ca = state.services.ca.clone();
    let tls = timeout(handshake_timeout, accept_client(ca, client, &target.host)).await??;
    debug!("TLS established with client for {}", target.authority());

    let tunnel = state.for_tunnel(target, Some(elapsed_ms(handshake_started)));
    Ok(Opened::Terminated {
        stream: Box::new(HeadCapture::new(tls, tunnel.capture.clone())),
        state: Arc::new(tunnel),
    })
}

/// Put `prefix` back in front of what is still to be read from `io`.
fn rewind<I: AsyncRead + AsyncWrite>(io: I, prefix: Vec<u8>) -> Rewound<I> {
    let (read, write) = tokio::io::split(io);
    tokio::io::join(Cursor::new(prefix).chain(read), write)
}

/// Relay bytes both ways until either side closes.
async fn blind_tunnel(
    mut client: ClientIo,
    mut upstream: TcpStream,
    state: &ConnectionState,
    connect: ConnectRequest,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    info!("Passing through {} without interception", connect.target.authority());

    let result = tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            result.map_err(ProxyError::from)
        }
        _ = shutdown_signal(shutdown) => Err(ProxyError::Shutdown),
    };

    let (size, error) = match &result {
        Ok((to_upstream, to_client)) => (
            Size {
                request_bytes: *to_upstream,
                response_bytes: *to_client,
            },
            None,
        ),
        Err(e) => (Size::default(), Some(e.to_string())),
    };
    record_connect(state, &connect, StatusCode::OK, "", size, error);

    debug!("Tunnel closed for {}", connect.target.authority());
    result.map(|_| ())
}

/// Record a CONNECT exchange answered by the proxy itself.
fn record_connect(
    state: &ConnectionState,
    connect: &ConnectRequest,
    status: StatusCode,
    body: &str,
    size: Size,
    error: Option<String>,
) {
    let headers = if body.is_empty() {
        Vec::new()
    } else {
        vec![
            Header::new("content-type", "text/plain"),
            Header::new("content-length", body.len().to_string()),
        ]
    };
    let size = Size {
        response_bytes: size.response_bytes.max(body.len() as u64),
        ..size
    };

    state.services.recorder.record(TrafficRecord {
        id: Uuid::new_v4(),
        connection_id: state.id,
        request: RequestSnapshot {
            method: "CONNECT".to_string(),
            url: connect.target.authority(),
            headers: connect.headers.clone(),
            body: Bytes::new(),
        },
        response: Some(ResponseSnapshot {
            status: status.as_u16(),
            headers,
            body: Bytes::from(body.to_string()),
        }),
        timing: Timing {
            started_at: connect.started_at,
            tls_handshake_ms: None,
            total_ms: elapsed_ms(connect.started),
        },
        size,
        request_intercept: None,
        response_intercept: None,
        error,
    });
}

/// Serve HTTP/1.1 on `io`, finishing in-flight exchanges on shutdown.
///
/// Returns once the connection closes or a CONNECT took the socket over.
async fn serve_http<I>(
    io: I,
    state: Arc<ConnectionState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProxyError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let header_timeout = state.config.handshake_timeout();

    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { handle_request(state, req).await }
    });

    let mut builder = http1::Builder::new();
    builder
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout);

    let connection = builder
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => return result.map_err(ProxyError::from),
        _ = shutdown_signal(shutdown) => {}
    }

    connection.as_mut().graceful_shutdown();
    connection.await.map_err(ProxyError::from)
}
