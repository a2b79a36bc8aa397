//! Outbound connections to origins.
//!
//! Each inbound connection owns one [`UpstreamSession`]: a hyper HTTP/1
//! client connection to the current target, reopened when the origin closes
//! it or when the target changes (a plain-HTTP client talking to several
//! hosts over one keep-alive connection, or an operator editing the URL).
//!
//! With an upstream proxy configured, the TCP leg goes to that proxy and is
//! chained with `CONNECT host:port` before anything else is sent, for plain
//! HTTP and HTTPS targets alike.

use super::capture::{CaptureBuf, HeadCapture};
use super::config::{ProxyConfig, UpstreamProxy};
use super::error::ProxyError;
use super::message::Header;
use super::tls::{UpstreamConnectors, domain_to_server_name};
use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Transport of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Default port of the scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// URL scheme name.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// An origin the proxy connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Transport.
    pub scheme: Scheme,
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Target {
    /// Create a target.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Target of an absolute `http://` or `https://` URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, String> {
        let scheme = match uri.scheme_str().map(str::to_ascii_lowercase).as_deref() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => return Err(format!("unsupported scheme '{}'", other)),
            None => return Err(format!("'{}' is not an absolute URL", uri)),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| format!("'{}' has no host", uri))?;

        Self::from_authority(scheme, authority.as_str())
    }

    /// Target of a `host[:port]` authority.
    pub fn from_authority(scheme: Scheme, authority: &str) -> Result<Self, String> {
        // Strip any userinfo
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = parse_host_port(authority, scheme.default_port())?;
        Ok(Self::new(scheme, host, port))
    }

    /// `host:port`, with brackets around IPv6 literals.
    pub fn authority(&self) -> String {
        format!("{}:{}", bracket(&self.host), self.port)
    }

    /// Value for a `Host` header: the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            bracket(&self.host)
        } else {
            self.authority()
        }
    }

    /// Absolute URL of `path_and_query` on this target.
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.host_header(), path_and_query)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Parse `host:port`, `[v6]:port`, or a bare host with `default_port`.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", default_port)
/// - `[::1]:8443` -> ("::1", 8443)
pub fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), String> {
    let authority = authority.trim();

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", authority))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(format!("invalid authority '{}'", authority)),
        }
    } else {
        match authority.rsplit_once(':') {
            // A second colon means a bare IPv6 literal without port
            Some((host, _)) if host.contains(':') => (authority, None),
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in '{}'", authority));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port '{}'", port))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

/// Byte stream to an origin, plain or TLS.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Open a TCP stream to `host:port`, through the upstream proxy if one is
/// configured. Bounded by the handshake timeout.
pub async fn open_stream(
    host: &str,
    port: u16,
    config: &ProxyConfig,
) -> Result<TcpStream, ProxyError> {
    let addr = format!("{}:{}", bracket(host), port);

    let connect = async {
        match &config.upstream_proxy {
            Some(proxy) => connect_via_proxy(proxy, host, port).await,
            None => TcpStream::connect((host, port))
                .await
                .map_err(|e| upstream_error(&addr, e)),
        }
    };

    let stream = timeout(config.handshake_timeout(), connect)
        .await
        .map_err(|_| upstream_error(&addr, "connect timed out"))??;

    // Best effort; small request/response exchanges dominate
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Open a tunnel to `host:port` through an HTTP proxy.
///
/// The CONNECT exchange runs over hyper's HTTP/1 client; once the proxy
/// answers 2xx the socket is taken back out of the upgrade.
async fn connect_via_proxy(
    proxy: &UpstreamProxy,
    host: &str,
    port: u16,
) -> Result<TcpStream, ProxyError> {
    let proxy_addr = proxy.authority();
    let stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| upstream_error(&proxy_addr, e))?;

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!("CONNECT exchange with upstream proxy failed: {}", e);
        }
    });

    let authority = format!("{}:{}", bracket(host), port);
    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(HOST, authority.as_str())
        .header("proxy-connection", "keep-alive")
        .body(Empty::<Bytes>::new())
        .map_err(|e| upstream_error(&proxy_addr, e))?;

    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        return Err(upstream_error(
            &proxy_addr,
            format!("CONNECT {} refused: {}", authority, response.status()),
        ));
    }

    let upgraded = hyper::upgrade::on(response).await?;
    let parts = upgraded
        .downcast::<TokioIo<TcpStream>>()
        .map_err(|_| upstream_error(&proxy_addr, "tunnel is not a TCP stream"))?;
    if !parts.read_buf.is_empty() {
        return Err(upstream_error(
            &proxy_addr,
            "proxy sent data before the tunnel opened",
        ));
    }

    debug!("Tunnel to {} open via upstream proxy {}", authority, proxy_addr);
    Ok(parts.io.into_inner())
}

fn upstream_error(addr: &str, message: impl ToString) -> ProxyError {
    ProxyError::UpstreamConnect {
        addr: addr.to_string(),
        message: message.to_string(),
    }
}

/// Client connection from one inbound connection to its current origin.
#[derive(Default)]
pub struct UpstreamSession {
    target: Option<Target>,
    sender: Option<http1::SendRequest<Full<Bytes>>>,
    capture: CaptureBuf,
}

impl UpstreamSession {
    /// A session with no open connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `request` to `target`, opening or reopening the connection as
    /// needed.
    ///
    /// Returns the response with its headers as the origin spelled them.
    pub async fn send(
        &mut self,
        target: &Target,
        request: Request<Full<Bytes>>,
        config: &ProxyConfig,
        connectors: &UpstreamConnectors,
    ) -> Result<(Response<Incoming>, Vec<Header>), ProxyError> {
        let reusable = self.target.as_ref() == Some(target)
            && self.sender.as_ref().is_some_and(|s| !s.is_closed());

        let mut sender = match self.sender.take() {
            Some(sender) if reusable => sender,
            _ => {
                self.target = None;
                self.reconnect(target, config, connectors).await?
            }
        };

        if sender.ready().await.is_err() {
            debug!("Upstream connection to {} went away, reconnecting", target);
            sender = self.reconnect(target, config, connectors).await?;
        }

        self.target = Some(target.clone());
        self.capture.mark();
        let response = sender.send_request(request).await;
        self.sender = Some(sender);

        let response = response?;
        let headers = self
            .capture
            .response_headers(response.status(), response.headers());
        Ok((response, headers))
    }

    async fn reconnect(
        &mut self,
        target: &Target,
        config: &ProxyConfig,
        connectors: &UpstreamConnectors,
    ) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        self.capture = CaptureBuf::default();
        connect(target, config, connectors, self.capture.clone()).await
    }
}

/// Open a connection to `target` and run the HTTP/1 client handshake.
async fn connect(
    target: &Target,
    config: &ProxyConfig,
    connectors: &UpstreamConnectors,
    capture: CaptureBuf,
) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
    let tcp = open_stream(&target.host, target.port, config).await?;

    let io: Box<dyn UpstreamIo> = match target.scheme {
        Scheme::Http => Box::new(tcp),
        Scheme::Https => {
            let connector = connectors.get(config.accept_invalid_upstream_certs)?;
            let server_name = domain_to_server_name(&target.host)?;
            let tls = timeout(config.handshake_timeout(), connector.connect(server_name, tcp))
                .await
                .map_err(|_| upstream_error(&target.authority(), "TLS handshake timed out"))?
                .map_err(|e| {
                    upstream_error(&target.authority(), format!("TLS handshake failed: {}", e))
                })?;
            Box::new(tls)
        }
    };

    let (sender, connection) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(HeadCapture::new(io, capture)))
        .await?;

    let target_name = target.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection to {} ended: {}", target_name, e);
        }
    });

    debug!("Connected to upstream {}", target);
    Ok(sender)
}
