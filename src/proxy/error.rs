//! Error types for proxy operations.
//!
//! - Server errors (bind, accept, lifecycle)
//! - TLS errors (certificate issuance, handshake)
//! - Connection errors (CONNECT parsing, upstream connection, forwarding)
//! - Interception errors (abandoned transactions)

use crate::ca::CaError;
use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Leaf or root certificate could not be produced.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CaError),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The proxy configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An operation exceeded its deadline.
    #[error("Connection timeout")]
    Timeout,

    /// An intercepted transaction was dropped instead of forwarded.
    #[error("Intercepted transaction abandoned")]
    Abandoned,

    /// A blocking task could not be joined.
    #[error("Background task failed: {0}")]
    Channel(String),

    /// Server shutdown requested.
    #[error("Server shutdown")]
    Shutdown,
}

impl ProxyError {
    /// Whether this error is the peer going away, which is routine for a
    /// proxy and not worth more than a debug line.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            ProxyError::Http(e) => {
                e.is_incomplete_message() || e.is_canceled() || e.is_closed() || e.is_user()
            }
            ProxyError::Abandoned | ProxyError::Shutdown => true,
            _ => false,
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}
