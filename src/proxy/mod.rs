//! Intercepting HTTP/HTTPS proxy.
//!
//! This module provides:
//! - An HTTP/1.1 forward proxy for absolute-form requests
//! - CONNECT tunneling with TLS termination using leaves from the
//!   [`CertificateAuthority`](crate::ca::CertificateAuthority)
//! - Host filtering (intercept, pass through blind, or block)
//! - Pausing requests and responses for an operator to inspect or edit
//! - A record of every finished exchange
//! - Optional chaining through an upstream HTTP proxy
//!
//! # Architecture
//!
//! ```text
//!            ┌───────────────────────────── ProxyController ─────────────────────────────┐
//!            │                                                                           │
//! client ───►│ accept ──► connect ──► forward ──► InterceptionQueue ──► UpstreamSession ─┼► origin
//!            │            (CONNECT,   (filter,    (operator pause)      (direct or via    │
//!            │             TLS)        buffer)                           upstream proxy)  │
//!            │                           │                                               │
//!            │                           └──────────► TrafficRecorder                    │
//!            └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operator-facing events (paused transactions, cancellations, records,
//! state changes) leave through an [`EventSink`](crate::control::EventSink).

mod capture;
pub mod config;
mod connect;
pub mod error;
pub mod filter;
mod forward;
pub mod intercept;
pub mod message;
pub mod recorder;
pub mod server;
pub mod tls;
pub mod upstream;

// Re-export main types for convenient access
pub use config::{ProxyConfig, UpstreamProxy};
pub use error::ProxyError;
pub use filter::{HostDecision, HostFilter};
pub use intercept::{
    Direction, InterceptError, InterceptStatus, InterceptedTransaction, InterceptionQueue,
    PendingRelease, Release,
};
pub use message::{EditedPayload, Header, RequestSnapshot, ResponseSnapshot};
pub use recorder::{Size, Timing, TrafficRecord, TrafficRecorder};
pub use server::{ProxyController, ProxyState};
pub use tls::{UpstreamConnectors, accept_client, create_tls_connector};
pub use upstream::{Scheme, Target};
