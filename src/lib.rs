//! intercept-proxy: HTTP/TLS intercepting proxy with operator-driven editing
//!
//! This crate provides a local forward proxy that terminates TLS with
//! certificates issued by its own root CA, so an operator can inspect,
//! edit, or drop requests and responses before they continue.
//!
//! # Architecture
//!
//! - **CA**: Root generation and persistence, per-host leaf certificates
//!   issued single-flight and cached
//! - **Proxy**: Listener, CONNECT handling, TLS termination, forwarding,
//!   the interception queue and the traffic recorder, all owned by a
//!   [`ProxyController`](proxy::ProxyController)
//! - **Control**: Operator events and the newline-delimited JSON bridge
//! - **Config**: TOML configuration with hierarchy merging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intercept_proxy::ca::CertificateAuthority;
//! use intercept_proxy::control::create_event_channel;
//! use intercept_proxy::proxy::{ProxyConfig, ProxyController};
//!
//! # async fn run() -> Result<(), intercept_proxy::proxy::ProxyError> {
//! let (events, mut rx) = create_event_channel();
//! let controller = ProxyController::new(Arc::new(CertificateAuthority::new()), events);
//!
//! let addr = controller
//!     .start(ProxyConfig { port: 0, intercept_enabled: true, ..Default::default() })
//!     .await?;
//! println!("listening on {addr}");
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod control;
pub mod proxy;
