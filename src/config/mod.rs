//! File configuration for the `intercept-proxy` binary.
//!
//! The proxy itself is configured with [`ProxyConfig`](crate::proxy::ProxyConfig)
//! snapshots. This module builds the initial snapshot from TOML files and
//! CLI flags.
//!
//! # Configuration Hierarchy
//!
//! Sources are merged in order:
//!
//! 1. User config: `~/.config/intercept-proxy/config.toml`
//! 2. Additional config file (via `--config` flag)
//! 3. CLI flags (highest priority)
//!
//! Missing files are skipped, except one named by `--config`.
//!
//! # Merge Behavior
//!
//! - **Lists** (`allowed_hosts`, `blocked_hosts`) are **merged** (appended)
//! - **Scalars** (`port`, `timeout_ms`, `log_level`, ...) are **overridden**
//!
//! # Example
//!
//! ```toml
//! [general]
//! log_level = "debug"
//!
//! [proxy]
//! port = 8181
//! intercept_enabled = true
//! blocked_hosts = ["*.ads.example"]
//! upstream_proxy = { host = "corp-proxy", port = 3128 }
//!
//! [ca]
//! dir = "/var/lib/intercept-proxy/ca"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{CaConfig, Config, GeneralConfig, ProxySection};
