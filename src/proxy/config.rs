//! Runtime configuration of a proxy instance.
//!
//! A [`ProxyConfig`] is an immutable snapshot: the controller swaps whole
//! snapshots on reconfiguration and every connection keeps the one that was
//! active when it was accepted.
//!
//! The JSON form uses camelCase field names:
//!
//! ```json
//! {
//!   "port": 8181,
//!   "interceptEnabled": true,
//!   "interceptResponses": true,
//!   "blockedHosts": ["*.ads.example"],
//!   "timeoutMs": 60000
//! }
//! ```

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default time an intercepted transaction waits for the operator.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Default time in-flight connections get to finish on stop.
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 5_000;

/// Default bound on CONNECT parsing and TLS handshakes.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default number of retained traffic records.
pub const DEFAULT_RECORD_CAPACITY: usize = 1_000;

/// Proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Listening port. `0` binds an ephemeral port.
    pub port: u16,

    /// Listening address.
    pub bind_address: IpAddr,

    /// Master switch for interception.
    pub intercept_enabled: bool,

    /// Pause requests while interception is enabled.
    pub intercept_requests: bool,

    /// Pause responses while interception is enabled.
    pub intercept_responses: bool,

    /// Chain outbound connections through another HTTP proxy.
    pub upstream_proxy: Option<UpstreamProxy>,

    /// When non-empty, only these hosts are terminated and intercepted.
    ///
    /// Supports wildcards: `*.example.com` matches `api.example.com`.
    pub allowed_hosts: Vec<String>,

    /// Hosts refused with `403 Forbidden`.
    pub blocked_hosts: Vec<String>,

    /// How long an intercepted transaction waits for the operator before
    /// it is forwarded unchanged.
    pub timeout_ms: u64,

    /// How long in-flight connections get to finish on stop.
    pub drain_grace_ms: u64,

    /// Bound on reading the CONNECT head and on the TLS handshake.
    pub handshake_timeout_ms: u64,

    /// Skip certificate verification on the outbound TLS leg.
    pub accept_invalid_upstream_certs: bool,

    /// Number of traffic records retained. `0` keeps everything.
    pub record_capacity: usize,
}

/// Address of an upstream HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxy {
    /// Proxy host name or address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

impl UpstreamProxy {
    /// `host:port` of the upstream proxy.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            intercept_enabled: false,
            intercept_requests: true,
            intercept_responses: false,
            upstream_proxy: None,
            allowed_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            accept_invalid_upstream_certs: false,
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }
}

impl ProxyConfig {
    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeoutMs", "must be greater than zero"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(invalid("handshakeTimeoutMs", "must be greater than zero"));
        }

        if let Some(upstream) = &self.upstream_proxy {
            if upstream.host.trim().is_empty() {
                return Err(invalid("upstreamProxy.host", "must not be empty"));
            }
            if upstream.port == 0 {
                return Err(invalid("upstreamProxy.port", "must not be zero"));
            }
        }

        for (field, patterns) in [
            ("allowedHosts", &self.allowed_hosts),
            ("blockedHosts", &self.blocked_hosts),
        ] {
            for pattern in patterns {
                validate_pattern(pattern).map_err(|message| invalid(field, &message))?;
            }
        }

        Ok(())
    }

    /// Address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Whether requests are paused for the operator.
    pub fn intercepts_requests(&self) -> bool {
        self.intercept_enabled && self.intercept_requests
    }

    /// Whether responses are paused for the operator.
    pub fn intercepts_responses(&self) -> bool {
        self.intercept_enabled && self.intercept_responses
    }

    /// Interception wait as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Drain grace period as a duration.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Handshake bound as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Host patterns are exact names or a leading `*.` wildcard.
fn validate_pattern(pattern: &str) -> Result<(), String> {
    let name = pattern.strip_prefix("*.").unwrap_or(pattern);
    if name.is_empty() {
        return Err(format!("empty host pattern '{}'", pattern));
    }
    if name.contains('*') {
        return Err(format!(
            "'{}': wildcards are only allowed as a leading '*.'",
            pattern
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(format!("'{}' is not a host name", pattern));
    }
    Ok(())
}
