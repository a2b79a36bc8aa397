//! Configuration schema definitions.
//!
//! Every field is optional in a file so that later sources only override
//! what they actually set. [`Config::proxy_config`] resolves the merged
//! result into a [`ProxyConfig`] snapshot on top of its defaults.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use super::error::ConfigError;
use crate::proxy::{ProxyConfig, UpstreamProxy};

/// Application directory name under the platform config and data dirs.
pub const APP_DIR: &str = "intercept-proxy";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Proxy settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Certificate authority settings.
    #[serde(default)]
    pub ca: CaConfig,
}

impl Config {
    /// Merge another configuration into this one.
    ///
    /// Lists are appended and scalars set in `other` override.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.proxy.merge(other.proxy);
        self.ca.merge(other.ca);
    }

    /// Resolve the `[proxy]` section into a proxy snapshot.
    pub fn proxy_config(&self) -> ProxyConfig {
        self.proxy.resolve(ProxyConfig::default())
    }

    /// Directory of the persisted root CA.
    ///
    /// Defaults to `intercept-proxy/ca` under the user data directory.
    pub fn ca_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.ca.dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join(APP_DIR).join("ca"))
            .ok_or(ConfigError::NoDataDirectory)
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level used when neither `-v` nor `RUST_LOG` is given.
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// The `[proxy]` section: [`ProxyConfig`] fields in snake_case.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProxySection {
    /// Listening port.
    pub port: Option<u16>,

    /// Listening address.
    pub bind_address: Option<IpAddr>,

    /// Master switch for interception.
    pub intercept_enabled: Option<bool>,

    /// Pause requests while interception is enabled.
    pub intercept_requests: Option<bool>,

    /// Pause responses while interception is enabled.
    pub intercept_responses: Option<bool>,

    /// Chain outbound connections through another HTTP proxy.
    pub upstream_proxy: Option<UpstreamProxy>,

    /// Hosts to terminate and intercept (all when empty).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Hosts refused with `403 Forbidden`.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Operator wait before a paused transaction is forwarded unchanged.
    pub timeout_ms: Option<u64>,

    /// Time in-flight connections get to finish on stop.
    pub drain_grace_ms: Option<u64>,

    /// Bound on CONNECT parsing and TLS handshakes.
    pub handshake_timeout_ms: Option<u64>,

    /// Skip certificate verification on the outbound TLS leg.
    pub accept_invalid_upstream_certs: Option<bool>,

    /// Number of traffic records retained.
    pub record_capacity: Option<usize>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        // Lists are appended
        self.allowed_hosts.extend(other.allowed_hosts);
        self.blocked_hosts.extend(other.blocked_hosts);

        // Scalars are overridden when set
        macro_rules! override_set {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        override_set!(
            port,
            bind_address,
            intercept_enabled,
            intercept_requests,
            intercept_responses,
            upstream_proxy,
            timeout_ms,
            drain_grace_ms,
            handshake_timeout_ms,
            accept_invalid_upstream_certs,
            record_capacity,
        );
    }

    /// Apply the fields set in this section on top of `base`.
    pub fn resolve(&self, base: ProxyConfig) -> ProxyConfig {
        let mut config = base;
        config.allowed_hosts.extend(self.allowed_hosts.iter().cloned());
        config.blocked_hosts.extend(self.blocked_hosts.iter().cloned());

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.bind_address = addr;
        }
        if let Some(v) = self.intercept_enabled {
            config.intercept_enabled = v;
        }
        if let Some(v) = self.intercept_requests {
            config.intercept_requests = v;
        }
        if let Some(v) = self.intercept_responses {
            config.intercept_responses = v;
        }
        if let Some(upstream) = &self.upstream_proxy {
            config.upstream_proxy = Some(upstream.clone());
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.drain_grace_ms {
            config.drain_grace_ms = v;
        }
        if let Some(v) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = v;
        }
        if let Some(v) = self.accept_invalid_upstream_certs {
            config.accept_invalid_upstream_certs = v;
        }
        if let Some(v) = self.record_capacity {
            config.record_capacity = v;
        }
        config
    }
}

/// Certificate authority settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CaConfig {
    /// Directory holding `ca.crt` and `ca.key`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl CaConfig {
    fn merge(&mut self, other: CaConfig) {
        if other.dir.is_some() {
            self.dir = other.dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::DEFAULT_TIMEOUT_MS;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"

            [proxy]
            port = 8181
            bind_address = "0.0.0.0"
            intercept_enabled = true
            blocked_hosts = ["*.ads.example"]
            upstream_proxy = { host = "corp-proxy", port = 3128 }

            [ca]
            dir = "/tmp/ca"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.ca.dir, Some(PathBuf::from("/tmp/ca")));

        let proxy = config.proxy_config();
        assert_eq!(proxy.listen_addr().to_string(), "0.0.0.0:8181");
        assert!(proxy.intercepts_requests());
        assert_eq!(proxy.blocked_hosts, vec!["*.ads.example"]);
        assert_eq!(proxy.upstream_proxy.unwrap().authority(), "corp-proxy:3128");
        assert_eq!(proxy.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_empty_config_resolves_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.proxy_config(), ProxyConfig::default());
    }

    #[test]
    fn test_merge_appends_lists_and_overrides_scalars() {
        let mut base: Config = toml::from_str(
            r#"
            [general]
            log_level = "info"
            [proxy]
            port = 8181
            timeout_ms = 1000
            blocked_hosts = ["a.example"]
            "#,
        )
        .unwrap();
        let other: Config = toml::from_str(
            r#"
            [proxy]
            port = 9090
            blocked_hosts = ["b.example"]
            "#,
        )
        .unwrap();

        base.merge(other);

        assert_eq!(base.general.log_level, "info");
        assert_eq!(base.proxy.port, Some(9090));
        assert_eq!(base.proxy.timeout_ms, Some(1000));
        assert_eq!(base.proxy.blocked_hosts, vec!["a.example", "b.example"]);
    }

    #[test]
    fn test_explicit_ca_dir_wins() {
        let config = Config {
            ca: CaConfig {
                dir: Some(PathBuf::from("/srv/ca")),
            },
            ..Default::default()
        };
        assert_eq!(config.ca_dir().unwrap(), PathBuf::from("/srv/ca"));
    }
}
