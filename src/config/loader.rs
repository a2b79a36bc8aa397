//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. User config: `~/.config/intercept-proxy/config.toml`
//! 2. Additional config file (via `--config` flag)
//! 3. CLI flags (highest priority)
//!
//! Lists (allowed and blocked hosts) are **merged** (appended).
//! Scalars (port, timeouts, log_level) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{APP_DIR, CaConfig, Config, ProxySection};
use crate::cli::Cli;

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with the default user path.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(APP_DIR));

        Self {
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with a custom user path (for testing).
    #[must_use]
    pub fn with_paths(user_path: PathBuf) -> Self {
        Self { user_path }
    }

    /// Path of the user configuration file.
    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Load and merge configuration from all sources.
    ///
    /// A missing user config is skipped. A missing `--config` file and
    /// invalid TOML anywhere are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike the user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(Self::cli_overrides(cli));
        Ok(config)
    }

    /// CLI flags as a config layer.
    fn cli_overrides(cli: &Cli) -> Config {
        let intercept = cli.intercept || cli.intercept_responses;
        Config {
            proxy: ProxySection {
                port: cli.port,
                intercept_enabled: intercept.then_some(true),
                intercept_responses: cli.intercept_responses.then_some(true),
                allowed_hosts: cli.allow_hosts.clone(),
                blocked_hosts: cli.block_hosts.clone(),
                ..Default::default()
            },
            ca: CaConfig {
                dir: cli.ca_dir.clone(),
            },
            ..Default::default()
        }
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &PathBuf) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.clone(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn create_test_cli() -> Cli {
        Cli::parse_from(["intercept-proxy"])
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(dir.path().join("nonexistent_user.toml"));

        let config = loader.load(&create_test_cli()).unwrap();

        assert_eq!(config.proxy_config(), crate::proxy::ProxyConfig::default());
        assert!(config.general.log_level.is_empty());
    }

    #[test]
    fn test_cli_config_overrides_user() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[proxy]\nport = 8181\ntimeout_ms = 1000\n",
        )
        .unwrap();
        fs::write(dir.path().join("extra.toml"), "[proxy]\nport = 9191\n").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("user.toml"));
        let mut cli = create_test_cli();
        cli.config = Some(dir.path().join("extra.toml"));

        let proxy = loader.load(&cli).unwrap().proxy_config();

        assert_eq!(proxy.port, 9191);
        assert_eq!(proxy.timeout_ms, 1000);
    }

    #[test]
    fn test_lists_are_merged() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[proxy]\nblocked_hosts = [\"ads.example\"]\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("user.toml"));
        let mut cli = create_test_cli();
        cli.block_hosts = vec!["tracker.example".to_string()];

        let proxy = loader.load(&cli).unwrap().proxy_config();

        assert_eq!(proxy.blocked_hosts, vec!["ads.example", "tracker.example"]);
    }

    #[test]
    fn test_cli_flags_win() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[proxy]\nport = 8181\nintercept_enabled = false\n[ca]\ndir = \"/from/file\"\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("user.toml"));
        let cli = Cli::parse_from([
            "intercept-proxy",
            "--port",
            "0",
            "--intercept-responses",
            "--ca-dir",
            "/from/cli",
        ]);

        let config = loader.load(&cli).unwrap();
        let proxy = config.proxy_config();

        assert_eq!(proxy.port, 0);
        assert!(proxy.intercepts_requests());
        assert!(proxy.intercepts_responses());
        assert_eq!(config.ca_dir().unwrap(), PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(dir.path().join("user.toml"));
        let mut cli = create_test_cli();
        cli.config = Some(dir.path().join("missing.toml"));

        let err = loader.load(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "this is not valid TOML [[[").unwrap();

        let loader = ConfigLoader::with_paths(dir.path().join("user.toml"));
        let result = loader.load(&create_test_cli());

        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }
}
