//! intercept-proxy: HTTP/TLS intercepting proxy
//!
//! This is the main entry point for the intercept-proxy binary. It handles
//! CLI argument parsing, configuration loading and logging setup, then runs
//! the operator bridge until stdin closes or the process is interrupted.
//!
//! # I/O Architecture
//!
//! - **stdin**: operator commands, one JSON object per line
//! - **stdout**: command replies and proxy events, one JSON object per line
//! - **stderr**: human-readable logs, so stdout stays machine-readable

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use intercept_proxy::{
    ca::{CaStore, CertificateAuthority},
    cli::Cli,
    config::ConfigLoader,
    control::{OperatorBridge, create_event_channel},
    proxy::ProxyController,
};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Loaded configuration: {:?}", config);

    let proxy_config = config.proxy_config();
    proxy_config.validate().context("Invalid proxy configuration")?;

    let ca_dir = config.ca_dir().context("Failed to locate the CA directory")?;
    let store = CaStore::new(&ca_dir);
    info!("Root CA store: {}", store.cert_path().display());
    let ca = Arc::new(CertificateAuthority::with_store(store));

    let (events, events_rx) = create_event_channel();
    let controller = Arc::new(ProxyController::new(ca.clone(), events));

    if cli.no_autostart {
        info!("Waiting for a proxy-start command");
    } else {
        // Load or create the root before the first CONNECT needs it
        tokio::task::spawn_blocking(move || ca.root_certificate())
            .await
            .context("Root CA task failed")?
            .context("Failed to load the root CA")?;

        let addr = controller
            .start(proxy_config)
            .await
            .context("Failed to start the proxy")?;
        info!("Proxy listening on {}", addr);
    }

    let bridge = OperatorBridge::new(controller.clone());
    let session = bridge.run(tokio::io::stdin(), tokio::io::stdout(), events_rx);

    let result = tokio::select! {
        result = session => result.context("Operator bridge failed"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for interrupt: {}", e);
            }
            info!("Interrupted");
            Ok(())
        }
    };

    controller.stop().await;
    result
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr; stdout carries the operator protocol.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `[general] log_level`, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if log_level.is_empty() { "warn" } else { log_level };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(fallback))
            .context("Invalid log level")?,
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
