//! Command-line interface definitions for intercept-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// HTTP/TLS intercepting proxy driven over stdin/stdout.
///
/// intercept-proxy listens for HTTP and HTTPS (via CONNECT) traffic,
/// terminates TLS with certificates from its own root CA, and lets an
/// operator process pause, edit, or drop requests and responses. Commands
/// are read as JSON lines on stdin; replies and events are written as JSON
/// lines on stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "intercept-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Listening port (0 picks an ephemeral port).
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to additional config file.
    ///
    /// Merged on top of the user config, giving it the highest priority
    /// except for CLI flags.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable interception of requests.
    #[arg(long = "intercept")]
    pub intercept: bool,

    /// Also pause responses (implies --intercept).
    #[arg(long = "intercept-responses")]
    pub intercept_responses: bool,

    /// Only terminate and intercept this host (repeatable, wildcards allowed).
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_hosts: Vec<String>,

    /// Refuse this host with 403 (repeatable, wildcards allowed).
    #[arg(long = "block-host", value_name = "HOST")]
    pub block_hosts: Vec<String>,

    /// Directory holding the root CA (`ca.crt`, `ca.key`).
    #[arg(long = "ca-dir", value_name = "DIR")]
    pub ca_dir: Option<PathBuf>,

    /// Wait for a `proxy-start` command instead of listening immediately.
    #[arg(long = "no-autostart")]
    pub no_autostart: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
