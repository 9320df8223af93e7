//! Tailview: real-time log tail streaming daemon
//!
//! Clients connect over TCP, list files with glob patterns, and stream the
//! tail of any number of files concurrently as newline-delimited JSON.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tailview::auth::TokenGate;
use tailview::config;
use tailview::engine::TailEngine;
use tailview::registry::SessionRegistry;
use tailview::server::{self, ServerContext};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "tailview", about = "Tailview log streaming daemon")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file path (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(long)]
    bind: Option<String>,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("TAILVIEW_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let bind = cli.bind.unwrap_or_else(|| config.bind_addr.clone());

    let engine = TailEngine::new(Duration::from_millis(config.poll_interval_ms));
    let registry = SessionRegistry::new(engine);
    let ctx = Arc::new(ServerContext {
        registry,
        auth: Arc::new(TokenGate::new(config.auth_token.clone())),
        search_root: PathBuf::from(&config.search_root),
        ignores: config.ignores.clone(),
    });

    if let Err(e) = server::start(&bind, ctx).await {
        tracing::error!("server failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["tailview"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
        assert!(cli.bind.is_none());
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::try_parse_from(["tailview", "-v"]).unwrap();
        assert_eq!(cli.verbose, 1);
        let cli = Cli::try_parse_from(["tailview", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn cli_bind_override() {
        let cli = Cli::try_parse_from(["tailview", "--bind", "0.0.0.0:9000"]).unwrap();
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0:9000"));
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::try_parse_from(["tailview", "--config", "/etc/tailview.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tailview.json")));
    }
}
