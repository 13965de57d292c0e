//! gatemux CLI — bridges an upstream MCP client to many supervised backend
//! MCP servers over stdio.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gatemux::{GatewayConfig, GatewayDispatcher, GatewayRegistry, SecurityMonitor};
use tokio::io::{stdin, stdout, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gatemux", about = "MCP gateway over stdio")]
struct Args {
    /// Path to the gateway's TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log level, overriding RUST_LOG. Defaults to "info".
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config_text = match std::fs::read_to_string(&args.config) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(path = %args.config.display(), error = %e, "failed to read config file");
            std::process::exit(1);
        }
    };
    let config: GatewayConfig = match toml::from_str(&config_text) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse config file");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let levels = config
        .backends
        .iter()
        .filter_map(|(name, backend)| backend.security_level.map(|level| (name.clone(), level)))
        .collect();
    let security = Arc::new(SecurityMonitor::new(config.security_policy.clone(), levels));

    let registry = match GatewayRegistry::from_config(config).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "failed to build backend registry");
            std::process::exit(1);
        }
    };

    tracing::info!(backends = registry.backend_count().await, "gatemux ready");

    let dispatcher = GatewayDispatcher::new(registry.clone(), security);
    let reader = BufReader::new(stdin());
    let result = dispatcher.run(reader, stdout()).await;

    registry.shutdown().await;

    match result {
        Ok(()) => {
            tracing::info!("upstream closed, shutting down");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal runtime error");
            std::process::exit(2);
        }
    }
}
