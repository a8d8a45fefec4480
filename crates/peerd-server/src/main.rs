use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use peerd_core::{ProcessRunner, SystemRunner};
use peerd_server::{build_api, build_manager, listen_addrs, report_drift, ServerConfig};

/// dn42 peering daemon - configures WireGuard tunnels and BGP sessions on request
#[derive(Parser, Debug)]
#[command(name = "peerd")]
#[command(about = "Automated dn42 peering daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "peerd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("peerd=info".parse()?)
                .add_directive("peerd_server=info".parse()?)
                .add_directive("peerd_core=info".parse()?)
                .add_directive("peerd_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting peerd with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner::new(config.command_timeout));
    let manager = build_manager(&config, runner)?;
    report_drift(&manager).await;

    let api = build_api(&config.api, manager.clone())?;

    let mut servers = JoinSet::new();
    for addr in listen_addrs(&config.api) {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind API listener on {}", addr))?;
        servers.spawn(api.clone().run_with_listener(listener));
    }
    if servers.is_empty() {
        bail!("No API listen address configured");
    }

    tokio::select! {
        Some(result) = servers.join_next() => {
            tracing::error!("API listener stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }
    servers.abort_all();

    if let Err(e) = manager.flush().await {
        tracing::error!("Failed to flush peer registry: {}", e);
    }

    tracing::info!("peerd shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
