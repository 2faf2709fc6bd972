//! ts2021-server: TS2021 control server.
//!
//! Accepts HTTP/1.1 connections, upgrades them to the Noise control
//! channel and serves node registration and map polling.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use ts2021_core::MachinePrivate;
use ts2021_server::{ControlServer, ServerConfig};

/// ts2021-server: TS2021 control server
#[derive(Parser, Debug)]
#[command(name = "ts2021-server", version, about = "TS2021 control server")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Public URL clients use to reach this server
    #[arg(long)]
    server_url: Option<String>,

    /// Noise private key file (created if missing)
    #[arg(long)]
    noise_key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ts2021/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ts2021-server");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "server failed");
        std::process::exit(1);
    }

    info!("ts2021-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.server_url.as_deref(),
        cli.noise_key.as_deref(),
    )
    .context("failed to load config")?;

    let noise_key = MachinePrivate::load_or_generate(&config.noise_private_key_path).with_context(|| {
        format!(
            "failed to load noise private key {}",
            config.noise_private_key_path.display()
        )
    })?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let server = ControlServer::from_config(&config, noise_key);
    let shutdown = server.shutdown_token();
    let mut task = tokio::spawn(server.run(listener));

    // Run until shutdown signal
    tokio::select! {
        result = &mut task => {
            return result.context("server task panicked")?.context("server error");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    shutdown.cancel();
    task.await.context("server task panicked")??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
