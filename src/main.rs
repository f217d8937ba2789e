mod auth;
mod banner;
mod config;
mod error;
mod git;
mod ssh;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::Capabilities;
use crate::config::Config;
use crate::git::repo::RepoStore;
use crate::ssh::bridge::InFlight;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", version, about = "Git-over-SSH server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every SSH connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Pre-login check, key lookup, authorizer, and banner.
    pub capabilities: Capabilities,
    pub repos: RepoStore,
    /// Running exec bridges; shutdown waits for them.
    pub inflight: Arc<InFlight>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let capabilities = Capabilities::from_config(&config);
        let repos = RepoStore::from_config(&config);
        Self {
            config: Arc::new(config),
            capabilities,
            repos,
            inflight: Arc::new(InFlight::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Repository root and hooks ----
    config.setup().await?;

    // ---- App state ----
    let state = Arc::new(AppState::new(config));

    // ---- Serve until shutdown ----
    tokio::select! {
        result = ssh::start_ssh_server(Arc::clone(&state)) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "SSH server failed");
            }
            result?;
        }
        () = shutdown_signal() => {
            let running = state.inflight.count();
            if running > 0 {
                tracing::info!(running, "waiting for in-flight git processes");
            }
            state.inflight.wait_idle().await;
        }
    }

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
