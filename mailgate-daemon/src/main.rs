//! Mailgate Daemon
//!
//! Tool server that performs mail operations for local clients. Every
//! request goes through the shared operation guard; the vault password is
//! taken from the inherited environment or prompted for once.
//!
//! # Running
//!
//! ```bash
//! mailgate launch -- mailgated      # password inherited from the launcher
//! mailgated                         # standalone, prompts on first use
//! ```

use anyhow::Result;
use mailgate_daemon::{ApiState, DaemonConfig, config, start_server};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    init_logging(&config.log_level);

    info!("Starting mailgate daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    run_daemon(config).await
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!(
        "Using credentials {:?} and token cache {:?}",
        config.auth.credentials_path, config.auth.token_path
    );

    let state = ApiState::gmail(config.auth.clone());
    let guard = state.guard.clone();

    let server_handle = start_server(&config.socket_path, state).await?;

    // Requests arriving meanwhile queue behind this attempt.
    if config.authenticate_on_start {
        tokio::spawn(async move {
            match guard.warm_up().await {
                Ok(output) => info!(
                    generation = output.result.generation,
                    correlation_id = %output.correlation_id,
                    "Authenticated at startup"
                ),
                Err(e) => error!("Startup authentication failed, will retry on first request: {}", e),
            }
        });
    }

    info!("Daemon running on {:?}. Press Ctrl+C to stop.", config.socket_path);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    server_handle.stop().await?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
        info!("Socket file removed");
    }

    info!("Daemon stopped");
    Ok(())
}
