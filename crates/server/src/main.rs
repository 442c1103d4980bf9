use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod config;
mod websocket;

use config::{AppState, ServerConfig};
use nvent_core::NventService;

#[derive(Parser, Debug)]
#[command(name = "nvent")]
#[command(about = "Event-driven flow runtime", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nvent.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "NVENT_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "4020", env = "NVENT_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "NVENT_HOST")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nvent=info,tower_http=warn".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("Starting nvent flow runtime");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    let store = config.open_store()?;

    // Flows and handlers are registered by embedding nvent-core; the
    // standalone binary serves whatever the store already holds.
    let service = Arc::new(
        NventService::builder()
            .config(config.runtime.clone())
            .store(store)
            .build()
            .await?,
    );

    let (state, shutdown_tx) = AppState::new(service.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "shutdown signal handler failed");
        }
        tracing::info!("Shutting down");
        let _ = shutdown_tx.send(true);
    };

    api::serve(&addr, state, shutdown).await?;
    service.shutdown();

    Ok(())
}
