//! vigild - Vigilant Eye detection server
//!
//! This daemon:
//! 1. Loads configuration (JSON file, `.env`, environment)
//! 2. Loads the violence classifier and weapon detector once
//! 3. Serves uploads for offline processing and processed videos
//! 4. Runs live camera or browser detection per WebSocket connection
//! 5. Sends SMS alerts through Twilio (or logs them when unconfigured)

use anyhow::Result;
use std::sync::Arc;

use vigilant_eye::api::{self, AppState};
use vigilant_eye::config::VigilConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Ok(path) = dotenv {
        log::info!("loaded environment from {}", path.display());
    }

    let cfg = VigilConfig::load()?;
    log::info!(
        "uploads in {}, processed videos in {}",
        cfg.upload_dir.display(),
        cfg.processed_dir.display()
    );
    let state = Arc::new(AppState::from_config(&cfg)?);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.addr).await?;
    log::info!("vigild listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("vigild stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {}", err);
        return;
    }
    log::info!("shutdown signal received, draining connections...");
}
