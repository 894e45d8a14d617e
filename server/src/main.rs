//! Screenwatch server – collects live frames and recordings from producer
//! machines and serves them to viewers.
//!
//! This binary:
//! 1. Reads configuration from `screenwatch.conf`
//! 2. Prepares the storage root and the transcode backend chain
//! 3. Runs the axum HTTP server until Ctrl-C

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use screenwatch_common::config::{self, Config};
use screenwatch_server::{server, transcode};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screenwatch_server=info,tower_http=info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    std::fs::create_dir_all(&config.storage_root).with_context(|| {
        format!(
            "Cannot create storage root {}",
            config.storage_root.display()
        )
    })?;

    // ── shared state ─────────────────────────────────────────────────
    let backends = transcode::default_backends(&config.ffmpeg_path);
    let state = server::AppState::new(&config, backends).context("Cannot build server state")?;

    info!(
        "Screenwatch server starting (listen={}, storage={}, libav={})",
        config.listen_addr,
        state.catalog.root().display(),
        cfg!(feature = "libav"),
    );

    server::run(state, &config.listen_addr).await?;

    info!("Screenwatch server stopped");
    Ok(())
}
