//! Screenwatch producer – captures this machine's screen, pushes live
//! frames and uploads finished recording segments to the server.

mod capture;
mod client;
mod outbox;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use screenwatch_common::config::{self, Config};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Screenwatch producer starting (machine={}, server={}, outbox={})",
        config.machine_id,
        config.server_url,
        config.outbox_dir.display()
    );

    let client = Arc::new(client::ServerClient::new(&config)?);
    match client.health() {
        Ok(h) => info!("Server reachable (up {}s)", h.uptime_secs),
        Err(e) => warn!("Server not reachable yet, will keep trying: {e:#}"),
    }

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── capture ──────────────────────────────────────────────────────
    let mut capture = capture::start(&config, client.clone(), &SHUTDOWN)?;

    // ── upload loop ──────────────────────────────────────────────────
    let scan_interval = Duration::from_secs(config.scan_interval_secs);
    let mut next_scan = Instant::now();
    let result = loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break Ok(());
        }
        if let Some(reason) = capture.check_alive() {
            break Err(anyhow::anyhow!(reason));
        }
        if Instant::now() >= next_scan {
            if let Err(e) = outbox::flush(&config, &client, &SHUTDOWN) {
                warn!("Outbox scan failed: {e:#}");
            }
            next_scan = Instant::now() + scan_interval;
        }
        std::thread::sleep(Duration::from_millis(250));
    };

    capture.kill()?;
    info!(
        "Client {} stopped; pending segments stay in {}",
        client.machine_id(),
        config.outbox_dir.display()
    );
    result
}
