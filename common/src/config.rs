//! Configuration parsing – reads a KEY=VALUE file (`screenwatch.conf`).
//!
//! The server and the producer load the same file; each ignores the keys it
//! does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Application configuration, shared between server and producer.
#[derive(Debug, Clone)]
pub struct Config {
    // ── storage (server) ─────────────────────────────────────────────
    /// Root directory holding one subdirectory per source.
    pub storage_root: PathBuf,
    /// Lower-case extensions (without dot) recognised as recordings.
    pub recording_extensions: Vec<String>,
    pub max_upload_mb: u64,

    // ── network ──────────────────────────────────────────────────────
    /// Address the HTTP server listens on.
    pub listen_addr: String,
    /// URL the producer uses to reach the server.
    pub server_url: String,

    // ── transcoding (server) ─────────────────────────────────────────
    pub ffmpeg_path: String,
    pub transcode_timeout_secs: u64,
    /// How long a key whose transcode fell back to pass-through is left alone.
    pub transcode_retry_secs: u64,
    pub max_reencode_frames: u64,
    /// Frame rate assumed when a recording does not declare one.
    pub default_fps: u32,

    // ── live stream pacing (server) ──────────────────────────────────
    pub live_fps: u32,
    pub fallback_fps: u32,
    pub placeholder_fps: u32,

    // ── producer ─────────────────────────────────────────────────────
    pub machine_id: String,
    pub outbox_dir: PathBuf,
    /// ffmpeg input arguments selecting the capture device,
    /// e.g. `-f x11grab -i :0.0`.
    pub capture_input: String,
    pub capture_fps: u32,
    pub segment_secs: u32,
    pub live_push_fps: u32,
    pub frame_push_timeout_ms: u64,
    pub upload_timeout_secs: u64,
    pub upload_retries: u32,
    pub upload_retry_delay_secs: u64,
    pub scan_interval_secs: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/screenwatch/screenwatch.conf"
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    pub fn frame_push_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_push_timeout_ms)
    }

    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize).saturating_mul(1024 * 1024)
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text));
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Parse configuration text directly (no file involved).
pub fn parse(text: &str) -> Config {
    from_map(&parse_conf(text))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    // Rates and counts of zero would stall the pacing loops.
    let get_rate = |key: &str, default: u32| -> u32 { get_u32(key, default).max(1) };

    let recording_extensions: Vec<String> = get("RECORDING_EXTENSIONS")
        .unwrap_or_else(|| "mp4,avi,mkv,mov,webm".into())
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    Config {
        storage_root: PathBuf::from(get("STORAGE_ROOT").unwrap_or_else(|| "/data/recordings".into())),
        recording_extensions,
        max_upload_mb: get_u64("MAX_UPLOAD_MB", 2048),

        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:6789".into()),
        server_url: get("SERVER_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://localhost:6789".into()),

        ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into()),
        transcode_timeout_secs: get_u64("TRANSCODE_TIMEOUT_SECS", 300),
        transcode_retry_secs: get_u64("TRANSCODE_RETRY_SECS", 600),
        max_reencode_frames: get_u64("MAX_REENCODE_FRAMES", 10_000),
        default_fps: get_rate("DEFAULT_FPS", 6),

        live_fps: get_rate("LIVE_FPS", 10),
        fallback_fps: get_rate("FALLBACK_FPS", 6),
        placeholder_fps: get_rate("PLACEHOLDER_FPS", 1),

        machine_id: get("MACHINE_ID").unwrap_or_else(default_machine_id),
        outbox_dir: PathBuf::from(get("OUTBOX_DIR").unwrap_or_else(|| "/data/outbox".into())),
        capture_input: get("CAPTURE_INPUT").unwrap_or_else(|| "-f x11grab -i :0.0".into()),
        capture_fps: get_rate("CAPTURE_FPS", 10),
        segment_secs: get_rate("SEGMENT_SECS", 300),
        live_push_fps: get_rate("LIVE_PUSH_FPS", 1),
        frame_push_timeout_ms: get_u64("FRAME_PUSH_TIMEOUT_MS", 1000),
        upload_timeout_secs: get_u64("UPLOAD_TIMEOUT_SECS", 600),
        upload_retries: get_rate("UPLOAD_RETRIES", 3),
        upload_retry_delay_secs: get_u64("UPLOAD_RETRY_DELAY_SECS", 5),
        scan_interval_secs: get_u64("SCAN_INTERVAL_SECS", 5).max(1),
    }
}

/// `<hostname>_<user>`, or `machine_<unix time>` when neither is known.
fn default_machine_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty());

    match (host, user) {
        (Some(host), Some(user)) => crate::naming::sanitize_component(&format!("{host}_{user}")),
        (Some(host), None) => crate::naming::sanitize_component(&host),
        _ => format!("machine_{}", chrono::Utc::now().timestamp()),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
