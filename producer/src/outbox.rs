//! Outbox – finished segments waiting for upload.
//!
//! ffmpeg only ever writes the newest segment, so every older one is
//! complete.  The newest counts as complete once it has not been modified
//! for [`SETTLE_AGE`], which covers the tail after capture stops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use screenwatch_common::config::Config;
use screenwatch_common::naming::{is_recording_name, SegmentName};

use crate::client::ServerClient;

pub const SETTLE_AGE: Duration = Duration::from_secs(10);

/// Segments ready for upload, oldest first.
pub fn ready_segments(config: &Config, dir: &Path, now: SystemTime) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read outbox {}", dir.display()))?;

    let mut segments: Vec<(String, PathBuf, SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_recording_name(&name, &config.recording_extensions) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let modified = meta.modified().unwrap_or(now);
        segments.push((name, entry.path(), modified));
    }
    // Names embed the start time, so name order is recording order.
    segments.sort_by(|a, b| a.0.cmp(&b.0));

    let Some((_, _, newest_modified)) = segments.last().cloned() else {
        return Ok(Vec::new());
    };
    let newest_settled = now
        .duration_since(newest_modified)
        .map(|age| age >= SETTLE_AGE)
        .unwrap_or(false);
    if !newest_settled {
        segments.pop();
    }

    Ok(segments.into_iter().map(|(_, path, _)| path).collect())
}

/// Timestamp field for the upload, taken from the segment name.
pub fn segment_timestamp(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    match SegmentName::parse(name) {
        Ok(seg) => Some(seg.recorded_at.format("%Y-%m-%dT%H:%M:%S").to_string()),
        Err(e) => {
            debug!("{e:#}");
            None
        }
    }
}

/// Upload every ready segment, deleting each one the server accepted.
/// Returns how many were uploaded.
pub fn flush(config: &Config, client: &ServerClient, shutdown: &AtomicBool) -> Result<usize> {
    let mut uploaded = 0;
    for path in ready_segments(config, &config.outbox_dir, SystemTime::now())? {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let timestamp = segment_timestamp(&path);
        match client.upload_with_retry(&path, timestamp.as_deref(), shutdown) {
            Ok(_) => {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Cannot remove uploaded {}", path.display()))?;
                uploaded += 1;
            }
            Err(e) => {
                // Kept for the next scan.
                warn!("{e:#}");
                break;
            }
        }
    }
    if uploaded > 0 {
        info!("Uploaded {uploaded} segment(s)");
    }
    Ok(uploaded)
}
