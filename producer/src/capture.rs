//! Screen capture – one `ffmpeg` child with two outputs.
//!
//! The first output writes fixed-length segments into the outbox.  The
//! second writes low-rate MJPEG to stdout, which a thread splits into
//! single JPEGs and pushes to the server as live frames.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use screenwatch_common::config::Config;
use screenwatch_common::jpeg::JpegSplitter;
use screenwatch_common::naming::segment_pattern;

use crate::client::ServerClient;

/// Container the segment muxer writes.
pub const SEGMENT_EXTENSION: &str = "mp4";

/// Owns the capture child process.
pub struct CaptureHandle {
    child: Child,
}

impl CaptureHandle {
    pub fn kill(&mut self) -> Result<()> {
        // Already exited is fine.
        let _ = self.child.kill();
        self.child.wait().context("Cannot reap ffmpeg")?;
        Ok(())
    }

    /// `Some(reason)` once the child has exited.
    pub fn check_alive(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("Capture ffmpeg exited with {status}")),
            Ok(None) => None,
            Err(e) => Some(format!("Cannot check capture ffmpeg: {e}")),
        }
    }
}

/// Arguments for the capture child (program name excluded).
pub fn capture_args(config: &Config, outbox: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    args.extend(["-r".into(), config.capture_fps.to_string()]);
    args.extend(config.capture_input.split_whitespace().map(str::to_string));

    // Output 1: segments.
    let pattern = outbox.join(segment_pattern(&config.machine_id, SEGMENT_EXTENSION));
    args.extend(
        [
            "-map",
            "0:v:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-pix_fmt",
            "yuv420p",
            "-an",
            "-f",
            "segment",
            "-segment_time",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(config.segment_secs.to_string());
    args.extend(
        ["-reset_timestamps", "1", "-strftime", "1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(pattern.to_string_lossy().into_owned());

    // Output 2: live frames on stdout.
    args.extend(["-map".into(), "0:v:0".into(), "-r".into()]);
    args.push(config.live_push_fps.to_string());
    args.extend(
        ["-an", "-f", "image2pipe", "-c:v", "mjpeg", "-q:v", "10", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Start capturing into `config.outbox_dir` and pushing live frames.
pub fn start(config: &Config, client: Arc<ServerClient>, shutdown: &'static AtomicBool) -> Result<CaptureHandle> {
    std::fs::create_dir_all(&config.outbox_dir).with_context(|| {
        format!("Cannot create outbox {}", config.outbox_dir.display())
    })?;

    let args = capture_args(config, &config.outbox_dir);
    info!("Spawning: {} {}", config.ffmpeg_path, args.join(" "));

    let mut child = Command::new(&config.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", config.ffmpeg_path))?;

    // Drain stderr so the pipe never fills and blocks ffmpeg.
    if let Some(stderr) = child.stderr.take() {
        std::thread::Builder::new()
            .name("ffmpeg-stderr".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(l) if l.is_empty() => {}
                        Ok(l) => warn!("[ffmpeg] {l}"),
                        Err(_) => break,
                    }
                }
                debug!("ffmpeg stderr stream ended");
            })
            .context("Cannot spawn stderr thread")?;
    }

    if let Some(stdout) = child.stdout.take() {
        std::thread::Builder::new()
            .name("live-push".into())
            .spawn(move || push_live_frames(stdout, &client, shutdown))
            .context("Cannot spawn live push thread")?;
    }

    // Give ffmpeg a moment to fail on a bad device before declaring success.
    std::thread::sleep(std::time::Duration::from_millis(500));
    match child.try_wait() {
        Ok(Some(status)) => {
            anyhow::bail!(
                "ffmpeg exited immediately with {status} – check CAPTURE_INPUT in screenwatch.conf"
            );
        }
        Ok(None) => {}
        Err(e) => warn!("Cannot check ffmpeg status: {e}"),
    }

    info!(
        "Capture started (pid={}, fps={}, segment={}s, live={}fps)",
        child.id(),
        config.capture_fps,
        config.segment_secs,
        config.live_push_fps
    );
    Ok(CaptureHandle { child })
}

fn push_live_frames(mut stdout: ChildStdout, client: &ServerClient, shutdown: &AtomicBool) {
    let mut splitter = JpegSplitter::default();
    let mut buf = vec![0u8; 64 * 1024];
    let mut pushed = 0u64;
    let mut dropped = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Reading live frames failed: {e}");
                break;
            }
        };
        for jpeg in splitter.push(&buf[..n]) {
            // Live frames are best effort; the next one replaces this anyway.
            match client.push_frame(jpeg.to_vec()) {
                Ok(()) => pushed += 1,
                Err(e) => {
                    dropped += 1;
                    debug!("Live frame dropped: {e}");
                }
            }
        }
    }
    info!("Live push stopped ({pushed} pushed, {dropped} dropped)");
}
