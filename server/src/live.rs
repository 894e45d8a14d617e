//! Live view: an endless `multipart/x-mixed-replace` JPEG stream per source.
//!
//! The mode is picked once when the stream opens:
//! - `Live` repeats the source's latest pushed frame,
//! - `Recording` loops over the newest recording, decoded by ffmpeg
//!   (the placeholder stands in when ffmpeg is not installed),
//! - `Placeholder` repeats a black image.
//!
//! Frames are produced by a spawned task into a one-slot channel.  When the
//! client goes away the body is dropped, the send fails and the task stops.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use screenwatch_common::config::Config;

use crate::catalog::Catalog;
use crate::decode::RecordingDecoder;
use crate::registry::FrameRegistry;

pub const BOUNDARY: &str = "frame";

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 360;

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub live_interval: Duration,
    pub fallback_interval: Duration,
    pub placeholder_interval: Duration,
    pub ffmpeg_path: String,
    pub placeholder: Bytes,
}

impl LiveSettings {
    pub fn from_config(config: &Config) -> Result<Self, image::ImageError> {
        Ok(Self {
            live_interval: per_second(config.live_fps),
            fallback_interval: per_second(config.fallback_fps),
            placeholder_interval: per_second(config.placeholder_fps),
            ffmpeg_path: config.ffmpeg_path.clone(),
            placeholder: placeholder_jpeg(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)?,
        })
    }
}

fn per_second(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

/// A black JPEG of the given size.
pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Bytes, image::ImageError> {
    let black = image::RgbImage::new(width, height);
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80).encode_image(&black)?;
    Ok(Bytes::from(out))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMode {
    Live,
    Recording(PathBuf),
    Placeholder,
}

pub async fn select_mode(registry: &FrameRegistry, catalog: &Arc<Catalog>, source: &str) -> StreamMode {
    if registry.has_frame(source) {
        return StreamMode::Live;
    }
    let owned = source.to_string();
    match catalog.scan(move |c| c.latest_recording(&owned)).await {
        Ok(Some(recording)) => StreamMode::Recording(recording.path),
        Ok(None) => StreamMode::Placeholder,
        Err(e) => {
            warn!("Cannot look up recordings for {source}: {e}");
            StreamMode::Placeholder
        }
    }
}

/// Start producing frames for `source` and return the receiving end.
pub fn spawn_frames(
    registry: Arc<FrameRegistry>,
    settings: Arc<LiveSettings>,
    source: String,
    mode: StreamMode,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(produce(registry, settings, source, mode, tx));
    rx
}

async fn produce(
    registry: Arc<FrameRegistry>,
    settings: Arc<LiveSettings>,
    source: String,
    mode: StreamMode,
    tx: mpsc::Sender<Bytes>,
) {
    info!("Live stream for {source} opened ({mode:?})");
    match mode {
        StreamMode::Live => {
            let mut ticker = ticker(settings.live_interval);
            loop {
                ticker.tick().await;
                let Some(frame) = registry.get_frame(&source) else {
                    continue;
                };
                if tx.send(frame.data).await.is_err() {
                    break;
                }
            }
        }
        StreamMode::Recording(path) => {
            if play_recording(&settings, &source, &path, &tx).await == Playback::NoDecoder {
                warn!(
                    "Decoder {} not found, showing placeholder for {source}",
                    settings.ffmpeg_path
                );
                play_placeholder(&settings, &tx).await;
            }
        }
        StreamMode::Placeholder => play_placeholder(&settings, &tx).await,
    }
    info!("Live stream for {source} closed");
}

async fn play_placeholder(settings: &LiveSettings, tx: &mpsc::Sender<Bytes>) {
    let mut ticker = ticker(settings.placeholder_interval);
    loop {
        ticker.tick().await;
        if tx.send(settings.placeholder.clone()).await.is_err() {
            break;
        }
    }
}

/// How a recording playback ended.
#[derive(Debug, PartialEq, Eq)]
enum Playback {
    Disconnected,
    /// The file could not be decoded; the stream ends.
    Unplayable,
    /// The decoder executable is not installed.
    NoDecoder,
}

/// Loop over the recording until the client leaves.  A pass that yields no
/// frames at all ends the stream.
async fn play_recording(
    settings: &LiveSettings,
    source: &str,
    path: &Path,
    tx: &mpsc::Sender<Bytes>,
) -> Playback {
    let mut ticker = ticker(settings.fallback_interval);
    loop {
        let mut decoder = match RecordingDecoder::spawn(&settings.ffmpeg_path, path) {
            Ok(decoder) => decoder,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Playback::NoDecoder,
            Err(e) => {
                warn!("Cannot decode {} for {source}: {e}", path.display());
                return Playback::Unplayable;
            }
        };

        let mut frames = 0u64;
        loop {
            match decoder.next_frame().await {
                Ok(Some(frame)) => {
                    frames += 1;
                    ticker.tick().await;
                    if tx.send(frame).await.is_err() {
                        return Playback::Disconnected;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Decoding {} failed: {e}", path.display());
                    break;
                }
            }
        }

        if frames == 0 {
            warn!("No frames in {}, ending stream for {source}", path.display());
            return Playback::Unplayable;
        }
        debug!("Looping {} after {frames} frames", path.display());
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One multipart section carrying a JPEG.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg.len());
    buf.put_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Wrap a frame channel in a streaming multipart response.
pub fn mjpeg_response(mut rx: mpsc::Receiver<Bytes>) -> Response {
    let body = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(mjpeg_part(&frame));
        }
    };

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(ffmpeg_path: &str) -> Arc<LiveSettings> {
        Arc::new(LiveSettings {
            live_interval: Duration::from_millis(5),
            fallback_interval: Duration::from_millis(5),
            placeholder_interval: Duration::from_millis(5),
            ffmpeg_path: ffmpeg_path.to_string(),
            placeholder: Bytes::from_static(b"placeholder"),
        })
    }

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    #[test]
    fn test_mjpeg_part_layout() {
        let part = mjpeg_part(b"abc");
        assert_eq!(
            part.as_ref(),
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
    }

    #[test]
    fn test_placeholder_is_jpeg() {
        let jpeg = placeholder_jpeg(64, 36).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn test_select_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = FrameRegistry::new();
        let catalog = Arc::new(Catalog::new(tmp.path(), vec!["mp4".into()]));

        assert_eq!(select_mode(&registry, &catalog, "m1").await, StreamMode::Placeholder);

        std::fs::create_dir(tmp.path().join("m1")).unwrap();
        std::fs::write(tmp.path().join("m1/a.mp4"), b"x").unwrap();
        assert_eq!(
            select_mode(&registry, &catalog, "m1").await,
            StreamMode::Recording(tmp.path().join("m1/a.mp4"))
        );

        registry.put_frame("m1", jpeg(1));
        assert_eq!(select_mode(&registry, &catalog, "m1").await, StreamMode::Live);
    }

    #[tokio::test]
    async fn test_live_frames_arrive_in_order() {
        let registry = Arc::new(FrameRegistry::new());
        registry.put_frame("m1", jpeg(0));
        let mut rx = spawn_frames(registry.clone(), settings("ffmpeg"), "m1".into(), StreamMode::Live);

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for tag in 1..10u8 {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    registry.put_frame("m1", jpeg(tag));
                }
            })
        };

        let mut seen = Vec::new();
        let collect = async {
            while let Some(frame) = rx.recv().await {
                seen.push(frame[2]);
                if frame[2] == 9 {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), collect).await.unwrap();
        writer.await.unwrap();

        assert_eq!(seen.last(), Some(&9));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "reordered: {seen:?}");
    }

    #[tokio::test]
    async fn test_placeholder_repeats() {
        let registry = Arc::new(FrameRegistry::new());
        let mut rx = spawn_frames(registry, settings("ffmpeg"), "m1".into(), StreamMode::Placeholder);
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().as_ref(), b"placeholder");
        }
    }

    /// An executable standing in for ffmpeg that prints `stdout` and exits.
    fn fake_decoder(dir: &Path, stdout: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\nprintf '{stdout}'\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_recording_loops_back_to_first_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let decoder = fake_decoder(tmp.path(), r"\377\330\001\377\331\377\330\002\377\331");
        let registry = Arc::new(FrameRegistry::new());
        let mode = StreamMode::Recording(tmp.path().join("a.mp4"));
        let mut rx = spawn_frames(registry, settings(&decoder), "m1".into(), mode);

        let mut tags = Vec::new();
        for _ in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            tags.push(frame[2]);
        }
        assert_eq!(tags, vec![1, 2, 1, 2, 1]);
    }

    #[tokio::test]
    async fn test_recording_without_frames_ends_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let decoder = fake_decoder(tmp.path(), "");
        let registry = Arc::new(FrameRegistry::new());
        let mode = StreamMode::Recording(tmp.path().join("broken.mp4"));
        let mut rx = spawn_frames(registry, settings(&decoder), "m1".into(), mode);
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_missing_decoder_falls_back_to_placeholder() {
        let registry = Arc::new(FrameRegistry::new());
        let mode = StreamMode::Recording(PathBuf::from("/nonexistent/a.mp4"));
        let mut rx = spawn_frames(registry, settings("/nonexistent/bin/ffmpeg"), "m1".into(), mode);
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.as_ref(), b"placeholder");
        }
    }

    #[tokio::test]
    async fn test_producer_stops_on_disconnect() {
        let registry = Arc::new(FrameRegistry::new());
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(produce(
            registry,
            settings("ffmpeg"),
            "m1".into(),
            StreamMode::Placeholder,
            tx,
        ));
        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
