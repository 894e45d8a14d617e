//! Browser-playable renditions of recordings.
//!
//! A rendition for `(source, filename)` lives at
//! `<root>/<source>/_rendition_cache/<filename>`.  On a miss the configured
//! backends are tried in order; the first one that leaves a non-empty file
//! wins.  When every backend fails the original file is served unchanged.
//!
//! Concurrent misses for the same key share one computation.  The work runs
//! in its own task, so a requester going away does not cancel it for the
//! others.

pub mod external;
pub mod libav;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};

pub use external::ExternalEncoder;
pub use libav::InProcessEncoder;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("transcode failed: {0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("backend produced no output")]
    EmptyOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to produce one rendition.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub source: String,
    pub filename: String,
    pub input: PathBuf,
    /// Temporary file the backend must write an MP4 to.
    pub output: PathBuf,
    pub timeout: Duration,
    /// Frame rate to assume when the input does not declare one.
    pub default_fps: u32,
    pub max_frames: u64,
}

/// One strategy in the fallback chain.
pub trait TranscodeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Write an H.264/MP4 version of `job.input` to `job.output`.
    fn attempt_transcode(&self, job: &TranscodeJob) -> Result<(), TranscodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenditionOrigin {
    Cached,
    Transcoded(String),
    Original,
}

/// Where the bytes for a `/video` request come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub path: PathBuf,
    pub origin: RenditionOrigin,
}

impl Rendition {
    /// Value for the `X-Rendition` response header.
    pub fn describe(&self) -> String {
        match &self.origin {
            RenditionOrigin::Cached => "cached".to_string(),
            RenditionOrigin::Transcoded(backend) => format!("transcoded by {backend}"),
            RenditionOrigin::Original => "original".to_string(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.origin {
            RenditionOrigin::Cached | RenditionOrigin::Transcoded(_) => "video/mp4",
            RenditionOrigin::Original => content_type_for(&self.path),
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub timeout: Duration,
    pub default_fps: u32,
    pub max_frames: u64,
    /// How long a key that fell back to the original is left alone.
    pub retry_after: Duration,
}

type Key = (String, String);
type PendingRendition = Shared<BoxFuture<'static, Rendition>>;

pub struct TranscodeCache {
    catalog: Arc<Catalog>,
    backends: Vec<Arc<dyn TranscodeBackend>>,
    settings: TranscodeSettings,
    inflight: Mutex<HashMap<Key, PendingRendition>>,
    failures: Mutex<HashMap<Key, Instant>>,
}

impl TranscodeCache {
    pub fn new(
        catalog: Arc<Catalog>,
        backends: Vec<Arc<dyn TranscodeBackend>>,
        settings: TranscodeSettings,
    ) -> Self {
        Self {
            catalog,
            backends,
            settings,
            inflight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_path(&self, source: &str, filename: &str) -> PathBuf {
        self.catalog.cache_dir(source).join(filename)
    }

    /// Find or produce a playable rendition.  Only a missing recording is an
    /// error; transcoding failures degrade to the original file.
    pub async fn resolve(self: &Arc<Self>, source: &str, filename: &str) -> AppResult<Rendition> {
        let (owned_source, owned_filename) = (source.to_string(), filename.to_string());
        let input = self
            .catalog
            .scan(move |c| c.find_recording(&owned_source, &owned_filename))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("recording {source}/{filename}")))?
            .path;

        let cached = self.cache_path(source, filename);
        if is_valid_rendition(&cached).await {
            debug!("Rendition cache hit for {source}/{filename}");
            return Ok(Rendition {
                path: cached,
                origin: RenditionOrigin::Cached,
            });
        }

        let key: Key = (source.to_string(), filename.to_string());
        if self.in_cooldown(&key) {
            debug!("Recent transcode failure for {source}/{filename}, serving original");
            return Ok(Rendition {
                path: input,
                origin: RenditionOrigin::Original,
            });
        }

        let pending = self.join_or_start(key, input);
        Ok(pending.await)
    }

    fn join_or_start(self: &Arc<Self>, key: Key, input: PathBuf) -> PendingRendition {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = inflight.get(&key) {
            debug!("Joining in-flight transcode of {}/{}", key.0, key.1);
            return pending.clone();
        }

        let this = Arc::clone(self);
        let task_key = key.clone();
        let task_input = input.clone();
        let handle = tokio::spawn(async move {
            let rendition = this.compute(&task_key, task_input).await;
            this.inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_key);
            rendition
        });

        let pending = async move {
            handle.await.unwrap_or_else(|e| {
                warn!("Transcode task failed: {e}");
                Rendition {
                    path: input,
                    origin: RenditionOrigin::Original,
                }
            })
        }
        .boxed()
        .shared();

        inflight.insert(key, pending.clone());
        pending
    }

    async fn compute(self: &Arc<Self>, key: &Key, input: PathBuf) -> Rendition {
        let (source, filename) = key;
        let cached = self.cache_path(source, filename);

        // A run for this key may have finished between the caller's cache
        // check and its in-flight lookup.
        if is_valid_rendition(&cached).await {
            debug!("Rendition of {source}/{filename} published meanwhile");
            return Rendition {
                path: cached,
                origin: RenditionOrigin::Cached,
            };
        }
        if self.in_cooldown(key) {
            return Rendition {
                path: input,
                origin: RenditionOrigin::Original,
            };
        }

        let job = TranscodeJob {
            source: source.clone(),
            filename: filename.clone(),
            input: input.clone(),
            output: self
                .catalog
                .cache_dir(source)
                .join(format!(".tmp-{filename}")),
            timeout: self.settings.timeout,
            default_fps: self.settings.default_fps,
            max_frames: self.settings.max_frames,
        };

        let this = Arc::clone(self);
        let final_path = cached.clone();
        let outcome =
            tokio::task::spawn_blocking(move || this.run_chain(&job, &final_path)).await;

        match outcome {
            Ok(Some(backend)) => Rendition {
                path: cached,
                origin: RenditionOrigin::Transcoded(backend),
            },
            Ok(None) => {
                warn!("All transcode backends failed for {source}/{filename}, serving original");
                self.record_failure(key.clone());
                Rendition {
                    path: input,
                    origin: RenditionOrigin::Original,
                }
            }
            Err(e) => {
                warn!("Transcode worker for {source}/{filename} died: {e}");
                self.record_failure(key.clone());
                Rendition {
                    path: input,
                    origin: RenditionOrigin::Original,
                }
            }
        }
    }

    /// Try each backend in turn.  Returns the name of the one that succeeded.
    fn run_chain(&self, job: &TranscodeJob, final_path: &Path) -> Option<String> {
        if let Some(dir) = job.output.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Cannot create rendition cache {}: {e}", dir.display());
                return None;
            }
        }

        for backend in &self.backends {
            // Leftover from an attempt that crashed or timed out.
            let _ = std::fs::remove_file(&job.output);

            let started = Instant::now();
            info!(
                "Transcoding {}/{} with {}",
                job.source,
                job.filename,
                backend.name()
            );
            let result = backend
                .attempt_transcode(job)
                .and_then(|()| publish(&job.output, final_path));

            match result {
                Ok(()) => {
                    info!(
                        "Rendition of {}/{} ready via {} in {:.1}s",
                        job.source,
                        job.filename,
                        backend.name(),
                        started.elapsed().as_secs_f64()
                    );
                    return Some(backend.name().to_string());
                }
                Err(e) => {
                    warn!(
                        "{} failed for {}/{}: {e}",
                        backend.name(),
                        job.source,
                        job.filename
                    );
                    let _ = std::fs::remove_file(&job.output);
                }
            }
        }
        None
    }

    fn in_cooldown(&self, key: &Key) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get(key) {
            Some(at) if at.elapsed() < self.settings.retry_after => true,
            Some(_) => {
                failures.remove(key);
                false
            }
            None => false,
        }
    }

    fn record_failure(&self, key: Key) {
        let retry_after = self.settings.retry_after;
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, at| at.elapsed() < retry_after);
        failures.insert(key, Instant::now());
    }
}

/// Move a finished temporary output to its cache path if it is non-empty.
fn publish(tmp: &Path, final_path: &Path) -> Result<(), TranscodeError> {
    let len = std::fs::metadata(tmp).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(TranscodeError::EmptyOutput);
    }
    std::fs::rename(tmp, final_path)?;
    Ok(())
}

async fn is_valid_rendition(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
}

/// The default chain: external ffmpeg, then the in-process encoder.
pub fn default_backends(ffmpeg_path: &str) -> Vec<Arc<dyn TranscodeBackend>> {
    vec![
        Arc::new(ExternalEncoder::new(ffmpeg_path)),
        Arc::new(InProcessEncoder),
    ]
}
