//! Sources and their recordings, read straight from the storage root.
//!
//! Layout:
//!   <root>/<source>/<recording>
//!   <root>/<source>/_rendition_cache/<recording>
//!
//! Nothing is cached; every call re-reads the directories.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use screenwatch_common::naming::{self, CACHE_DIR_NAME};
use screenwatch_common::protocol::{MachineInfo, RecordingInfo};

/// A recording file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl Recording {
    pub fn info(&self) -> RecordingInfo {
        RecordingInfo {
            filename: self.filename.clone(),
            size: self.size,
            modified: rfc3339(self.modified),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    extensions: Vec<String>,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.root.join(source)
    }

    pub fn recording_path(&self, source: &str, filename: &str) -> PathBuf {
        self.source_dir(source).join(filename)
    }

    pub fn cache_dir(&self, source: &str) -> PathBuf {
        self.source_dir(source).join(CACHE_DIR_NAME)
    }

    pub fn is_recording_name(&self, name: &str) -> bool {
        naming::is_recording_name(name, &self.extensions)
    }

    /// Run a blocking directory scan on the blocking pool.
    pub async fn scan<T, F>(self: &Arc<Self>, f: F) -> io::Result<T>
    where
        F: FnOnce(&Catalog) -> T + Send + 'static,
        T: Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(io::Error::other)
    }

    /// Subdirectories of the root that are valid source ids, sorted.
    pub fn list_sources(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read storage root {}: {e}", self.root.display());
                return Vec::new();
            }
        };

        let mut sources: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| naming::validate_source(name).is_ok())
            .collect();
        sources.sort();
        sources
    }

    /// Recordings of `source`, newest first.  A missing directory is an
    /// empty listing.
    pub fn list_recordings(&self, source: &str) -> io::Result<Vec<Recording>> {
        let dir = self.source_dir(source);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut recordings = Vec::new();
        for entry in entries.flatten() {
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if !self.is_recording_name(&filename) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            recordings.push(Recording {
                filename,
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        recordings.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(recordings)
    }

    pub fn latest_recording(&self, source: &str) -> Option<Recording> {
        match self.list_recordings(source) {
            Ok(list) => list.into_iter().next(),
            Err(e) => {
                warn!("Cannot list recordings for {source}: {e}");
                None
            }
        }
    }

    /// The named recording, if it exists as a regular file.
    pub fn find_recording(&self, source: &str, filename: &str) -> Option<Recording> {
        let path = self.recording_path(source, filename);
        let meta = std::fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(Recording {
            filename: filename.to_string(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        })
    }

    /// Per-source summary.  Unreadable source directories are skipped.
    pub fn machines(&self, is_live: impl Fn(&str) -> bool) -> Vec<MachineInfo> {
        self.list_sources()
            .into_iter()
            .filter_map(|source| match self.list_recordings(&source) {
                Ok(recordings) => Some(MachineInfo {
                    recording_count: recordings.len(),
                    total_size: recordings.iter().map(|r| r.size).sum(),
                    last_upload: recordings.first().map(|r| rfc3339(r.modified)),
                    live: is_live(&source),
                    machine_id: source,
                }),
                Err(e) => {
                    warn!("Skipping unreadable source {source}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Create the directory for `source` if needed.
    pub async fn ensure_source(&self, source: &str) -> io::Result<PathBuf> {
        let dir = self.source_dir(source);
        if tokio::fs::metadata(&dir).await.is_err() {
            tokio::fs::create_dir_all(&dir).await?;
            info!("Created source directory {}", dir.display());
        }
        Ok(dir)
    }

    /// Write an uploaded recording as `stored_name`.  The data goes to a
    /// hidden file first and is renamed into place once complete.
    pub async fn store_upload<S, E>(&self, source: &str, stored_name: &str, body: S) -> io::Result<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let dir = self.ensure_source(source).await?;
        let target = dir.join(stored_name);
        let partial = dir.join(format!(".upload-{stored_name}"));

        let reader = StreamReader::new(body.map_err(io::Error::other));
        tokio::pin!(reader);

        let result = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let size = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            tokio::fs::rename(&partial, &target).await?;
            Ok::<u64, io::Error>(size)
        }
        .await;

        match result {
            Ok(size) => {
                debug!("Stored {} ({size} bytes)", target.display());
                Ok(size)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

pub fn rfc3339(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()
}
