//! HTTP client pushing live frames and finished recordings to the server.
//!
//! Live frames are disposable: one attempt with a short timeout, and the
//! caller drops any error.  Recordings are retried a few times and stay in
//! the outbox if every attempt fails.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{multipart, Client};
use thiserror::Error;
use tracing::{debug, info, warn};

use screenwatch_common::config::Config;
use screenwatch_common::protocol::{HealthResponse, UploadResponse};

/// Why a live frame did not reach the server.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("frame push failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
}

pub struct ServerClient {
    base_url: String,
    machine_id: String,
    frames: Client,
    uploads: Client,
    retries: u32,
    retry_delay: Duration,
}

impl ServerClient {
    pub fn new(config: &Config) -> Result<Self> {
        let frames = Client::builder()
            .timeout(config.frame_push_timeout())
            .build()
            .context("Cannot create frame HTTP client")?;
        let uploads = Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_secs))
            .build()
            .context("Cannot create upload HTTP client")?;

        Ok(Self {
            base_url: config.server_url.clone(),
            machine_id: config.machine_id.clone(),
            frames,
            uploads,
            retries: config.upload_retries.max(1),
            retry_delay: Duration::from_secs(config.upload_retry_delay_secs),
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/api/health", self.base_url);
        let resp = self.frames.get(&url).send().context("GET /api/health")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /api/health returned {}", resp.status());
        }
        resp.json().context("Parse health JSON")
    }

    /// One attempt to replace this machine's live frame.
    pub fn push_frame(&self, jpeg: Vec<u8>) -> Result<(), PushError> {
        let url = format!("{}/frame", self.base_url);
        let resp = self
            .frames
            .post(&url)
            .query(&[("source", self.machine_id.as_str())])
            .header("X-Machine-Id", &self.machine_id)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()?;
        if !resp.status().is_success() {
            return Err(PushError::Status(resp.status()));
        }
        Ok(())
    }

    /// Upload one finished recording.
    pub fn upload_recording(&self, path: &Path, timestamp: Option<&str>) -> Result<UploadResponse> {
        let mut form = multipart::Form::new().text("machine_id", self.machine_id.clone());
        if let Some(ts) = timestamp {
            form = form.text("timestamp", ts.to_string());
        }
        let form = form
            .file("video", path)
            .with_context(|| format!("Cannot open {}", path.display()))?;

        let url = format!("{}/recording", self.base_url);
        let resp = self
            .uploads
            .post(&url)
            .query(&[("source", self.machine_id.as_str())])
            .multipart(form)
            .send()
            .context("POST /recording")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            anyhow::bail!("POST /recording returned {status}: {body}");
        }
        resp.json().context("Parse upload JSON")
    }

    /// [`upload_recording`] with retries.  Stops early on shutdown.
    ///
    /// [`upload_recording`]: ServerClient::upload_recording
    pub fn upload_with_retry(
        &self,
        path: &Path,
        timestamp: Option<&str>,
        shutdown: &AtomicBool,
    ) -> Result<UploadResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upload_recording(path, timestamp) {
                Ok(reply) => {
                    info!(
                        "Uploaded {} as {}/{} ({} bytes)",
                        path.display(),
                        reply.source,
                        reply.filename,
                        reply.size
                    );
                    return Ok(reply);
                }
                Err(e) if attempt < self.retries && !shutdown.load(Ordering::Relaxed) => {
                    warn!(
                        "Upload of {} failed (attempt {attempt}/{}): {e:#}",
                        path.display(),
                        self.retries
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    debug!("Giving up on {} after {attempt} attempt(s)", path.display());
                    return Err(e.context(format!(
                        "Upload of {} failed after {attempt} attempt(s)",
                        path.display()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Multipart, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    /// What the fake server saw.
    #[derive(Default)]
    pub(crate) struct Seen {
        pub frames: Mutex<Vec<(String, Vec<u8>)>>,
        pub uploads: Mutex<Vec<(String, Option<String>, String, Vec<u8>)>>,
        /// Number of upload requests to reject before accepting.
        pub reject_uploads: AtomicUsize,
    }

    #[derive(serde::Deserialize)]
    struct SourceQuery {
        source: String,
    }

    async fn frame(
        State(seen): State<Arc<Seen>>,
        Query(q): Query<SourceQuery>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> &'static str {
        assert_eq!(headers["x-machine-id"], q.source.as_str());
        seen.frames.lock().unwrap().push((q.source, body.to_vec()));
        "ok"
    }

    async fn recording(
        State(seen): State<Arc<Seen>>,
        Query(q): Query<SourceQuery>,
        mut multipart: Multipart,
    ) -> Result<Json<UploadResponse>, StatusCode> {
        if seen
            .reject_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        let mut timestamp = None;
        while let Some(field) = multipart.next_field().await.unwrap() {
            match field.file_name().map(str::to_string) {
                Some(name) => {
                    let data = field.bytes().await.unwrap().to_vec();
                    let size = data.len() as u64;
                    seen.uploads
                        .lock()
                        .unwrap()
                        .push((q.source.clone(), timestamp.clone(), name.clone(), data));
                    return Ok(Json(UploadResponse {
                        status: "ok".into(),
                        source: q.source,
                        filename: name,
                        size,
                    }));
                }
                None if field.name() == Some("timestamp") => {
                    timestamp = Some(field.text().await.unwrap());
                }
                None => {}
            }
        }
        Err(StatusCode::BAD_REQUEST)
    }

    /// Start a fake server on its own runtime thread and return its URL.
    pub(crate) fn fake_server(seen: Arc<Seen>) -> String {
        let app = Router::new()
            .route(
                "/api/health",
                get(|| async {
                    Json(HealthResponse {
                        status: "ok".into(),
                        uptime_secs: 1,
                    })
                }),
            )
            .route("/frame", post(frame))
            .route("/recording", post(recording))
            .with_state(seen);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });
        format!("http://{addr}")
    }

    pub(crate) fn test_config(server_url: &str, outbox: &Path) -> Config {
        screenwatch_common::config::parse(&format!(
            "SERVER_URL={server_url}\nMACHINE_ID=desk-01_alice\nOUTBOX_DIR={}\n\
             UPLOAD_RETRIES=3\nUPLOAD_RETRY_DELAY_SECS=0\n",
            outbox.display()
        ))
    }

    #[test]
    fn test_health() {
        let url = fake_server(Arc::default());
        let tmp = tempfile::tempdir().unwrap();
        let client = ServerClient::new(&test_config(&url, tmp.path())).unwrap();
        assert_eq!(client.health().unwrap().status, "ok");
    }

    #[test]
    fn test_push_frame() {
        let seen = Arc::new(Seen::default());
        let url = fake_server(seen.clone());
        let tmp = tempfile::tempdir().unwrap();
        let client = ServerClient::new(&test_config(&url, tmp.path())).unwrap();

        client.push_frame(vec![0xFF, 0xD8, 1, 0xFF, 0xD9]).unwrap();
        let frames = seen.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "desk-01_alice");
        assert_eq!(frames[0].1, vec![0xFF, 0xD8, 1, 0xFF, 0xD9]);
    }

    #[test]
    fn test_push_frame_unreachable_is_error() {
        // Nothing listens on port 9 of localhost.
        let tmp = tempfile::tempdir().unwrap();
        let client = ServerClient::new(&test_config("http://127.0.0.1:9", tmp.path())).unwrap();
        assert!(client.push_frame(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_upload_retries_then_succeeds() {
        let seen = Arc::new(Seen::default());
        seen.reject_uploads.store(2, Ordering::SeqCst);
        let url = fake_server(seen.clone());
        let tmp = tempfile::tempdir().unwrap();
        let client = ServerClient::new(&test_config(&url, tmp.path())).unwrap();

        let path = tmp.path().join("desk-01_alice_20240224_161937.mp4");
        std::fs::write(&path, b"segment").unwrap();
        let reply = client
            .upload_with_retry(&path, Some("2024-02-24T16:19:37"), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(reply.size, 7);

        let uploads = seen.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "desk-01_alice");
        assert_eq!(uploads[0].1.as_deref(), Some("2024-02-24T16:19:37"));
        assert_eq!(uploads[0].2, "desk-01_alice_20240224_161937.mp4");
        assert_eq!(uploads[0].3, b"segment");
    }

    #[test]
    fn test_upload_gives_up_after_retries() {
        let seen = Arc::new(Seen::default());
        seen.reject_uploads.store(10, Ordering::SeqCst);
        let url = fake_server(seen.clone());
        let tmp = tempfile::tempdir().unwrap();
        let client = ServerClient::new(&test_config(&url, tmp.path())).unwrap();

        let path = tmp.path().join("a.mp4");
        std::fs::write(&path, b"x").unwrap();
        assert!(client
            .upload_with_retry(&path, None, &AtomicBool::new(false))
            .is_err());
        assert_eq!(seen.reject_uploads.load(Ordering::SeqCst), 7);
        assert!(seen.uploads.lock().unwrap().is_empty());
    }
}
