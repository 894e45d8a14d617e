//! HTTP surface.
//!
//! Routes:
//!   POST /frame?source=ID              → replace the live frame (raw JPEG body)
//!   GET  /live-stream?source=ID        → multipart MJPEG stream
//!   GET  /snapshot?source=ID           → current live frame
//!   GET  /recordings?source=ID         → recordings, newest first
//!   GET  /video?source=ID&file=NAME    → playable rendition, range-aware
//!   POST /recording?source=ID          → multipart recording upload
//!   GET  /machines                     → per-source overview
//!   GET  /api/health                   → health check

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Multipart, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use screenwatch_common::config::Config;
use screenwatch_common::naming::{self, DEFAULT_SOURCE};
use screenwatch_common::protocol::{HealthResponse, MachineInfo, RecordingInfo, UploadResponse};

use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};
use crate::live::{self, LiveSettings};
use crate::registry::FrameRegistry;
use crate::transcode::{TranscodeBackend, TranscodeCache, TranscodeSettings};

/// Header a producer may use instead of the `source` query parameter.
const MACHINE_ID_HEADER: &str = "x-machine-id";
const RENDITION_HEADER: &str = "x-rendition";
const FRAME_SEQ_HEADER: &str = "x-frame-seq";

/// Process-wide state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FrameRegistry>,
    pub catalog: Arc<Catalog>,
    pub transcoder: Arc<TranscodeCache>,
    pub live: Arc<LiveSettings>,
    pub max_upload_bytes: usize,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &Config, backends: Vec<Arc<dyn TranscodeBackend>>) -> anyhow::Result<Self> {
        let catalog = Arc::new(Catalog::new(
            config.storage_root.clone(),
            config.recording_extensions.clone(),
        ));
        let settings = TranscodeSettings {
            timeout: config.transcode_timeout(),
            default_fps: config.default_fps,
            max_frames: config.max_reencode_frames,
            retry_after: std::time::Duration::from_secs(config.transcode_retry_secs),
        };
        Ok(Self {
            registry: Arc::new(FrameRegistry::new()),
            transcoder: Arc::new(TranscodeCache::new(catalog.clone(), backends, settings)),
            catalog,
            live: Arc::new(LiveSettings::from_config(config)?),
            max_upload_bytes: config.max_upload_bytes(),
            start_time: Instant::now(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/frame", post(put_frame))
        .route("/live-stream", get(live_stream))
        .route("/snapshot", get(snapshot))
        .route("/recordings", get(list_recordings))
        .route("/video", get(video))
        .route(
            "/recording",
            post(upload_recording).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/machines", get(machines))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

// ── query parameters ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SourceQuery {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoQuery {
    source: Option<String>,
    file: Option<String>,
}

/// Apply the default and reject ids that would escape the storage root.
fn source_or_default(source: Option<String>) -> AppResult<String> {
    let source = source.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
    naming::validate_source(&source)?;
    Ok(source)
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn put_frame(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<&'static str> {
    let from_header = headers
        .get(MACHINE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let source = source_or_default(query.source.or(from_header))?;

    state.registry.put_frame(&source, body);
    // The frame is stored either way; the directory only makes the source
    // show up in listings.
    if let Err(e) = state.catalog.ensure_source(&source).await {
        warn!("Cannot create directory for {source}: {e}");
    }
    Ok("ok")
}

async fn live_stream(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> AppResult<Response> {
    let source = source_or_default(query.source)?;
    let mode = live::select_mode(&state.registry, &state.catalog, &source).await;
    let rx = live::spawn_frames(state.registry.clone(), state.live.clone(), source, mode);
    Ok(live::mjpeg_response(rx))
}

async fn snapshot(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> AppResult<Response> {
    let source = source_or_default(query.source)?;
    let frame = state
        .registry
        .get_frame(&source)
        .ok_or_else(|| AppError::NotFound(format!("no live frame for {source}")))?;
    let received = chrono::DateTime::<chrono::Utc>::from(frame.received_at)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::LAST_MODIFIED, received),
        ],
        [(FRAME_SEQ_HEADER, frame.seq.to_string())],
        Body::from(frame.data),
    )
        .into_response())
}

async fn list_recordings(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> AppResult<Json<Vec<RecordingInfo>>> {
    let source = source_or_default(query.source)?;
    let recordings = state
        .catalog
        .scan(move |c| c.list_recordings(&source))
        .await??;
    Ok(Json(recordings.iter().map(|r| r.info()).collect()))
}

async fn video(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
    request: Request,
) -> AppResult<Response> {
    let source = source_or_default(query.source)?;
    let file = query
        .file
        .ok_or_else(|| AppError::BadRequest("missing file parameter".into()))?;
    naming::validate_filename(&file)?;

    let rendition = state.transcoder.resolve(&source, &file).await?;
    info!("Serving {source}/{file} ({})", rendition.describe());

    let response = match ServeFile::new(&rendition.path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let mut response = response.map(Body::new);

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(rendition.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&rendition.describe()) {
        headers.insert(RENDITION_HEADER, value);
    }
    Ok(response)
}

async fn upload_recording(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let mut source = query.source;
    let mut timestamp: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let Some(original) = field.file_name().map(str::to_string) else {
            let name = field.name().map(str::to_string);
            let value = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            match name.as_deref() {
                Some("machine_id") if source.is_none() => source = Some(value),
                Some("timestamp") => timestamp = Some(value),
                _ => {}
            }
            continue;
        };

        let source = source_or_default(source)?;
        let stored = naming::stored_upload_name(timestamp.as_deref(), &original, chrono::Local::now());
        naming::validate_filename(&stored)?;
        if !state.catalog.is_recording_name(&stored) {
            return Err(AppError::BadRequest(format!(
                "unsupported recording type: {original}"
            )));
        }

        let size = state.catalog.store_upload(&source, &stored, field).await?;
        info!("Stored upload {source}/{stored} ({size} bytes)");
        return Ok(Json(UploadResponse {
            status: "ok".to_string(),
            source,
            filename: stored,
            size,
        }));
    }

    Err(AppError::BadRequest("no file part in upload".into()))
}

async fn machines(State(state): State<AppState>) -> AppResult<Json<Vec<MachineInfo>>> {
    let registry = state.registry.clone();
    let mut list = state
        .catalog
        .scan(move |c| c.machines(|source| registry.has_frame(source)))
        .await?;

    // A pushing source whose directory could not be created is still live.
    for source in state.registry.sources() {
        if !list.iter().any(|m| m.machine_id == source) {
            list.push(MachineInfo {
                machine_id: source,
                recording_count: 0,
                total_size: 0,
                last_upload: None,
                live: true,
            });
        }
    }
    list.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
    Ok(Json(list))
}

// ─── tests ───────────────────────────────────────────────────────────────
