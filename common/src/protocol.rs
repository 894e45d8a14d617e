//! Shared HTTP protocol types exchanged between the server, producers and
//! browser clients.

use serde::{Deserialize, Serialize};

/// One recording in a source's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub filename: String,
    pub size: u64,
    /// RFC 3339 modification time.
    pub modified: String,
}

/// Per-source summary for the machine overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub machine_id: String,
    pub recording_count: usize,
    pub total_size: u64,
    /// RFC 3339 modification time of the newest recording.
    pub last_upload: Option<String>,
    /// Whether a producer has pushed a live frame since startup.
    pub live: bool,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// Reply to a recording upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub source: String,
    pub filename: String,
    pub size: u64,
}
