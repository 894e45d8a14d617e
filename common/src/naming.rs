//! Source ids, recording file names and the rules that keep them inside
//! the storage root.
//!
//! Producer segments are named `<machine>_<YYYYmmdd>_<HHMMSS>.<ext>`, e.g.
//! `desk-01_alice_20240224_161937.mp4`.  The server stores uploads as
//! `<timestamp>_<original name>`.

use chrono::{DateTime, Local, NaiveDateTime};
use thiserror::Error;

/// Per-source subdirectory holding completed renditions.
pub const CACHE_DIR_NAME: &str = "_rendition_cache";

/// Source used when a request does not name one.
pub const DEFAULT_SOURCE: &str = "default";

const SEGMENT_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("empty {0}")]
    Empty(&'static str),
    #[error("invalid {kind}: {value:?}")]
    Invalid { kind: &'static str, value: String },
}

/// Check that `source` is usable as a single directory name under the root.
pub fn validate_source(source: &str) -> Result<&str, NameError> {
    validate_component("source", source)?;
    if source == CACHE_DIR_NAME {
        return Err(NameError::Invalid {
            kind: "source",
            value: source.to_string(),
        });
    }
    Ok(source)
}

/// Check that `name` is a plain file name (no traversal, not hidden).
pub fn validate_filename(name: &str) -> Result<&str, NameError> {
    validate_component("filename", name)
}

fn validate_component<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, NameError> {
    if value.is_empty() {
        return Err(NameError::Empty(kind));
    }
    if value.contains('/')
        || value.contains('\\')
        || value.contains("..")
        || value.starts_with('.')
        || value.chars().any(char::is_control)
    {
        return Err(NameError::Invalid {
            kind,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Replace every character that is unsafe in a path component with `_`.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.replace("..", "_").trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Name under which an uploaded recording is stored:
/// `<timestamp>_<original>` with `:` replaced so the name is portable.
pub fn stored_upload_name(timestamp: Option<&str>, original: &str, now: DateTime<Local>) -> String {
    let stamp = timestamp
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| now.format("%Y-%m-%dT%H:%M:%S").to_string());
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original);
    sanitize_component(&format!("{}_{}", stamp.replace(':', "-"), base))
}

/// strftime pattern for producer segment names, for ffmpeg's segment muxer.
pub fn segment_pattern(machine_id: &str, extension: &str) -> String {
    format!("{machine_id}_{SEGMENT_TIME_FORMAT}.{extension}")
}

/// Whether `name` is a visible file with one of `extensions`
/// (lower-case, without dot).
pub fn is_recording_name(name: &str, extensions: &[String]) -> bool {
    if name.starts_with('.') {
        return false;
    }
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

/// Metadata recovered from a producer segment name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub machine_id: String,
    pub recorded_at: NaiveDateTime,
}

impl SegmentName {
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        let stem = std::path::Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid segment name: {name}"))?;

        // Trailing `YYYYmmdd_HHMMSS` is 15 chars, preceded by `_`.
        if stem.len() < 17 || !stem.is_char_boundary(stem.len() - 15) {
            anyhow::bail!("Segment name too short: {stem}");
        }
        let (head, time_str) = stem.split_at(stem.len() - 15);
        let machine_id = head
            .strip_suffix('_')
            .filter(|m| !m.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No machine id in segment name: {stem}"))?;
        let recorded_at = NaiveDateTime::parse_from_str(time_str, SEGMENT_TIME_FORMAT)
            .map_err(|e| anyhow::anyhow!("Bad timestamp in segment name {stem}: {e}"))?;

        Ok(SegmentName {
            machine_id: machine_id.to_string(),
            recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(validate_source("m1").is_ok());
        assert!(validate_source("desk-01_alice").is_ok());
        assert_eq!(validate_source(""), Err(NameError::Empty("source")));
        assert!(validate_source("../etc").is_err());
        assert!(validate_source("a/b").is_err());
        assert!(validate_source("a\\b").is_err());
        assert!(validate_source(".hidden").is_err());
        assert!(validate_source(CACHE_DIR_NAME).is_err());
        assert!(validate_filename("a.mp4").is_ok());
        assert!(validate_filename("..mp4").is_err());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("host name:1"), "host_name_1");
        assert_eq!(sanitize_component("../x"), "__x");
        assert_eq!(sanitize_component("..."), "_.");
        assert_eq!(sanitize_component(""), "_");
    }

    #[test]
    fn test_stored_upload_name() {
        let now = Local.with_ymd_and_hms(2024, 2, 24, 16, 19, 37).unwrap();
        assert_eq!(
            stored_upload_name(Some("2024-02-24T10:00:00"), "a.mp4", now),
            "2024-02-24T10-00-00_a.mp4"
        );
        assert_eq!(
            stored_upload_name(None, "dir/b.mp4", now),
            "2024-02-24T16-19-37_b.mp4"
        );
    }

    #[test]
    fn test_segment_pattern_round_trip() {
        let at = NaiveDate::from_ymd_opt(2024, 2, 24)
            .unwrap()
            .and_hms_opt(16, 19, 37)
            .unwrap();
        let name = at.format(&segment_pattern("desk-01_alice", "mp4")).to_string();
        assert_eq!(name, "desk-01_alice_20240224_161937.mp4");

        let parsed = SegmentName::parse(&name).unwrap();
        assert_eq!(parsed.machine_id, "desk-01_alice");
        assert_eq!(parsed.recorded_at, at);
    }

    #[test]
    fn test_is_recording_name() {
        let extensions = vec!["mp4".to_string(), "avi".to_string()];
        assert!(is_recording_name("a.Mp4", &extensions));
        assert!(is_recording_name("b.avi", &extensions));
        assert!(!is_recording_name("c.mkv", &extensions));
        assert!(!is_recording_name("noext", &extensions));
        assert!(!is_recording_name(".upload-a.mp4", &extensions));
    }

    #[test]
    fn test_segment_name_rejects_garbage() {
        assert!(SegmentName::parse("short.mp4").is_err());
        assert!(SegmentName::parse("_20240224_161937.mp4").is_err());
        assert!(SegmentName::parse("m1_2024022x_161937.mp4").is_err());
    }
}
