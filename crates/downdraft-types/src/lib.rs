//! Shared types for downdraft
//!
//! This crate contains the data model shared across the engine, the
//! loopback bridge, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Download Types
// ============================================================================

/// A single tracked download.
///
/// The serialized form of this struct (camelCase) is also the on-disk
/// snapshot schema, so renaming a field here changes the persistence format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    /// Caller-assigned identifier, opaque to the engine
    pub id: String,
    /// URL the download was requested with
    pub url: String,
    /// URL after following redirects, once known
    #[serde(default)]
    pub final_url: Option<String>,
    /// Absolute destination file path; never changes across a resume
    pub destination_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub bytes_downloaded: u64,
    /// Total size in bytes; 0 means unknown
    pub total_bytes: u64,
    pub state: DownloadState,
    /// Last transfer-time error, if any
    #[serde(default)]
    pub error: Option<String>,
    /// Smoothed transfer rate in bytes/sec
    #[serde(default)]
    pub speed: u64,
    /// Estimated seconds to completion, when the rate and size are known
    #[serde(default)]
    pub eta: Option<u64>,
    #[serde(default)]
    pub supports_resume: bool,
}

impl DownloadRecord {
    pub fn new(id: String, url: String, destination_path: PathBuf) -> Self {
        Self {
            id,
            url,
            final_url: None,
            destination_path,
            start_time: Utc::now(),
            bytes_downloaded: 0,
            total_bytes: 0,
            state: DownloadState::Downloading,
            error: None,
            speed: 0,
            eta: None,
            supports_resume: false,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// State of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl DownloadState {
    /// Terminal states admit no further transition without a fresh start.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Error | DownloadState::Cancelled
        )
    }
}

// ============================================================================
// Metadata Types
// ============================================================================

/// Result of probing a URL without downloading it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    /// Extension including the leading dot, e.g. ".mp4"
    pub file_extension: String,
    /// Size in bytes; 0 means the server did not report one
    pub file_size: u64,
    pub supports_resume: bool,
    /// URL after redirects, when resolution succeeded
    pub final_url: Option<String>,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the engine to subscribers.
///
/// Every variant that refers to a live record carries a full snapshot so
/// subscribers never have to read engine state back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Progress {
        id: String,
        record: DownloadRecord,
    },
    StateChanged {
        id: String,
        record: DownloadRecord,
    },
    Removed {
        id: String,
    },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub bridge_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            bridge_port: 37821,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Whether a string is a URL the engine will accept.
///
/// Only http and https are downloadable; everything else is rejected before
/// a record is created.
pub fn is_downloadable_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_schema_uses_camel_case_fields() {
        let record = DownloadRecord::new(
            "dl-1".to_string(),
            "https://example.com/file.bin".to_string(),
            PathBuf::from("/tmp/file.bin"),
        );

        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "id",
            "url",
            "destinationPath",
            "startTime",
            "bytesDownloaded",
            "totalBytes",
            "state",
            "error",
            "speed",
            "eta",
            "supportsResume",
        ] {
            assert!(json.get(key).is_some(), "missing snapshot field {key}");
        }
        assert_eq!(json["state"], "downloading");
    }

    #[test]
    fn terminal_states() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(DownloadState::Error.is_terminal());
        assert!(!DownloadState::Downloading.is_terminal());
        assert!(!DownloadState::Paused.is_terminal());
    }

    #[test]
    fn url_scheme_gate() {
        assert!(is_downloadable_url("https://example.com/a"));
        assert!(is_downloadable_url("http://example.com"));
        assert!(!is_downloadable_url("ftp://example.com/a"));
        assert!(!is_downloadable_url("not a url"));
    }
}
