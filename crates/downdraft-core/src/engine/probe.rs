//! Metadata probing
//!
//! Answers "what would downloading this URL give me" without downloading it:
//! filename, extension, size, and whether the server honors byte ranges.

use crate::engine::resolver::{self, PROBE_TIMEOUT};
use crate::error::EngineError;
use downdraft_types::FileMetadata;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use std::path::Path;
use tokio::time::timeout;
use tracing::warn;
use url::Url;

/// Fallback extension when nothing else applies.
const DEFAULT_EXTENSION: &str = ".download";

/// Content types we can name an extension for.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("application/pdf", ".pdf"),
    ("video/mp4", ".mp4"),
    ("video/x-matroska", ".mkv"),
    ("audio/mpeg", ".mp3"),
    ("audio/mp4", ".m4a"),
    ("application/zip", ".zip"),
    ("application/x-rar-compressed", ".rar"),
    ("application/x-iso9660-image", ".iso"),
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("application/x-gzip", ".gz"),
    ("application/x-tar", ".tar"),
];

/// Probe `url` for metadata, resolving redirects first.
///
/// Redirect-loop exhaustion is fatal; any other resolution failure falls
/// back to probing the original URL.
pub async fn probe(client: &Client, url: &Url) -> Result<FileMetadata, EngineError> {
    let resolved = match resolver::resolve(client, url, resolver::MAX_REDIRECT_HOPS).await {
        Ok(resolved) => Some(resolved),
        Err(EngineError::TooManyRedirects) => return Err(EngineError::TooManyRedirects),
        Err(e) => {
            warn!("redirect resolution failed for {url}: {e}; probing original URL");
            None
        }
    };

    let target = resolved.as_ref().unwrap_or(url);
    let mut metadata = probe_resolved(client, target).await?;
    metadata.final_url = resolved.map(|u| u.to_string());
    Ok(metadata)
}

/// Probe a URL that has already been through the resolver.
pub async fn probe_resolved(client: &Client, url: &Url) -> Result<FileMetadata, EngineError> {
    let response = timeout(PROBE_TIMEOUT, client.head(url.as_str()).send())
        .await
        .map_err(|_| EngineError::Network(format!("metadata probe of {url} timed out")))??;

    let headers = response.headers();
    let supports_range = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|s| s == "bytes")
        .unwrap_or(false);
    let file_size: u64 = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let content_disposition = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok());
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());

    let file_name = derive_filename(url, content_disposition);
    let file_extension = derive_extension(&file_name, content_type, url);

    Ok(FileMetadata {
        file_name,
        file_extension,
        file_size,
        // A range-capable response with no length still cannot be resumed.
        supports_resume: supports_range && file_size > 0,
        final_url: None,
    })
}

/// Filename precedence: Content-Disposition, then the decoded basename of
/// the URL path, then a generated fallback.
fn derive_filename(url: &Url, content_disposition: Option<&str>) -> String {
    if let Some(name) = content_disposition.and_then(disposition_filename) {
        return name;
    }

    if let Some(segment) = url.path_segments().and_then(|s| s.filter(|p| !p.is_empty()).last()) {
        return urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());
    }

    format!("download_{}", chrono::Utc::now().timestamp())
}

fn disposition_filename(value: &str) -> Option<String> {
    let name = value
        .split("filename=")
        .nth(1)?
        .split(';')
        .next()?
        .trim()
        .trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}

/// Extension precedence: extension of the resolved filename, then the
/// content-type table, then the URL path, then `.download`.
fn derive_extension(file_name: &str, content_type: Option<&str>, url: &Url) -> String {
    if let Some(ext) = extension_of(file_name) {
        return ext;
    }

    if let Some(content_type) = content_type {
        for (mime, ext) in MIME_EXTENSIONS {
            if content_type.contains(mime) {
                return (*ext).to_string();
            }
        }
    }

    if let Some(ext) = extension_of(url.path()) {
        return ext;
    }

    DEFAULT_EXTENSION.to_string()
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
}
