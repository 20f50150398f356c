//! Error types for the downdraft engine

use downdraft_types::DownloadState;
use thiserror::Error;

/// Errors that can occur in the download engine.
///
/// Validation errors (`InvalidUrl`, `DuplicateId`, `InvalidStateTransition`,
/// `NotFound`) are returned synchronously and never touch record state.
/// Transfer-time errors are captured into the record and surfaced through an
/// `error` state transition.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Download already exists: {0}")]
    DuplicateId(String),

    #[error("Download {id} is {state:?}, cannot {command}")]
    InvalidStateTransition {
        id: String,
        state: DownloadState,
        command: &'static str,
    },

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        EngineError::Network(error.to_string())
    }
}

// Allow converting to String for adapter surfaces
impl From<EngineError> for String {
    fn from(error: EngineError) -> Self {
        error.to_string()
    }
}
