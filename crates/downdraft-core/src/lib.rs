//! downdraft core - resumable HTTP(S) download engine
//!
//! This crate provides the download engine: URL resolution and metadata
//! probing, streaming transfers with byte-range pause/resume, progress and
//! ETA reporting, and crash-safe persistence of the download registry.

mod engine;
mod error;

pub use engine::*;
pub use error::*;
