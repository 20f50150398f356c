//! Persistence store
//!
//! Serializes the full record collection to `downloads.json` in the data
//! directory. Writes are debounced: every change re-arms a 300 ms timer and
//! the snapshot is taken when the timer fires, so bursts of progress updates
//! coalesce into one write. The store is informational, not a commit log -
//! a lost trailing write costs at most a little re-downloaded data.

use crate::error::EngineError;
use downdraft_types::{DownloadRecord, DownloadState, Settings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Quiet period before a scheduled write lands.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

const RECORDS_FILE: &str = "downloads.json";
const SETTINGS_FILE: &str = "settings.json";

/// Durable snapshot storage for download records and settings.
#[derive(Clone)]
pub struct RecordStore {
    records_path: PathBuf,
    settings_path: PathBuf,
    pending: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl RecordStore {
    /// Open (and create if needed) the store under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(data_dir).await?;

        Ok(Self {
            records_path: data_dir.join(RECORDS_FILE),
            settings_path: data_dir.join(SETTINGS_FILE),
            pending: Arc::new(parking_lot::Mutex::new(None)),
        })
    }

    /// Load all persisted records.
    ///
    /// A record found in `downloading` state is demoted to `paused`: no live
    /// transfer handle survives a restart, so resumption must be explicit.
    /// A missing or unreadable file yields an empty collection.
    pub async fn load(&self) -> Vec<DownloadRecord> {
        let raw = match fs::read_to_string(&self.records_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("failed to read {:?}: {}", self.records_path, e);
                return Vec::new();
            }
        };

        let mut records: Vec<DownloadRecord> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!("discarding corrupt snapshot {:?}: {}", self.records_path, e);
                return Vec::new();
            }
        };

        for record in &mut records {
            if record.state == DownloadState::Downloading {
                record.state = DownloadState::Paused;
                record.speed = 0;
                record.eta = None;
            }
        }

        info!("loaded {} downloads from {:?}", records.len(), self.records_path);
        records
    }

    /// Schedule a debounced write of the record collection.
    ///
    /// Cancels any pending write and re-arms the timer; the snapshot is read
    /// from `records` when the timer fires, so the latest state wins.
    pub fn schedule_save(&self, records: Arc<RwLock<HashMap<String, DownloadRecord>>>) {
        let path = self.records_path.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            let snapshot = snapshot_of(&records).await;
            if let Err(e) = write_snapshot(&path, &snapshot).await {
                warn!("failed to save downloads to {:?}: {}", path, e);
            }
        });

        let mut pending = self.pending.lock();
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
    }

    /// Write the record collection immediately, cancelling any pending write.
    pub async fn save_now(
        &self,
        records: &Arc<RwLock<HashMap<String, DownloadRecord>>>,
    ) -> Result<(), EngineError> {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        let snapshot = snapshot_of(records).await;
        write_snapshot(&self.records_path, &snapshot).await
    }

    /// Load settings, falling back to defaults when absent or unreadable.
    pub async fn load_settings(&self) -> Settings {
        match fs::read_to_string(&self.settings_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("discarding corrupt settings {:?}: {}", self.settings_path, e);
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        atomic_write(&self.settings_path, content.as_bytes()).await
    }
}

async fn snapshot_of(
    records: &Arc<RwLock<HashMap<String, DownloadRecord>>>,
) -> Vec<DownloadRecord> {
    let mut snapshot: Vec<DownloadRecord> = records.read().await.values().cloned().collect();
    snapshot.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    snapshot
}

async fn write_snapshot(path: &Path, snapshot: &[DownloadRecord]) -> Result<(), EngineError> {
    let content = serde_json::to_string_pretty(snapshot)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    atomic_write(path, content.as_bytes()).await
}

/// Write through a temp file and rename so a crash never leaves a torn file.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EngineError> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(id: &str, state: DownloadState) -> DownloadRecord {
        let mut record = DownloadRecord::new(
            id.to_string(),
            format!("https://example.com/{id}"),
            PathBuf::from(format!("/tmp/{id}.bin")),
        );
        record.state = state;
        record
    }

    fn shared(records: Vec<DownloadRecord>) -> Arc<RwLock<HashMap<String, DownloadRecord>>> {
        Arc::new(RwLock::new(
            records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        ))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();

        let records = shared(vec![record("a", DownloadState::Completed)]);
        store.save_now(&records).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[0].state, DownloadState::Completed);
    }

    #[tokio::test]
    async fn downloading_records_demote_to_paused_on_load() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();

        let records = shared(vec![
            record("live", DownloadState::Downloading),
            record("done", DownloadState::Completed),
        ]);
        store.save_now(&records).await.unwrap();

        let loaded = store.load().await;
        let live = loaded.iter().find(|r| r.id == "live").unwrap();
        let done = loaded.iter().find(|r| r.id == "done").unwrap();
        assert_eq!(live.state, DownloadState::Paused);
        assert_eq!(done.state, DownloadState::Completed);
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        fs::write(dir.path().join(RECORDS_FILE), b"{not json")
            .await
            .unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn rapid_changes_coalesce_into_one_write() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        let records = shared(vec![record("a", DownloadState::Downloading)]);

        for i in 0..20 {
            records.write().await.get_mut("a").unwrap().bytes_downloaded = i * 100;
            store.schedule_save(records.clone());
        }

        // Nothing lands inside the quiet window.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dir.path().join(RECORDS_FILE).exists());

        // One write carrying the final state lands after it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].bytes_downloaded, 1900);
    }

    #[tokio::test]
    async fn snapshot_uses_wire_field_names() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        let records = shared(vec![record("a", DownloadState::Paused)]);
        store.save_now(&records).await.unwrap();

        let raw = fs::read_to_string(dir.path().join(RECORDS_FILE)).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value.as_array().unwrap()[0];
        for key in ["id", "url", "destinationPath", "startTime", "bytesDownloaded", "totalBytes", "state", "supportsResume"] {
            assert!(entry.get(key).is_some(), "missing field {key}");
        }
    }

    #[tokio::test]
    async fn settings_default_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        let settings = store.load_settings().await;
        assert_eq!(settings.bridge_port, Settings::default().bridge_port);

        store.save_settings(&settings).await.unwrap();
        assert!(dir.path().join(SETTINGS_FILE).exists());
    }
}
