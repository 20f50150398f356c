//! Download registry - owns every record and routes commands to workers
//!
//! This is the single access point for the engine. It enforces the state
//! machine, keeps at most one live transfer handle per record, and
//! broadcasts snapshots to subscribers. Commands validate state and return
//! immediately; transfer I/O completes through the event stream.

use crate::engine::probe;
use crate::engine::store::RecordStore;
use crate::engine::worker::{SharedRecords, TransferWorker};
use crate::error::EngineError;
use downdraft_types::{
    is_downloadable_url, DownloadRecord, DownloadState, EngineEvent, FileMetadata, Settings,
};
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use url::Url;

/// Coordinates all downloads.
pub struct DownloadRegistry {
    /// Every known record, live or terminal
    records: SharedRecords,
    /// Live transfer handles, at most one per id. Commands that create a
    /// handle hold this lock from validation through insertion, which is
    /// what serializes per-id command races.
    active: Arc<RwLock<HashMap<String, TransferHandle>>>,
    /// HTTP client; redirects are followed manually by the engine
    client: Client,
    store: RecordStore,
    event_tx: broadcast::Sender<EngineEvent>,
}

/// Handle to a running transfer.
struct TransferHandle {
    task: tokio::task::JoinHandle<()>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl DownloadRegistry {
    /// Create a registry backed by `data_dir`, restoring persisted records.
    pub async fn new(data_dir: PathBuf) -> Result<Self, EngineError> {
        let store = RecordStore::open(&data_dir).await?;
        let records: HashMap<String, DownloadRecord> = store
            .load()
            .await
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let client = Client::builder()
            .user_agent(concat!("downdraft/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            records: Arc::new(RwLock::new(records)),
            active: Arc::new(RwLock::new(HashMap::new())),
            client,
            store,
            event_tx,
        })
    }

    /// Subscribe to record snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Probe a URL for filename, extension, size and resumability.
    pub async fn fetch_metadata(&self, url: &str) -> Result<FileMetadata, EngineError> {
        let parsed = parse_downloadable(url)?;
        probe::probe(&self.client, &parsed).await
    }

    /// Start a new download, or restart an existing one when `resume` is set.
    pub async fn start(
        &self,
        id: &str,
        url: &str,
        destination: PathBuf,
        resume: bool,
    ) -> Result<DownloadRecord, EngineError> {
        parse_downloadable(url)?;

        let mut active = self.active.write().await;
        if active.contains_key(id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }

        if self.records.read().await.contains_key(id) {
            if !resume {
                return Err(EngineError::DuplicateId(id.to_string()));
            }
            return self.restart_locked(id, &mut active).await;
        }

        let record = DownloadRecord::new(id.to_string(), url.to_string(), destination);
        self.records
            .write()
            .await
            .insert(id.to_string(), record.clone());
        self.notify_state_change(&record);

        let handle = self.spawn_worker(id.to_string(), 0);
        active.insert(id.to_string(), handle);

        info!("started download {} from {}", id, url);
        Ok(record)
    }

    /// Pause a downloading record.
    ///
    /// State flips to `paused` before the handles are torn down, so the
    /// teardown's own read error cannot re-flip the record to `error`.
    pub async fn pause(&self, id: &str) -> Result<DownloadRecord, EngineError> {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if record.state != DownloadState::Downloading {
                return Err(EngineError::InvalidStateTransition {
                    id: id.to_string(),
                    state: record.state,
                    command: "pause",
                });
            }
            record.state = DownloadState::Paused;
            record.speed = 0;
            record.eta = None;
            record.clone()
        };
        self.notify_state_change(&snapshot);

        self.teardown(id, false).await;
        info!("paused download {}", id);
        Ok(snapshot)
    }

    /// Resume a paused (or errored) record.
    pub async fn resume(&self, id: &str) -> Result<DownloadRecord, EngineError> {
        let mut active = self.active.write().await;
        if active.contains_key(id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        self.restart_locked(id, &mut active).await
    }

    /// Cancel a record in any non-terminal state.
    ///
    /// Tears down handles and best-effort deletes the partial file; a
    /// cleanup failure is logged, never raised.
    pub async fn cancel(&self, id: &str) -> Result<DownloadRecord, EngineError> {
        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if record.state.is_terminal() {
                return Err(EngineError::InvalidStateTransition {
                    id: id.to_string(),
                    state: record.state,
                    command: "cancel",
                });
            }
            record.state = DownloadState::Cancelled;
            record.speed = 0;
            record.eta = None;
            record.clone()
        };
        self.notify_state_change(&snapshot);

        self.teardown(id, true).await;

        if let Err(e) = tokio::fs::remove_file(&snapshot.destination_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to delete partial file {:?}: {}",
                    snapshot.destination_path, e
                );
            }
        }

        info!("cancelled download {}", id);
        Ok(snapshot)
    }

    /// Current snapshot of one record.
    pub async fn status(&self, id: &str) -> Result<DownloadRecord, EngineError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Snapshots of every record, oldest first.
    pub async fn list(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<DownloadRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        records
    }

    /// Remove one terminal record, or every terminal record when `id` is
    /// `None`. Removing a non-terminal record is a no-op.
    pub async fn clear(&self, id: Option<&str>) -> Result<(), EngineError> {
        let removed: Vec<String> = {
            let mut records = self.records.write().await;
            match id {
                Some(id) => {
                    let record = records
                        .get(id)
                        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
                    if record.is_terminal() {
                        records.remove(id);
                        vec![id.to_string()]
                    } else {
                        Vec::new()
                    }
                }
                None => {
                    let ids: Vec<String> = records
                        .values()
                        .filter(|r| r.is_terminal())
                        .map(|r| r.id.clone())
                        .collect();
                    for id in &ids {
                        records.remove(id);
                    }
                    ids
                }
            }
        };

        for id in removed {
            let _ = self.event_tx.send(EngineEvent::Removed { id });
        }
        self.store.schedule_save(self.records.clone());
        Ok(())
    }

    /// Whether a transfer handle is currently live for `id`.
    pub async fn is_active(&self, id: &str) -> bool {
        self.active.read().await.contains_key(id)
    }

    /// Count of live transfers.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Write the current record collection out immediately.
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.store.save_now(&self.records).await
    }

    /// Load settings stored beside the records file.
    pub async fn settings(&self) -> Settings {
        self.store.load_settings().await
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<(), EngineError> {
        self.store.save_settings(settings).await
    }

    /// Flip an existing paused/errored record back to downloading and spawn
    /// its worker. The caller holds the handle-map lock, so no second handle
    /// can appear for this id in between.
    ///
    /// The resume offset comes from the actual on-disk file size, not the
    /// in-memory counter: a crash between a write and a counter update must
    /// not lose or duplicate bytes.
    async fn restart_locked(
        &self,
        id: &str,
        active: &mut HashMap<String, TransferHandle>,
    ) -> Result<DownloadRecord, EngineError> {
        let destination = {
            let records = self.records.read().await;
            let record = records
                .get(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            match record.state {
                DownloadState::Paused | DownloadState::Error => {}
                state => {
                    return Err(EngineError::InvalidStateTransition {
                        id: id.to_string(),
                        state,
                        command: "resume",
                    })
                }
            }
            record.destination_path.clone()
        };

        let resume_from = match tokio::fs::metadata(&destination).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let snapshot = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            record.state = DownloadState::Downloading;
            record.error = None;
            record.speed = 0;
            record.eta = None;
            record.bytes_downloaded = resume_from;
            record.clone()
        };
        self.notify_state_change(&snapshot);

        let handle = self.spawn_worker(id.to_string(), resume_from);
        active.insert(id.to_string(), handle);

        info!("resumed download {} from byte {}", id, resume_from);
        Ok(snapshot)
    }

    fn spawn_worker(&self, id: String, resume_from: u64) -> TransferHandle {
        let paused = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = TransferWorker::new(
            id.clone(),
            self.records.clone(),
            self.client.clone(),
            self.store.clone(),
            self.event_tx.clone(),
            paused.clone(),
            cancelled.clone(),
            resume_from,
        );

        let active = self.active.clone();
        let task = tokio::spawn(async move {
            worker.run().await;
            active.write().await.remove(&id);
        });

        TransferHandle {
            task,
            paused,
            cancelled,
        }
    }

    /// Remove and stop the live handle for `id`, if any.
    ///
    /// The record's state must already reflect the pause/cancel: the worker
    /// filters its teardown error on that state.
    async fn teardown(&self, id: &str, cancel: bool) {
        if let Some(handle) = self.active.write().await.remove(id) {
            if cancel {
                handle.cancelled.store(true, Ordering::Release);
            } else {
                handle.paused.store(true, Ordering::Release);
            }
            handle.task.abort();
        }
    }

    fn notify_state_change(&self, record: &DownloadRecord) {
        let _ = self.event_tx.send(EngineEvent::StateChanged {
            id: record.id.clone(),
            record: record.clone(),
        });
        self.store.schedule_save(self.records.clone());
    }
}

fn parse_downloadable(url: &str) -> Result<Url, EngineError> {
    if !is_downloadable_url(url) {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }
    Url::parse(url).map_err(|_| EngineError::InvalidUrl(url.to_string()))
}
