//! Transfer worker - streams one download to its destination file
//!
//! One worker per live transfer. The worker owns the network connection and
//! the file handle; the registry owns the record. Progress flows back through
//! the shared record map and the event channel.

use crate::engine::probe;
use crate::engine::resolver::{self, MAX_REDIRECT_HOPS};
use crate::engine::store::RecordStore;
use crate::error::EngineError;
use downdraft_types::{DownloadRecord, DownloadState, EngineEvent};
use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, LOCATION, RANGE};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

/// Minimum spacing between progress samples.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Exponential moving average weight for the displayed rate.
const SPEED_ALPHA: f64 = 0.3;

pub(crate) type SharedRecords = Arc<RwLock<HashMap<String, DownloadRecord>>>;

/// A worker that downloads a single record's payload.
pub struct TransferWorker {
    id: String,
    records: SharedRecords,
    client: Client,
    store: RecordStore,
    event_tx: broadcast::Sender<EngineEvent>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    /// Byte offset to continue from, taken from the on-disk file size
    resume_from: u64,
}

impl TransferWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        records: SharedRecords,
        client: Client,
        store: RecordStore,
        event_tx: broadcast::Sender<EngineEvent>,
        paused: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
        resume_from: u64,
    ) -> Self {
        Self {
            id,
            records,
            client,
            store,
            event_tx,
            paused,
            cancelled,
            resume_from,
        }
    }

    /// Run the transfer to completion, capturing any failure into the record.
    pub async fn run(self) {
        if let Err(e) = self.transfer().await {
            self.record_failure(e).await;
        }
    }

    async fn transfer(&self) -> Result<(), EngineError> {
        let (source_url, destination, mut supports_resume, mut total_bytes) = {
            let records = self.records.read().await;
            let record = records
                .get(&self.id)
                .ok_or_else(|| EngineError::NotFound(self.id.clone()))?;
            (
                record.url.clone(),
                record.destination_path.clone(),
                record.supports_resume,
                record.total_bytes,
            )
        };

        let source =
            Url::parse(&source_url).map_err(|_| EngineError::InvalidUrl(source_url.clone()))?;

        // Resolve the redirect chain up front. Loop exhaustion is fatal for
        // this attempt; a transport failure falls back to the original URL.
        let mut current = match resolver::resolve(&self.client, &source, MAX_REDIRECT_HOPS).await {
            Ok(resolved) => resolved,
            Err(EngineError::TooManyRedirects) => return Err(EngineError::TooManyRedirects),
            Err(e) => {
                warn!("redirect resolution failed for {source}: {e}; using original URL");
                source.clone()
            }
        };

        // Fresh records have no metadata yet. A failed probe is not fatal -
        // the GET below reports the authoritative error if there is one.
        if self.resume_from == 0 && total_bytes == 0 {
            match probe::probe_resolved(&self.client, &current).await {
                Ok(meta) => {
                    total_bytes = meta.file_size;
                    supports_resume = meta.supports_resume;
                }
                Err(e) => warn!("metadata probe failed for {current}: {e}; continuing"),
            }
        }

        let resume_offset = if self.resume_from > 0 && supports_resume {
            self.resume_from
        } else {
            0
        };

        // The file may already hold every byte (paused right at the end).
        if resume_offset > 0 && total_bytes > 0 && resume_offset >= total_bytes {
            if let Some(snapshot) = self.finish(resume_offset).await {
                let _ = self.event_tx.send(EngineEvent::StateChanged {
                    id: self.id.clone(),
                    record: snapshot,
                });
                self.store.schedule_save(self.records.clone());
            }
            return Ok(());
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Issue the GET, restarting on any mid-transfer redirect. Restarts
        // consume the same hop budget the resolver uses.
        let mut hops_left = MAX_REDIRECT_HOPS;
        let (response, mut file, mut bytes_downloaded) = loop {
            if self.should_stop() {
                return Ok(());
            }

            let mut request = self.client.get(current.clone());
            if resume_offset > 0 {
                request = request.header(RANGE, format!("bytes={resume_offset}-"));
            }
            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    if hops_left == 0 {
                        return Err(EngineError::TooManyRedirects);
                    }
                    hops_left -= 1;
                    let next = current
                        .join(location)
                        .map_err(|_| EngineError::InvalidUrl(location.to_string()))?;
                    debug!("transfer redirect {} -> {}", current, next);
                    current = next;
                    continue;
                }
            }

            let content_length = response.content_length();
            let range_capable = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|s| s == "bytes")
                .unwrap_or(false);

            if status == StatusCode::PARTIAL_CONTENT && resume_offset > 0 {
                // Partial response: the total is what we have plus the rest.
                if let Some(len) = content_length {
                    total_bytes = resume_offset + len;
                }
                supports_resume = true;
                let file = OpenOptions::new().append(true).open(&destination).await?;
                break (response, file, resume_offset);
            } else if status.is_success() {
                // Full response. If we had asked for a range the server
                // ignored it, so the file restarts from zero either way.
                if let Some(len) = content_length {
                    total_bytes = len;
                }
                supports_resume = range_capable && content_length.unwrap_or(0) > 0;
                let file = File::create(&destination).await?;
                break (response, file, 0);
            } else {
                return Err(EngineError::HttpStatus {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }
        };

        let final_url = (current != source).then(|| current.to_string());
        if let Some(snapshot) = self
            .update_record(|record| {
                record.total_bytes = total_bytes;
                record.bytes_downloaded = bytes_downloaded;
                record.supports_resume = supports_resume;
                record.final_url = final_url.clone();
                record.speed = 0;
                record.eta = None;
            })
            .await
        {
            let _ = self.event_tx.send(EngineEvent::Progress {
                id: self.id.clone(),
                record: snapshot,
            });
        }
        self.store.schedule_save(self.records.clone());

        info!(
            "transfer started for {} ({} -> {:?}, from byte {})",
            self.id, current, destination, bytes_downloaded
        );

        // Stream the body straight to disk, sampling progress as we go.
        let mut stream = response.bytes_stream();
        let mut last_sample = Instant::now();
        let mut last_bytes = bytes_downloaded;
        let mut smoothed: f64 = 0.0;

        while let Some(next) = stream.next().await {
            if self.should_stop() {
                // Leave the on-disk size honest for a later resume.
                let _ = file.flush().await;
                return Ok(());
            }

            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    if self.should_stop() {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            };

            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;

            if last_sample.elapsed() >= PROGRESS_INTERVAL {
                let elapsed = last_sample.elapsed().as_secs_f64();
                let instant = (bytes_downloaded - last_bytes) as f64 / elapsed;
                smoothed = if smoothed == 0.0 {
                    instant
                } else {
                    SPEED_ALPHA * instant + (1.0 - SPEED_ALPHA) * smoothed
                };
                let speed = smoothed as u64;
                let eta = if speed > 0 && total_bytes > 0 {
                    Some(total_bytes.saturating_sub(bytes_downloaded) / speed)
                } else {
                    None
                };

                if let Some(snapshot) = self
                    .update_record(|record| {
                        record.bytes_downloaded = bytes_downloaded;
                        record.speed = speed;
                        record.eta = eta;
                    })
                    .await
                {
                    let _ = self.event_tx.send(EngineEvent::Progress {
                        id: self.id.clone(),
                        record: snapshot,
                    });
                }
                self.store.schedule_save(self.records.clone());

                last_sample = Instant::now();
                last_bytes = bytes_downloaded;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(snapshot) = self.finish(bytes_downloaded).await {
            info!("transfer completed for {}", self.id);
            let _ = self.event_tx.send(EngineEvent::StateChanged {
                id: self.id.clone(),
                record: snapshot,
            });
            self.store.schedule_save(self.records.clone());
        }

        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.paused.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire)
    }

    async fn update_record(&self, f: impl FnOnce(&mut DownloadRecord)) -> Option<DownloadRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&self.id)?;
        f(record);
        Some(record.clone())
    }

    /// Mark the record completed, snapping the counters to the final size.
    async fn finish(&self, bytes_downloaded: u64) -> Option<DownloadRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&self.id)?;
        if record.state != DownloadState::Downloading {
            return None;
        }
        record.state = DownloadState::Completed;
        if record.total_bytes == 0 {
            record.total_bytes = bytes_downloaded;
        }
        record.bytes_downloaded = record.total_bytes;
        record.speed = 0;
        record.eta = None;
        record.error = None;
        Some(record.clone())
    }

    /// Capture a transfer-time failure into the record.
    ///
    /// Tearing down the connection for a pause or cancel surfaces a read
    /// error on this side; the record's current state decides whether the
    /// error is real.
    async fn record_failure(&self, failure: EngineError) {
        let snapshot = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&self.id) else {
                return;
            };
            if matches!(
                record.state,
                DownloadState::Paused | DownloadState::Cancelled
            ) {
                debug!("suppressing teardown error for {}: {}", self.id, failure);
                return;
            }
            record.state = DownloadState::Error;
            record.error = Some(failure.to_string());
            record.speed = 0;
            record.eta = None;
            record.clone()
        };

        error!("transfer failed for {}: {}", self.id, failure);
        let _ = self.event_tx.send(EngineEvent::StateChanged {
            id: self.id.clone(),
            record: snapshot,
        });
        self.store.schedule_save(self.records.clone());
    }
}
