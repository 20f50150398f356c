//! Progress bar utilities for CLI downloads

use console::style;
use downdraft_types::{DownloadRecord, DownloadState, EngineEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

/// Manages progress bars for one or more downloads, fed by engine events.
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Get or create the bar for a record.
    pub fn bar_for(&mut self, record: &DownloadRecord) -> ProgressBar {
        if let Some(bar) = self.bars.get(&record.id) {
            return bar.clone();
        }

        let bar = self.multi.add(ProgressBar::new(record.total_bytes));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
                .unwrap()
                .progress_chars("█▓▒░  "),
        );
        let name = record
            .destination_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.id.clone());
        bar.set_message(name);
        bar.set_position(record.bytes_downloaded);

        self.bars.insert(record.id.clone(), bar.clone());
        bar
    }

    /// Update bars from an engine event.
    pub fn handle_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Progress { record, .. } => {
                let bar = self.bar_for(record);
                if record.total_bytes > 0 {
                    bar.set_length(record.total_bytes);
                }
                bar.set_position(record.bytes_downloaded);
            }

            EngineEvent::StateChanged { record, .. } => {
                let bar = self.bar_for(record);
                match record.state {
                    DownloadState::Completed => {
                        bar.set_position(record.total_bytes.max(record.bytes_downloaded));
                        bar.finish_with_message(format!(
                            "{} complete",
                            style("✓").green().bold()
                        ));
                    }
                    DownloadState::Error => {
                        bar.abandon_with_message(format!(
                            "{} failed: {}",
                            style("✗").red().bold(),
                            record.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                    DownloadState::Cancelled => {
                        bar.abandon_with_message(format!("{} cancelled", style("✗").dim()));
                    }
                    DownloadState::Paused => {
                        bar.set_message(format!("{} paused", style("⏸").yellow()));
                    }
                    DownloadState::Downloading => {}
                }
            }

            EngineEvent::Removed { id } => {
                if let Some(bar) = self.bars.remove(id) {
                    bar.finish_and_clear();
                }
            }
        }
    }
}
