//! Output formatting utilities

use console::style;
use downdraft_types::{DownloadRecord, DownloadState, FileMetadata};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format an ETA in seconds as human-readable
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Styled one-word state label
pub fn state_label(state: DownloadState) -> String {
    match state {
        DownloadState::Downloading => style("downloading").cyan().to_string(),
        DownloadState::Paused => style("paused").yellow().to_string(),
        DownloadState::Completed => style("completed").green().to_string(),
        DownloadState::Error => style("error").red().to_string(),
        DownloadState::Cancelled => style("cancelled").dim().to_string(),
    }
}

pub fn print_metadata(meta: &FileMetadata) {
    println!("  File:      {}", style(&meta.file_name).cyan());
    println!("  Extension: {}", meta.file_extension);
    if meta.file_size > 0 {
        println!("  Size:      {}", format_bytes(meta.file_size));
    } else {
        println!("  Size:      unknown");
    }
    println!("  Resumable: {}", if meta.supports_resume { "yes" } else { "no" });
    if let Some(final_url) = &meta.final_url {
        println!("  Final URL: {}", final_url);
    }
}

pub fn print_record(record: &DownloadRecord) {
    println!("  ID:          {}", style(&record.id).cyan());
    println!("  URL:         {}", record.url);
    if let Some(final_url) = &record.final_url {
        println!("  Final URL:   {}", final_url);
    }
    println!("  Destination: {}", record.destination_path.display());
    println!("  State:       {}", state_label(record.state));
    if record.total_bytes > 0 {
        println!(
            "  Progress:    {} / {} ({:.1}%)",
            format_bytes(record.bytes_downloaded),
            format_bytes(record.total_bytes),
            record.progress()
        );
    } else {
        println!("  Progress:    {}", format_bytes(record.bytes_downloaded));
    }
    if record.speed > 0 {
        println!("  Speed:       {}", format_speed(record.speed));
    }
    if let Some(eta) = record.eta {
        println!("  ETA:         {}", format_eta(eta));
    }
    if let Some(error) = &record.error {
        println!("  Error:       {}", style(error).red());
    }
}
