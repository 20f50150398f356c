//! CLI command implementations

use crate::output;
use crate::progress::TransferProgress;
use crate::OutputFormat;
use anyhow::{anyhow, Result};
use console::style;
use downdraft_bridge::{BridgeServer, EnqueueRequest};
use downdraft_core::DownloadRegistry;
use downdraft_types::{DownloadState, EngineEvent};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Probe / Status
// ============================================================================

pub async fn probe(reg: &DownloadRegistry, url: &str, format: OutputFormat) -> Result<()> {
    let meta = reg.fetch_metadata(url).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&meta)?),
        OutputFormat::Human => {
            println!("{} {}", style("✓").green().bold(), url);
            output::print_metadata(&meta);
        }
    }

    Ok(())
}

pub async fn status(reg: &DownloadRegistry, id: &str, format: OutputFormat) -> Result<()> {
    let record = reg.status(id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Human => output::print_record(&record),
    }

    Ok(())
}

pub async fn list(reg: &DownloadRegistry, format: OutputFormat) -> Result<()> {
    let records = reg.list().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Human => {
            if records.is_empty() {
                println!("No downloads.");
                return Ok(());
            }

            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct Row {
                #[tabled(rename = "ID")]
                id: String,
                #[tabled(rename = "FILE")]
                file: String,
                #[tabled(rename = "STATE")]
                state: String,
                #[tabled(rename = "PROGRESS")]
                progress: String,
                #[tabled(rename = "SIZE")]
                size: String,
            }

            let rows: Vec<Row> = records
                .iter()
                .map(|r| Row {
                    id: r.id.clone(),
                    file: r
                        .destination_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    state: format!("{:?}", r.state).to_lowercase(),
                    progress: if r.total_bytes > 0 {
                        format!("{:.1}%", r.progress())
                    } else {
                        "-".to_string()
                    },
                    size: if r.total_bytes > 0 {
                        output::format_bytes(r.total_bytes)
                    } else {
                        "?".to_string()
                    },
                })
                .collect();

            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    reg: &DownloadRegistry,
    url: &str,
    output: Option<PathBuf>,
    id: Option<String>,
    resume: bool,
) -> Result<()> {
    let id = id.unwrap_or_else(short_id);

    // A resumed download keeps its original destination.
    let destination = if resume {
        match reg.status(&id).await {
            Ok(record) => record.destination_path,
            Err(_) => resolve_destination(reg, url, output).await?,
        }
    } else {
        resolve_destination(reg, url, output).await?
    };

    let mut events = reg.subscribe();
    let record = reg.start(&id, url, destination, resume).await?;

    let mut progress = TransferProgress::new();
    progress.bar_for(&record);

    let final_record = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    progress.handle_event(&event);
                    if let EngineEvent::StateChanged { id: event_id, record } = &event {
                        if *event_id == id && record.is_terminal() {
                            break record.clone();
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break reg.status(&id).await?,
            },
            _ = tokio::signal::ctrl_c() => {
                if reg.pause(&id).await.is_ok() {
                    reg.flush().await?;
                    println!(
                        "\n{} Paused. Resume with: downdraft get --resume --id {} {}",
                        style("⏸").yellow(),
                        id,
                        url
                    );
                    return Ok(());
                }
            }
        }
    };

    reg.flush().await?;

    match final_record.state {
        DownloadState::Completed => {
            println!(
                "{} Saved to {}",
                style("✓").green().bold(),
                final_record.destination_path.display()
            );
            Ok(())
        }
        DownloadState::Error => Err(anyhow!(
            "download failed: {}",
            final_record.error.unwrap_or_else(|| "unknown error".to_string())
        )),
        _ => Ok(()),
    }
}

pub async fn cancel(reg: &DownloadRegistry, id: &str) -> Result<()> {
    reg.cancel(id).await?;
    reg.flush().await?;
    println!("{} Cancelled {}", style("✗").red().bold(), id);
    Ok(())
}

pub async fn clear(reg: &DownloadRegistry, id: Option<&str>) -> Result<()> {
    reg.clear(id).await?;
    reg.flush().await?;
    match id {
        Some(id) => println!("{} Cleared {}", style("✓").green(), id),
        None => println!("{} Cleared finished downloads", style("✓").green()),
    }
    Ok(())
}

// ============================================================================
// Enqueue Bridge
// ============================================================================

pub async fn listen(
    reg: &DownloadRegistry,
    port: Option<u16>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let settings = reg.settings().await;
    let port = port.unwrap_or(settings.bridge_port);
    let download_dir = dir.unwrap_or(settings.download_dir);

    let (queue_tx, mut queue_rx) = mpsc::channel::<EnqueueRequest>(32);
    let mut server = BridgeServer::new(port, queue_tx);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::error!("enqueue bridge exited: {e}");
        }
    });

    // Render progress for everything the engine does while we listen.
    let mut events = reg.subscribe();
    let render_task = tokio::spawn(async move {
        let mut progress = TransferProgress::new();
        loop {
            match events.recv().await {
                Ok(event) => progress.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    println!(
        "{} Listening on http://127.0.0.1:{} (ctrl-c to stop)",
        style("●").green(),
        port
    );

    loop {
        tokio::select! {
            request = queue_rx.recv() => match request {
                Some(request) => {
                    if let Err(e) = service_enqueue(reg, &request, &download_dir).await {
                        eprintln!("{} {}: {}", style("✗").red(), request.url, e);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server_task.abort();
    render_task.abort();
    reg.flush().await?;
    Ok(())
}

async fn service_enqueue(
    reg: &DownloadRegistry,
    request: &EnqueueRequest,
    download_dir: &Path,
) -> Result<()> {
    let meta = reg.fetch_metadata(&request.url).await?;
    let destination = download_dir.join(full_file_name(&meta.file_name, &meta.file_extension));

    let id = short_id();
    reg.start(&id, &request.url, destination, false).await?;
    println!(
        "{} Queued {} from {} (id {})",
        style("+").cyan().bold(),
        meta.file_name,
        request.source,
        id
    );
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn resolve_destination(
    reg: &DownloadRegistry,
    url: &str,
    output: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = output {
        return Ok(path);
    }
    let meta = reg.fetch_metadata(url).await?;
    let settings = reg.settings().await;
    Ok(settings
        .download_dir
        .join(full_file_name(&meta.file_name, &meta.file_extension)))
}

fn full_file_name(name: &str, extension: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{name}{extension}")
    }
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
