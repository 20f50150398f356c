//! downdraft CLI - resumable download engine front end
//!
//! Probe URLs, run downloads in the foreground (ctrl-c pauses instead of
//! losing progress), inspect tracked downloads, and run the loopback
//! enqueue bridge for companion processes.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use downdraft_core::DownloadRegistry;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// downdraft - resumable HTTP(S) downloads
#[derive(Parser)]
#[command(name = "downdraft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for downdraft state
    #[arg(long, env = "DOWNDRAFT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a URL for filename, size and resumability
    Probe {
        /// URL to probe
        url: String,
    },

    /// Download a URL in the foreground
    Get {
        /// URL to download
        url: String,

        /// Destination file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Download id; generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Resume the download with this id from where it stopped
        #[arg(short, long, requires = "id")]
        resume: bool,
    },

    /// List tracked downloads
    List,

    /// Show one download
    Status {
        /// Download id
        id: String,
    },

    /// Cancel a download and delete its partial file
    Cancel {
        /// Download id
        id: String,
    },

    /// Remove one finished download from the registry, or all of them
    Clear {
        /// Download id; clears every terminal record when omitted
        id: Option<String>,
    },

    /// Run the loopback enqueue bridge and service incoming URLs
    Listen {
        /// Port to bind on 127.0.0.1
        #[arg(long)]
        port: Option<u16>,

        /// Directory downloads are saved into
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let registry = DownloadRegistry::new(data_dir).await?;

    let format = cli.output;
    match cli.command {
        Commands::Probe { url } => commands::probe(&registry, &url, format).await,
        Commands::Get {
            url,
            output,
            id,
            resume,
        } => commands::get(&registry, &url, output, id, resume).await,
        Commands::List => commands::list(&registry, format).await,
        Commands::Status { id } => commands::status(&registry, &id, format).await,
        Commands::Cancel { id } => commands::cancel(&registry, &id).await,
        Commands::Clear { id } => commands::clear(&registry, id.as_deref()).await,
        Commands::Listen { port, dir } => commands::listen(&registry, port, dir).await,
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("downdraft")
}
