//! # DeskDrive Upload CLI
//!
//! Command-line front end for the resumable upload engine.
//!
//! Files at or below the direct threshold are sent in one request; larger
//! ones are uploaded part by part. Pressing Ctrl-C pauses the queue and writes
//! a state file, and `resume` continues after the last confirmed part.
//!
//! ## Usage
//!
//! ```bash
//! # Upload files and folders into the folder of client G1 / "Acme Corp"
//! deskdrive-cli -s https://files.example.com/api upload ./reports big.iso --code G1 --name "Acme Corp"
//!
//! # Upload into an explicit destination folder
//! deskdrive-cli upload ./photos --dest G1_Acme
//!
//! # Continue an interrupted upload
//! deskdrive-cli resume .deskdrive-state.json
//!
//! # Print the folder identifier for a code and name
//! deskdrive-cli folder-name G1 "Acme/Corp"
//! ```
//!
//! ## Configuration
//!
//! - `DESKDRIVE_SERVER`, `DESKDRIVE_TOKEN`, `DESKDRIVE_ACCELERATE` back the
//!   `--server`, `--token` and `--accelerate` flags.
//! - `--config engine.json` overrides engine tunables (thresholds, retries).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use deskdrive_upload::{
    build_folder_name, collect_selection, DroppedEntry, EngineConfig, HttpConfig,
    HttpTransferClient, TaskSnapshot, TaskStatus, TransferRequest, TransferScheduler,
    TransferState,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Exit Codes
// =============================================================================

const EXIT_SUCCESS: u8 = 0;
const EXIT_ERROR: u8 = 1;

const DEFAULT_STATE_FILE: &str = ".deskdrive-state.json";

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "deskdrive-cli")]
#[command(author, version, about = "DeskDrive upload CLI - resumable chunked uploads")]
struct Cli {
    /// Enable verbose logging (can also use RUST_LOG env var)
    #[arg(short, long)]
    verbose: bool,

    /// API base URL
    #[arg(short, long, env = "DESKDRIVE_SERVER")]
    server: Option<String>,

    /// Bearer token for the API
    #[arg(short, long, env = "DESKDRIVE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URL that replaces the host of every part upload URL
    #[arg(long, env = "DESKDRIVE_ACCELERATE")]
    accelerate: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of files uploaded at the same time
    #[arg(short, long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files or folders
    Upload {
        /// Files or directories to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Remote destination folder
        #[arg(short, long, conflicts_with_all = ["code", "name"])]
        dest: Option<String>,

        /// Client code; combined with --name into the destination folder
        #[arg(long)]
        code: Option<String>,

        /// Client name; combined with --code into the destination folder
        #[arg(long)]
        name: Option<String>,

        /// Where to save progress if the upload is interrupted
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },

    /// Resume an interrupted upload
    Resume {
        /// Path to the state file written by an interrupted upload
        state_file: PathBuf,
    },

    /// Print the destination folder name for a client code and name
    FolderName { code: String, name: String },
}

struct Connection {
    server: Option<String>,
    token: Option<String>,
    accelerate: Option<String>,
    config: Option<PathBuf>,
    workers: Option<usize>,
}

impl Connection {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config = config.with_max_concurrent_tasks(workers);
        }
        Ok(config)
    }

    fn scheduler(&self, config: EngineConfig) -> anyhow::Result<TransferScheduler> {
        let Some(server) = &self.server else {
            bail!("No server configured! Pass --server or set DESKDRIVE_SERVER");
        };
        let mut http = HttpConfig::new(server.clone());
        http.token = self.token.clone();
        http.acceleration_url = self.accelerate.clone();
        http.pool_max_idle_per_host = config.max_concurrent_tasks.max(1);

        let client = HttpTransferClient::new(http).context("Failed to build HTTP client")?;
        Ok(TransferScheduler::new(Arc::new(client), config)?)
    }
}

fn format_size(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

// =============================================================================
// Queue Driver
// =============================================================================

enum Finish {
    Idle(Vec<TaskSnapshot>),
    Interrupted,
}

/// Shows progress until the queue is idle or the user hits Ctrl-C.
async fn watch_queue(scheduler: &TransferScheduler) -> anyhow::Result<Finish> {
    let total: u64 = scheduler.snapshot().iter().map(|t| t.total_bytes).sum();
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )?
        .progress_chars("=> "),
    );

    let updates = scheduler.updates();
    tokio::pin!(updates);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let finish = loop {
        tokio::select! {
            update = updates.next() => {
                let Some(tasks) = update else {
                    bail!("Transfer queue stopped unexpectedly");
                };
                bar.set_position(tasks.iter().map(|t| t.bytes_transferred).sum());
                if let Some(active) = tasks.iter().find(|t| t.status == TaskStatus::Active) {
                    bar.set_message(active.display_name.clone());
                }
                if tasks.iter().all(|t| !t.status.is_busy()) {
                    break Finish::Idle(tasks);
                }
            }
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                break Finish::Interrupted;
            }
        }
    };

    bar.finish_and_clear();
    Ok(finish)
}

/// Runs the queue to the end and keeps the state file in sync with what is left.
async fn drive(scheduler: TransferScheduler, state_file: &Path) -> anyhow::Result<()> {
    let finish = watch_queue(&scheduler).await?;
    let state = scheduler.export_state().await?;
    // Dropping the last handle stops any worker still running.
    drop(scheduler);

    let tasks = match finish {
        Finish::Interrupted => {
            state
                .save_to_file(state_file)
                .with_context(|| format!("Could not save state to {}", state_file.display()))?;
            println!("\n⏸ Paused. Continue with: deskdrive-cli resume {}", state_file.display());
            return Ok(());
        }
        Finish::Idle(tasks) => tasks,
    };

    let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed: Vec<_> = tasks.iter().filter(|t| t.status == TaskStatus::Failed).collect();

    for task in &failed {
        eprintln!(
            "✗ Failed {}: {}",
            task.relative_path,
            task.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("\n✓ Upload complete: {completed} uploaded, {} failed", failed.len());

    if state.is_finished() {
        if state_file.exists() {
            if let Err(e) = std::fs::remove_file(state_file) {
                warn!("Could not remove {}: {}", state_file.display(), e);
            }
        }
    } else if let Err(e) = state.save_to_file(state_file) {
        eprintln!("Warning: Could not save transfer state: {e}");
    } else {
        println!("Note: run `deskdrive-cli resume {}` to retry.", state_file.display());
    }

    if !failed.is_empty() {
        bail!("{} file(s) failed to upload", failed.len());
    }
    Ok(())
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("deskdrive_upload=debug,deskdrive_cli=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("deskdrive_upload=warn,deskdrive_cli=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let connection = Connection {
        server: cli.server,
        token: cli.token,
        accelerate: cli.accelerate,
        config: cli.config,
        workers: cli.workers,
    };

    match cli.command {
        Commands::Upload {
            paths,
            dest,
            code,
            name,
            state_file,
        } => {
            let destination = dest.unwrap_or_else(|| {
                build_folder_name(code.as_deref().unwrap_or(""), name.as_deref().unwrap_or(""))
            });
            if destination.is_empty() {
                bail!("A destination is required: --dest, or --code and/or --name");
            }

            let config = connection.engine_config()?;
            let batch_size = config.directory_batch_size;

            let mut entries = Vec::new();
            for path in &paths {
                match DroppedEntry::from_path(path, batch_size) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => eprintln!("✗ Not found: {}: {e}", path.display()),
                }
            }

            let mut requests = Vec::new();
            for file in collect_selection(entries) {
                match file {
                    Ok(file) => {
                        debug!("Collected {} ({} bytes)", file.relative_path, file.size);
                        requests.push(TransferRequest::from_collected(file, destination.clone()));
                    }
                    Err(e) => eprintln!("✗ Skipped folder {e}"),
                }
            }

            if requests.is_empty() {
                bail!("No files to upload");
            }

            let total: u64 = requests.iter().map(|r| r.content.len()).sum();
            println!(
                "\n📤 Uploading {} files ({}) to {destination}...\n",
                requests.len(),
                format_size(total)
            );

            let scheduler = connection.scheduler(config)?;
            scheduler.enqueue(requests).await?;
            drive(scheduler, &state_file).await?;
        }

        Commands::Resume { state_file } => {
            let state = TransferState::load_from_file(&state_file)
                .with_context(|| format!("Failed to load transfer state {}", state_file.display()))?;

            let pending = state.unfinished().count();
            println!("\n🔄 Resuming upload...");
            println!("   Completed: {}/{} files", state.tasks.len() - pending, state.tasks.len());
            println!("   Remaining: {pending} files");
            println!();

            if state.is_finished() {
                println!("✓ Upload already complete!");
                return Ok(());
            }

            let scheduler = connection.scheduler(connection.engine_config()?)?;
            let ids = scheduler.restore(state).await?;
            if ids.is_empty() {
                bail!("None of the remaining files could be opened");
            }
            drive(scheduler, &state_file).await?;
        }

        Commands::FolderName { code, name } => {
            println!("{}", build_folder_name(&code, &name));
        }
    }

    Ok(())
}
