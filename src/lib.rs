//! Resumable upload engine for desktop file drops.
//!
//! Dropped files and folders are flattened by [`collect_selection`], turned
//! into [`TransferRequest`]s and queued on a [`TransferScheduler`]. Small files
//! go out in one request; large ones are split into parts that are uploaded
//! one at a time, so a paused or failed transfer continues after the last
//! confirmed part. The remote side is any [`RemoteTransferProtocol`];
//! [`HttpTransferClient`] is the bundled `reqwest` implementation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use deskdrive_upload::{
//!     build_folder_name, collect_selection, DroppedEntry, EngineConfig, HttpConfig,
//!     HttpTransferClient, TransferRequest, TransferScheduler,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpTransferClient::new(HttpConfig::new("https://files.example.com/api"))?;
//! let scheduler = TransferScheduler::new(Arc::new(client), EngineConfig::default())?;
//!
//! let destination = build_folder_name("G1", "Acme Corp");
//! let entry = DroppedEntry::from_path("./reports", 100)?;
//! let requests = collect_selection(vec![entry])
//!     .filter_map(Result::ok)
//!     .map(|file| TransferRequest::from_collected(file, destination.clone()));
//!
//! scheduler.enqueue(requests).await?;
//! scheduler.wait_idle().await?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod http;
pub mod progress;
pub mod protocol;
pub mod sanitize;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod task;
mod worker;

pub use collector::{
    collect_selection, CollectedFile, DirectoryReader, DroppedEntry, FsDirectoryReader,
};
pub use config::EngineConfig;
pub use error::{ErrorKind, ProtocolError, Result, TransferError};
pub use http::{HttpConfig, HttpTransferClient};
pub use progress::{ProgressSample, ProgressTracker};
pub use protocol::{
    CompleteTransferRequest, CompletedPart, FileInfo, InitTransferRequest, InitTransferResponse,
    PartTarget, ProgressFn, RemoteTransferProtocol,
};
pub use sanitize::{build_folder_name, sanitize};
pub use scheduler::TransferScheduler;
pub use source::{ContentHandle, ContentSource, FileSource, MemorySource};
pub use state::{PersistedTask, TransferState};
pub use task::{
    ChunkPlan, ChunkSession, Strategy, TaskId, TaskSnapshot, TaskStatus, TransferRequest,
};
