use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use uuid::Uuid;

use crate::collector::CollectedFile;
use crate::error::{Result, TransferError};
use crate::progress::ProgressSample;
use crate::source::ContentHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Paused and Failed tasks may go back to Pending.
    pub fn can_resume(&self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Failed)
    }

    /// Pending or Active: the scheduler still owes this task a run.
    pub fn is_busy(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Active)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    Chunked,
}

impl Strategy {
    pub fn select(total_bytes: u64, direct_threshold: u64) -> Self {
        if total_bytes <= direct_threshold {
            Strategy::Direct
        } else {
            Strategy::Chunked
        }
    }
}

// --- CHUNK MATH ---

/// Split of a file into equally sized parts; the last one takes the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub total_parts: u32,
}

impl ChunkPlan {
    pub fn new(total_bytes: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidPlan("chunk size is zero".into()));
        }
        let total_parts = u32::try_from(total_bytes.div_ceil(chunk_size)).map_err(|_| {
            TransferError::InvalidPlan(format!(
                "{total_bytes} bytes in {chunk_size}-byte parts exceeds the part limit"
            ))
        })?;
        Ok(Self {
            total_bytes,
            chunk_size,
            total_parts,
        })
    }

    /// Checks a plan announced by the remote against local arithmetic.
    pub fn from_remote(total_bytes: u64, chunk_size: u64, total_parts: u32) -> Result<Self> {
        let plan = Self::new(total_bytes, chunk_size)?;
        if plan.total_parts != total_parts {
            return Err(TransferError::InvalidPlan(format!(
                "remote announced {total_parts} parts, {total_bytes} bytes at {chunk_size} per part needs {}",
                plan.total_parts
            )));
        }
        Ok(plan)
    }

    /// Byte range of a 1-based part number.
    pub fn part_range(&self, part: u32) -> Range<u64> {
        let start = u64::from(part.saturating_sub(1)) * self.chunk_size;
        let end = (u64::from(part) * self.chunk_size).min(self.total_bytes);
        start.min(end)..end
    }

    pub fn part_len(&self, part: u32) -> u64 {
        let range = self.part_range(part);
        range.end - range.start
    }

    /// Bytes covered by parts `1..=parts`.
    pub fn bytes_through(&self, parts: u32) -> u64 {
        (u64::from(parts) * self.chunk_size).min(self.total_bytes)
    }
}

/// Remote multi-part session plus what has been confirmed so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSession {
    pub transfer_id: String,
    pub storage_key: String,
    pub plan: ChunkPlan,
    /// Last fully uploaded part; 0 before the first one.
    pub current_part: u32,
    /// One token per completed part, in part order.
    pub completion_tokens: Vec<String>,
}

impl ChunkSession {
    pub fn new(transfer_id: String, storage_key: String, plan: ChunkPlan) -> Self {
        Self {
            transfer_id,
            storage_key,
            plan,
            current_part: 0,
            completion_tokens: Vec::new(),
        }
    }

    pub fn next_part(&self) -> u32 {
        self.current_part + 1
    }

    pub fn record_part(&mut self, part: u32, token: String) {
        debug_assert_eq!(part, self.next_part(), "parts must complete in order");
        self.completion_tokens.push(token);
        self.current_part = part;
    }

    pub fn bytes_completed(&self) -> u64 {
        self.plan.bytes_through(self.current_part)
    }

    pub fn is_complete(&self) -> bool {
        self.current_part == self.plan.total_parts
            && self.completion_tokens.len() == self.plan.total_parts as usize
    }
}

// --- REQUESTS ---

/// What the caller hands to `enqueue`.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub content: ContentHandle,
    pub relative_path: String,
    /// Remote folder, e.g. from [`build_folder_name`](crate::build_folder_name).
    pub destination: String,
    pub(crate) session: Option<ChunkSession>,
}

impl TransferRequest {
    pub fn new(
        content: ContentHandle,
        relative_path: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            content,
            relative_path: relative_path.into(),
            destination: destination.into(),
            session: None,
        }
    }

    pub fn from_collected(file: CollectedFile, destination: impl Into<String>) -> Self {
        Self::new(file.content, file.relative_path, destination)
    }

    pub(crate) fn with_session(mut self, session: Option<ChunkSession>) -> Self {
        self.session = session;
        self
    }
}

// --- TASK ---

/// Scheduler-owned state of one file transfer.
#[derive(Debug, Clone)]
pub(crate) struct TransferTask {
    pub id: TaskId,
    pub content: ContentHandle,
    pub display_name: String,
    pub relative_path: String,
    pub destination: String,
    pub total_bytes: u64,
    pub status: TaskStatus,
    pub bytes_transferred: u64,
    pub strategy: Strategy,
    pub session: Option<ChunkSession>,
    pub error: Option<String>,
    pub progress: ProgressSample,
}

impl TransferTask {
    pub fn from_request(request: TransferRequest, direct_threshold: u64) -> Self {
        let total_bytes = request.content.len();
        let strategy = Strategy::select(total_bytes, direct_threshold);
        let session = request
            .session
            .filter(|s| strategy == Strategy::Chunked && s.plan.total_bytes == total_bytes);
        let display_name = request
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&request.relative_path)
            .to_string();

        Self {
            id: TaskId::new(),
            bytes_transferred: session.as_ref().map_or(0, ChunkSession::bytes_completed),
            content: request.content,
            display_name,
            relative_path: request.relative_path,
            destination: request.destination,
            total_bytes,
            status: TaskStatus::Pending,
            strategy,
            session,
            error: None,
            progress: ProgressSample::default(),
        }
    }

    /// Back to Pending for resume/retry. Chunked progress is kept; a direct
    /// upload has nothing to resume from.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.progress = ProgressSample::default();
        if self.strategy == Strategy::Direct {
            self.bytes_transferred = 0;
        }
    }

    /// Back to Pending with the remote session dropped.
    pub fn reset(&mut self) {
        self.requeue();
        self.session = None;
        self.bytes_transferred = 0;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let session = self.session.as_ref();
        TaskSnapshot {
            id: self.id,
            display_name: self.display_name.clone(),
            relative_path: self.relative_path.clone(),
            destination: self.destination.clone(),
            total_bytes: self.total_bytes,
            status: self.status,
            bytes_transferred: self.bytes_transferred,
            strategy: self.strategy,
            chunk_size: session.map(|s| s.plan.chunk_size),
            total_parts: session.map(|s| s.plan.total_parts),
            current_part: session.map_or(0, |s| s.current_part),
            completion_tokens: session.map(|s| s.completion_tokens.clone()).unwrap_or_default(),
            transfer_id: session.map(|s| s.transfer_id.clone()),
            storage_key: session.map(|s| s.storage_key.clone()),
            error: self.error.clone(),
            speed: self.progress.speed,
            eta: self.progress.eta,
        }
    }
}

/// Read-only view of a task for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub display_name: String,
    pub relative_path: String,
    pub destination: String,
    pub total_bytes: u64,
    pub status: TaskStatus,
    pub bytes_transferred: u64,
    pub strategy: Strategy,
    pub chunk_size: Option<u64>,
    pub total_parts: Option<u32>,
    pub current_part: u32,
    pub completion_tokens: Vec<String>,
    pub transfer_id: Option<String>,
    pub storage_key: Option<String>,
    pub error: Option<String>,
    /// Bytes per second, averaged over the current run.
    pub speed: f64,
    pub eta: Option<Duration>,
}

impl TaskSnapshot {
    /// Fraction in `0.0..=1.0`; an empty file counts as done once completed.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == TaskStatus::Completed { 1.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}
