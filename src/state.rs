//! Queue persistence, so an interrupted session can be resumed later.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::task::{ChunkSession, TaskStatus, TransferTask};

pub const STATE_VERSION: u32 = 1;

/// One task as written to disk. Only file-backed tasks are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub local_path: PathBuf,
    pub relative_path: String,
    pub destination: String,
    pub total_bytes: u64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<ChunkSession>,
}

impl PersistedTask {
    pub(crate) fn from_task(task: &TransferTask) -> Option<Self> {
        let local_path = task.content.local_path()?.to_path_buf();
        // A run that was in flight is resumable, not running.
        let status = match task.status {
            TaskStatus::Active => TaskStatus::Paused,
            other => other,
        };
        Some(Self {
            local_path,
            relative_path: task.relative_path.clone(),
            destination: task.destination.clone(),
            total_bytes: task.total_bytes,
            status,
            error: task.error.clone(),
            session: task.session.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub version: u32,
    pub tasks: Vec<PersistedTask>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tasks: Vec::new(),
        }
    }
}

impl TransferState {
    pub(crate) fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TransferTask>) -> Self {
        Self {
            version: STATE_VERSION,
            tasks: tasks.into_iter().filter_map(PersistedTask::from_task).collect(),
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let state: Self = serde_json::from_str(&raw)?;
        debug!("Loaded {} tasks from {}", state.tasks.len(), path.as_ref().display());
        Ok(state)
    }

    /// Writes through a sibling temp file so a crash never leaves half a state.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved {} tasks to {}", self.tasks.len(), path.display());
        Ok(())
    }

    /// Tasks a restore would put back in the queue.
    pub fn unfinished(&self) -> impl Iterator<Item = &PersistedTask> {
        self.tasks.iter().filter(|t| t.status != TaskStatus::Completed)
    }

    pub fn is_finished(&self) -> bool {
        self.unfinished().next().is_none()
    }
}
