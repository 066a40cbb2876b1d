use crate::task::TaskId;

// --- REMOTE SIDE ---

/// Failure reported by a [`RemoteTransferProtocol`](crate::RemoteTransferProtocol) call.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Whether a chunk upload failing with this error is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Network(e) => !e.is_builder() && !e.is_decode(),
            ProtocolError::Transport(_) => true,
            ProtocolError::Status { code, .. } => {
                *code == 408 || *code == 429 || (500..600).contains(code)
            }
            ProtocolError::Api(_) | ProtocolError::Malformed(_) => false,
        }
    }
}

// --- ENGINE SIDE ---

/// How an error is treated by the worker and surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cancellation signal fired; the task becomes `Paused`.
    UserCancelled,
    /// Retryable chunk upload failure.
    Transient,
    /// The task becomes `Failed`.
    Fatal,
    /// Local content could not be read; handled like `Fatal`.
    Resource,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Part {part} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        part: u32,
        attempts: u32,
        #[source]
        source: ProtocolError,
    },

    #[error("IO error: {0}")]
    Resource(#[from] std::io::Error),

    #[error("Invalid transfer plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {id} cannot {action} while {status}")]
    InvalidState {
        id: TaskId,
        action: &'static str,
        status: &'static str,
    },

    #[error("Scheduler is no longer running")]
    SchedulerClosed,

    #[error("State file error: {0}")]
    State(#[from] serde_json::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Cancelled => ErrorKind::UserCancelled,
            TransferError::Protocol(e) if e.is_transient() => ErrorKind::Transient,
            TransferError::Resource(_) => ErrorKind::Resource,
            _ => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
