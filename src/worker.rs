//! Drives one task through the remote protocol until it completes, fails or
//! is cancelled.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorKind, Result, TransferError};
use crate::progress::{ProgressSample, ProgressTracker};
use crate::protocol::{
    CompleteTransferRequest, CompletedPart, FileInfo, InitTransferRequest, PartTarget,
    ProgressFn, RemoteTransferProtocol,
};
use crate::source::ContentHandle;
use crate::task::{ChunkPlan, ChunkSession, Strategy, TaskId};

/// Everything a run needs, copied out of the task when it starts.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub id: TaskId,
    pub content: ContentHandle,
    pub file: FileInfo,
    pub strategy: Strategy,
    pub session: Option<ChunkSession>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunOutcome {
    Completed,
    Paused,
    Failed(String),
}

/// Reports from a running worker to the scheduler, in the order they happen.
/// `Finished` is always the last one.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Progress {
        id: TaskId,
        bytes_transferred: u64,
        sample: ProgressSample,
    },
    Session {
        id: TaskId,
        session: ChunkSession,
        sample: ProgressSample,
    },
    Finished {
        id: TaskId,
        outcome: RunOutcome,
    },
}

/// Runs `fut` unless `token` fires first.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if token.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TransferError::Cancelled),
        res = fut => res,
    }
}

pub(crate) struct TransferWorker {
    protocol: Arc<dyn RemoteTransferProtocol>,
    config: Arc<EngineConfig>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl TransferWorker {
    pub fn new(
        protocol: Arc<dyn RemoteTransferProtocol>,
        config: Arc<EngineConfig>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            config,
            events,
            cancel,
        }
    }

    pub async fn run(self, item: WorkItem) {
        let id = item.id;
        let name = item.file.relative_path.clone();
        debug!(
            task_id = %id,
            "Starting {:?} transfer of {name} ({} bytes)",
            item.strategy,
            item.file.total_bytes
        );

        let result = match item.strategy {
            Strategy::Direct => self.run_direct(item).await,
            Strategy::Chunked => self.run_chunked(item).await,
        };

        let outcome = match result {
            Ok(()) => {
                info!(task_id = %id, "Uploaded {name}");
                RunOutcome::Completed
            }
            Err(e) if e.kind() == ErrorKind::UserCancelled => {
                info!(task_id = %id, "Paused {name}");
                RunOutcome::Paused
            }
            Err(e) => {
                warn!(task_id = %id, "Upload of {name} failed: {e}");
                RunOutcome::Failed(e.to_string())
            }
        };
        // The scheduler may already be gone during shutdown.
        let _ = self.events.send(WorkerEvent::Finished { id, outcome });
    }

    // --- DIRECT ---

    async fn run_direct(&self, item: WorkItem) -> Result<()> {
        let total = item.file.total_bytes;
        let tracker = ProgressTracker::start(total, 0);
        let events = self.events.clone();
        let id = item.id;
        let progress: ProgressFn = Arc::new(move |sent| {
            let sent = sent.min(total);
            let _ = events.send(WorkerEvent::Progress {
                id,
                bytes_transferred: sent,
                sample: tracker.sample(sent),
            });
        });

        cancellable(&self.cancel, async {
            self.protocol
                .direct_upload(&item.file, item.content.clone(), progress)
                .await
                .map_err(TransferError::from)
        })
        .await
    }

    // --- CHUNKED ---

    async fn run_chunked(&self, item: WorkItem) -> Result<()> {
        let mut session = match item.session.clone() {
            Some(session) => {
                debug!(
                    task_id = %item.id,
                    "Resuming {} at part {}/{}",
                    item.file.relative_path,
                    session.next_part(),
                    session.plan.total_parts
                );
                session
            }
            None => self.open_session(&item).await?,
        };

        let tracker = ProgressTracker::start(item.file.total_bytes, session.bytes_completed());

        for part in session.next_part()..=session.plan.total_parts {
            let target = cancellable(&self.cancel, async {
                self.protocol
                    .part_target(&session.transfer_id, &session.storage_key, part)
                    .await
                    .map_err(TransferError::from)
            })
            .await?;

            let range = session.plan.part_range(part);
            let data = cancellable(&self.cancel, async {
                item.content
                    .read_range(range.start, range.end - range.start)
                    .await
                    .map_err(TransferError::from)
            })
            .await?;

            let token = self.upload_with_retry(item.id, &target, data).await?;
            session.record_part(part, token);
            debug!(
                task_id = %item.id,
                part,
                "Part {part}/{} of {} done",
                session.plan.total_parts,
                item.file.relative_path
            );

            let _ = self.events.send(WorkerEvent::Session {
                id: item.id,
                sample: tracker.sample(session.bytes_completed()),
                session: session.clone(),
            });
        }

        if !session.is_complete() {
            return Err(TransferError::InvalidPlan(format!(
                "{} tokens recorded for {} parts",
                session.completion_tokens.len(),
                session.plan.total_parts
            )));
        }

        let request = CompleteTransferRequest {
            file: item.file.clone(),
            transfer_id: session.transfer_id.clone(),
            storage_key: session.storage_key.clone(),
            parts: CompletedPart::from_tokens(&session.completion_tokens),
        };
        cancellable(&self.cancel, async {
            self.protocol
                .complete_transfer(&request)
                .await
                .map_err(TransferError::from)
        })
        .await
    }

    async fn open_session(&self, item: &WorkItem) -> Result<ChunkSession> {
        let request = InitTransferRequest {
            file: item.file.clone(),
            chunk_size_hint: self.config.chunk_size_hint,
        };
        let response = cancellable(&self.cancel, async {
            self.protocol
                .init_transfer(&request)
                .await
                .map_err(TransferError::from)
        })
        .await?;

        let plan = ChunkPlan::from_remote(
            item.file.total_bytes,
            response.chunk_size,
            response.total_parts,
        )?;
        debug!(
            task_id = %item.id,
            "Opened transfer {} for {}: {} parts of {} bytes",
            response.transfer_id, item.file.relative_path, plan.total_parts, plan.chunk_size
        );

        let session = ChunkSession::new(response.transfer_id, response.storage_key, plan);
        let _ = self.events.send(WorkerEvent::Session {
            id: item.id,
            session: session.clone(),
            sample: ProgressSample::default(),
        });
        Ok(session)
    }

    /// Sends one part, retrying transient failures with a fixed delay.
    async fn upload_with_retry(
        &self,
        id: TaskId,
        target: &PartTarget,
        data: Bytes,
    ) -> Result<String> {
        let max_attempts = self.config.max_part_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = cancellable(&self.cancel, async {
                self.protocol
                    .upload_part(target, data.clone())
                    .await
                    .map_err(TransferError::from)
            })
            .await;

            match result {
                Ok(token) => return Ok(token),
                Err(TransferError::Protocol(e)) if e.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(TransferError::RetriesExhausted {
                            part: target.part_number,
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!(
                        task_id = %id,
                        part = target.part_number,
                        attempt,
                        "Part upload failed: {e}; retrying in {:?}",
                        self.config.retry_delay
                    );
                    cancellable(&self.cancel, async {
                        tokio::time::sleep(self.config.retry_delay).await;
                        Ok(())
                    })
                    .await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
