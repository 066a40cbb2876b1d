//! Transfer queue: owns every task, starts workers in FIFO order and applies
//! user commands.
//!
//! The queue lives in a single Tokio task. [`TransferScheduler`] handles talk
//! to it over a channel, workers report back over another, and every change is
//! published as a fresh list of [`TaskSnapshot`]s on a `watch` channel. Nothing
//! outside the queue task ever touches task state, so there are no locks.

use async_stream::stream;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, TransferError};
use crate::protocol::{FileInfo, RemoteTransferProtocol};
use crate::sanitize::validate_relative_path;
use crate::source::{ContentSource, FileSource};
use crate::state::TransferState;
use crate::task::{
    Strategy, TaskId, TaskSnapshot, TaskStatus, TransferRequest, TransferTask,
};
use crate::worker::{RunOutcome, TransferWorker, WorkItem, WorkerEvent};

enum Command {
    Enqueue {
        requests: Vec<TransferRequest>,
        reply: oneshot::Sender<Result<Vec<TaskId>>>,
    },
    Pause {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        id: TaskId,
        action: &'static str,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },
    Export {
        reply: oneshot::Sender<TransferState>,
    },
}

// --- HANDLE ---

/// Cheap, cloneable handle to the transfer queue.
///
/// Dropping the last handle stops the queue and cancels running workers.
#[derive(Clone)]
pub struct TransferScheduler {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Vec<TaskSnapshot>>,
}

impl TransferScheduler {
    /// Spawns the queue on the current Tokio runtime.
    pub fn new(protocol: Arc<dyn RemoteTransferProtocol>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());

        let queue = Queue {
            tasks: Vec::new(),
            running: HashMap::new(),
            protocol,
            config: Arc::new(config),
            events: event_tx,
            snapshots: snapshot_tx,
        };
        tokio::spawn(queue.run(command_rx, event_rx));

        Ok(Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| TransferError::SchedulerClosed)?;
        rx.await.map_err(|_| TransferError::SchedulerClosed)
    }

    /// Appends one task per request, in order. Nothing is queued if any
    /// request has an invalid relative path.
    pub async fn enqueue(
        &self,
        requests: impl IntoIterator<Item = TransferRequest>,
    ) -> Result<Vec<TaskId>> {
        let requests = requests.into_iter().collect();
        self.request(|reply| Command::Enqueue { requests, reply }).await?
    }

    /// Signals an Active task to stop. It turns Paused once its worker exits.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Pause { id, reply }).await?
    }

    /// Moves a Paused or Failed task to the back of the queue. Chunked tasks
    /// continue after their last confirmed part.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Resume {
            id,
            action: "resume",
            reply,
        })
        .await?
    }

    /// Same as [`resume`](Self::resume); reads better for a Failed task.
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Resume {
            id,
            action: "retry",
            reply,
        })
        .await?
    }

    /// Re-queues a Paused or Failed task from byte zero with a new remote session.
    pub async fn restart(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Restart { id, reply }).await?
    }

    /// Removes a task in any state, stopping its worker if needed.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Drops every Completed task and returns how many went.
    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(|reply| Command::ClearCompleted { reply }).await
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.snapshots.borrow().iter().find(|t| t.id == id).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TaskSnapshot>> {
        self.snapshots.clone()
    }

    /// The current list, then one list per change. Intermediate states may be
    /// skipped if the consumer is slow.
    pub fn updates(&self) -> impl Stream<Item = Vec<TaskSnapshot>> + Send + 'static {
        let mut rx = self.snapshots.clone();
        stream! {
            let current = rx.borrow_and_update().clone();
            yield current;
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().clone();
                yield next;
            }
        }
    }

    /// Waits until no task is Pending or Active.
    pub async fn wait_idle(&self) -> Result<Vec<TaskSnapshot>> {
        let mut rx = self.snapshots.clone();
        let idle = rx
            .wait_for(|tasks| tasks.iter().all(|t| !t.status.is_busy()))
            .await
            .map_err(|_| TransferError::SchedulerClosed)?
            .clone();
        Ok(idle)
    }

    /// Captures every file-backed task for a later [`restore`](Self::restore).
    pub async fn export_state(&self) -> Result<TransferState> {
        self.request(|reply| Command::Export { reply }).await
    }

    /// Re-queues the unfinished tasks of a saved state.
    ///
    /// Files that can no longer be opened are skipped. A file whose size
    /// changed starts over with a new remote session.
    pub async fn restore(&self, state: TransferState) -> Result<Vec<TaskId>> {
        let mut requests = Vec::new();
        for task in state.tasks {
            if task.status == TaskStatus::Completed {
                continue;
            }
            let source = match FileSource::open(&task.local_path).await {
                Ok(source) => source,
                Err(e) => {
                    warn!("Skipping {}: {e}", task.local_path.display());
                    continue;
                }
            };
            let session = match task.session {
                Some(session)
                    if source.len() == task.total_bytes
                        && session.plan.total_bytes == source.len() =>
                {
                    Some(session)
                }
                Some(_) => {
                    warn!(
                        "{} changed since it was queued, starting over",
                        task.local_path.display()
                    );
                    None
                }
                None => None,
            };
            requests.push(
                TransferRequest::new(Arc::new(source), task.relative_path, task.destination)
                    .with_session(session),
            );
        }
        self.enqueue(requests).await
    }
}

// --- QUEUE ---

struct Queue {
    tasks: Vec<TransferTask>,
    running: HashMap<TaskId, CancellationToken>,
    protocol: Arc<dyn RemoteTransferProtocol>,
    config: Arc<EngineConfig>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    snapshots: watch::Sender<Vec<TaskSnapshot>>,
}

fn invalid_state(task: &TransferTask, action: &'static str) -> TransferError {
    TransferError::InvalidState {
        id: task.id,
        action,
        status: task.status.as_str(),
    }
}

impl Queue {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.handle_event(event);
                    self.settle();
                }
            }
        }

        for token in self.running.values() {
            token.cancel();
        }
        debug!("Transfer queue stopped with {} tasks", self.tasks.len());
    }

    /// Starts whatever fits, then publishes.
    fn settle(&mut self) {
        self.advance();
        let snapshot = self.tasks.iter().map(TransferTask::snapshot).collect();
        self.snapshots.send_replace(snapshot);
    }

    fn handle_command(&mut self, command: Command) {
        // Replies go out after publishing so callers observe their own change.
        match command {
            Command::Enqueue { requests, reply } => {
                let result = self.enqueue(requests);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Pause { id, reply } => {
                let result = self.pause(id);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Resume { id, action, reply } => {
                let result = self.requeue(id, action, TransferTask::requeue);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Restart { id, reply } => {
                let result = self.requeue(id, "restart", TransferTask::reset);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(id);
                self.settle();
                let _ = reply.send(result);
            }
            Command::ClearCompleted { reply } => {
                let before = self.tasks.len();
                self.tasks.retain(|t| t.status != TaskStatus::Completed);
                let removed = before - self.tasks.len();
                if removed > 0 {
                    debug!("Cleared {removed} completed tasks");
                }
                self.settle();
                let _ = reply.send(removed);
            }
            Command::Export { reply } => {
                let _ = reply.send(TransferState::from_tasks(&self.tasks));
            }
        }
    }

    fn position(&self, id: TaskId) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or(TransferError::TaskNotFound(id))
    }

    fn enqueue(&mut self, requests: Vec<TransferRequest>) -> Result<Vec<TaskId>> {
        for request in &requests {
            validate_relative_path(&request.relative_path)?;
        }

        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let task = TransferTask::from_request(request, self.config.direct_threshold);
            info!(
                task_id = %task.id,
                "Queued {} ({} bytes, {:?}) for {}",
                task.relative_path, task.total_bytes, task.strategy, task.destination
            );
            ids.push(task.id);
            self.tasks.push(task);
        }
        Ok(ids)
    }

    fn pause(&mut self, id: TaskId) -> Result<()> {
        let task = &self.tasks[self.position(id)?];
        if task.status != TaskStatus::Active {
            return Err(invalid_state(task, "pause"));
        }
        if let Some(token) = self.running.get(&id) {
            debug!(task_id = %id, "Pausing {}", task.relative_path);
            token.cancel();
        }
        Ok(())
    }

    fn requeue(&mut self, id: TaskId, action: &'static str, reset: fn(&mut TransferTask)) -> Result<()> {
        let index = self.position(id)?;
        if !self.tasks[index].status.can_resume() {
            return Err(invalid_state(&self.tasks[index], action));
        }
        let mut task = self.tasks.remove(index);
        reset(&mut task);
        info!(task_id = %id, "Re-queued {} ({action})", task.relative_path);
        self.tasks.push(task);
        Ok(())
    }

    fn cancel(&mut self, id: TaskId) -> Result<()> {
        let task = self.tasks.remove(self.position(id)?);
        // The slot stays taken until the worker reports back.
        if let Some(token) = self.running.get(&id) {
            token.cancel();
        }
        info!(task_id = %id, "Cancelled {}", task.relative_path);
        Ok(())
    }

    fn active_mut(&mut self, id: TaskId) -> Option<&mut TransferTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id && t.status == TaskStatus::Active)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress {
                id,
                bytes_transferred,
                sample,
            } => {
                if let Some(task) = self.active_mut(id) {
                    task.bytes_transferred = bytes_transferred.min(task.total_bytes);
                    task.progress = sample;
                }
            }
            WorkerEvent::Session {
                id,
                session,
                sample,
            } => {
                if let Some(task) = self.active_mut(id) {
                    task.bytes_transferred = session.bytes_completed();
                    task.session = Some(session);
                    task.progress = sample;
                }
            }
            WorkerEvent::Finished { id, outcome } => {
                self.running.remove(&id);
                let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
                    debug!(task_id = %id, "Worker for removed task exited");
                    return;
                };
                task.progress = Default::default();
                match outcome {
                    RunOutcome::Completed => {
                        task.status = TaskStatus::Completed;
                        task.bytes_transferred = task.total_bytes;
                    }
                    RunOutcome::Paused => task.status = TaskStatus::Paused,
                    RunOutcome::Failed(message) => {
                        task.status = TaskStatus::Failed;
                        task.error = Some(message);
                    }
                }
                // A half-sent single request is lost.
                if task.strategy == Strategy::Direct && task.status != TaskStatus::Completed {
                    task.bytes_transferred = 0;
                }
            }
        }
    }

    /// Starts the earliest Pending tasks while slots are free.
    fn advance(&mut self) {
        while self.running.len() < self.config.max_concurrent_tasks {
            let Some(task) = self
                .tasks
                .iter_mut()
                .find(|t| t.status == TaskStatus::Pending)
            else {
                break;
            };

            task.status = TaskStatus::Active;
            task.error = None;
            let item = WorkItem {
                id: task.id,
                content: task.content.clone(),
                file: FileInfo {
                    name: task.display_name.clone(),
                    relative_path: task.relative_path.clone(),
                    destination: task.destination.clone(),
                    total_bytes: task.total_bytes,
                },
                strategy: task.strategy,
                session: task.session.clone(),
            };

            let cancel = CancellationToken::new();
            self.running.insert(item.id, cancel.clone());
            let worker = TransferWorker::new(
                self.protocol.clone(),
                self.config.clone(),
                self.events.clone(),
                cancel,
            );
            tokio::spawn(worker.run(item));
        }
    }
}
