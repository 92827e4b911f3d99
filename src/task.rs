//! Task lifecycle: state machine, attempt history, and the handles the
//! orchestrator uses to observe and steer an in-flight task.
//!
//! Status changes flow through a `tokio::sync::watch` channel so callers
//! can await terminal states without polling. Transitions are validated
//! against a single table; an invalid transition is refused, never applied.

use crate::{InferenceResponse, OrchestratorError, StreamChunk};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Accepted, not yet planned.
    Queued,
    /// Candidate models being selected.
    Planning,
    /// Bound to a (model, runtime), call about to start.
    Dispatched,
    /// Backend call in flight, no output yet.
    Running,
    /// First output chunk has been emitted. From here the task can only
    /// complete, fail, or be cancelled.
    Streaming,
    /// Being moved to another runtime before any output was produced.
    Migrating,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by caller request or deadline.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Migrating => "migrating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match from {
        Queued => matches!(to, Planning | Cancelled),
        Planning => matches!(to, Dispatched | Failed | Cancelled),
        Dispatched => matches!(to, Running | Planning | Migrating | Failed | Cancelled),
        Running => matches!(to, Streaming | Planning | Migrating | Completed | Failed | Cancelled),
        // Once output reached the caller there is no retry and no migration.
        Streaming => matches!(to, Completed | Failed | Cancelled),
        Migrating => matches!(to, Dispatched | Planning | Failed | Cancelled),
        Completed | Failed | Cancelled => false,
    }
}

/// How one dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt produced the task's result.
    Completed,
    /// The attempt failed with the given reason.
    Failed(String),
    /// The attempt was interrupted by a migration request.
    Migrated,
}

/// One (model, runtime) dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Model the attempt used.
    pub model: String,
    /// Runtime the attempt ran on.
    pub runtime: String,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: Uuid,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Model currently bound, if any.
    pub model: Option<String>,
    /// Runtime currently bound, if any.
    pub runtime: Option<String>,
    /// Every dispatch attempt so far, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Failure reason for failed or cancelled tasks.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct TaskInner {
    model: Option<String>,
    runtime: Option<String>,
    attempts: Vec<AttemptRecord>,
    output: Option<InferenceResponse>,
    error: Option<String>,
}

/// Migration request parameters.
#[derive(Debug, Clone)]
pub(crate) struct MigrateRequest {
    /// Explicit destination model; `None` keeps the current model.
    pub(crate) target_model: Option<String>,
    /// Explicit destination runtime; `None` re-plans the placement.
    pub(crate) target_runtime: Option<String>,
}

/// Shared per-task state between the orchestrator's driver task and the
/// public API surface.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub(crate) id: Uuid,
    status_tx: watch::Sender<TaskStatus>,
    inner: Mutex<TaskInner>,
    first_output: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    // watch channels rather than Notify: a signal raised before the driver
    // starts waiting must still be observed.
    cancel_tx: watch::Sender<bool>,
    migrate_pending: Mutex<Option<MigrateRequest>>,
    migrate_tx: watch::Sender<u64>,
    chunks_rx: Mutex<Option<mpsc::Receiver<Result<StreamChunk, OrchestratorError>>>>,
    pub(crate) created_at: Instant,
}

impl TaskEntry {
    pub(crate) fn new() -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Queued);
        let (cancel_tx, _) = watch::channel(false);
        let (migrate_tx, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4(),
            status_tx,
            inner: Mutex::new(TaskInner::default()),
            first_output: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            cancel_tx,
            migrate_pending: Mutex::new(None),
            migrate_tx,
            chunks_rx: Mutex::new(None),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.status_tx.borrow()
    }

    /// Apply a state transition. Invalid transitions (including any move
    /// out of a terminal state) are refused and logged.
    pub(crate) fn set_status(&self, to: TaskStatus) -> bool {
        let mut applied = false;
        self.status_tx.send_if_modified(|current| {
            if transition_allowed(*current, to) {
                *current = to;
                applied = true;
                true
            } else {
                false
            }
        });
        if !applied {
            warn!(task = %self.id, from = %self.status(), to = %to, "refused task transition");
        }
        applied
    }

    /// Subscribe to status changes.
    pub(crate) fn watch_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Record that the first output chunk reached the caller. Monotonic.
    pub(crate) fn mark_first_output(&self) {
        self.first_output.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_output_started(&self) -> bool {
        self.first_output.load(Ordering::SeqCst)
    }

    pub(crate) fn set_binding(&self, model: &str, runtime: &str) {
        let mut inner = self.inner.lock();
        inner.model = Some(model.to_string());
        inner.runtime = Some(runtime.to_string());
    }

    pub(crate) fn clear_binding(&self) {
        let mut inner = self.inner.lock();
        inner.model = None;
        inner.runtime = None;
    }

    pub(crate) fn push_attempt(&self, attempt: AttemptRecord) {
        self.inner.lock().attempts.push(attempt);
    }

    pub(crate) fn attempts(&self) -> Vec<AttemptRecord> {
        self.inner.lock().attempts.clone()
    }

    pub(crate) fn attempt_count(&self) -> usize {
        self.inner.lock().attempts.len()
    }

    pub(crate) fn set_output(&self, output: InferenceResponse) {
        self.inner.lock().output = Some(output);
    }

    pub(crate) fn output(&self) -> Option<InferenceResponse> {
        self.inner.lock().output.clone()
    }

    pub(crate) fn set_error(&self, error: &str) {
        self.inner.lock().error = Some(error.to_string());
    }

    /// First cancel request wins and returns `true`; later requests are
    /// no-ops.
    pub(crate) fn request_cancel(&self, reason: &str) -> bool {
        // The reason lock serialises racing cancels; the flag flips while
        // it is held so exactly one caller wins.
        let mut slot = self.cancel_reason.lock();
        if self.cancel_requested() {
            return false;
        }
        *slot = Some(reason.to_string());
        self.cancel_tx.send_replace(true);
        true
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Receiver that observes the cancel flag, including a flip that
    /// happened before subscription.
    pub(crate) fn watch_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().clone()
    }

    pub(crate) fn request_migrate(
        &self,
        target_model: Option<String>,
        target_runtime: Option<String>,
    ) {
        *self.migrate_pending.lock() = Some(MigrateRequest {
            target_model,
            target_runtime,
        });
        self.migrate_tx.send_modify(|seq| *seq += 1);
    }

    /// Receiver over the migrate request sequence number.
    pub(crate) fn watch_migrate(&self) -> watch::Receiver<u64> {
        self.migrate_tx.subscribe()
    }

    pub(crate) fn take_migrate_request(&self) -> Option<MigrateRequest> {
        self.migrate_pending.lock().take()
    }

    pub(crate) fn install_chunks(
        &self,
        rx: mpsc::Receiver<Result<StreamChunk, OrchestratorError>>,
    ) {
        *self.chunks_rx.lock() = Some(rx);
    }

    /// Take the chunk receiver. Only the first caller gets the stream.
    pub(crate) fn take_chunks(
        &self,
    ) -> Option<mpsc::Receiver<Result<StreamChunk, OrchestratorError>>> {
        self.chunks_rx.lock().take()
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        let inner = self.inner.lock();
        TaskSnapshot {
            id: self.id,
            status: self.status(),
            model: inner.model.clone(),
            runtime: inner.runtime.clone(),
            attempts: inner.attempts.clone(),
            error: inner.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let entry = TaskEntry::new();
        for status in [
            TaskStatus::Planning,
            TaskStatus::Dispatched,
            TaskStatus::Running,
            TaskStatus::Streaming,
            TaskStatus::Completed,
        ] {
            assert!(entry.set_status(status), "transition to {status} refused");
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let entry = TaskEntry::new();
        entry.set_status(TaskStatus::Cancelled);
        assert!(!entry.set_status(TaskStatus::Planning));
        assert!(!entry.set_status(TaskStatus::Completed));
        assert_eq!(entry.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_no_migration_after_streaming() {
        assert!(!transition_allowed(
            TaskStatus::Streaming,
            TaskStatus::Migrating
        ));
        assert!(!transition_allowed(
            TaskStatus::Streaming,
            TaskStatus::Planning
        ));
        assert!(transition_allowed(
            TaskStatus::Running,
            TaskStatus::Migrating
        ));
    }

    #[test]
    fn test_retry_loops_back_through_planning() {
        assert!(transition_allowed(TaskStatus::Running, TaskStatus::Planning));
        assert!(transition_allowed(
            TaskStatus::Dispatched,
            TaskStatus::Planning
        ));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let entry = TaskEntry::new();
        assert!(entry.request_cancel("caller request"));
        assert!(!entry.request_cancel("second caller"));
        assert_eq!(entry.cancel_reason().as_deref(), Some("caller request"));
    }

    #[test]
    fn test_first_output_is_monotonic() {
        let entry = TaskEntry::new();
        assert!(!entry.has_output_started());
        entry.mark_first_output();
        entry.mark_first_output();
        assert!(entry.has_output_started());
    }

    #[test]
    fn test_chunks_taken_once() {
        let entry = TaskEntry::new();
        let (_tx, rx) = mpsc::channel(1);
        entry.install_chunks(rx);
        assert!(entry.take_chunks().is_some());
        assert!(entry.take_chunks().is_none());
    }

    #[tokio::test]
    async fn test_watch_observes_terminal_state() {
        let entry = std::sync::Arc::new(TaskEntry::new());
        let mut rx = entry.watch_status();
        let waiter = tokio::spawn(async move {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return *rx.borrow();
                }
                if rx.changed().await.is_err() {
                    return TaskStatus::Failed;
                }
            }
        });
        entry.set_status(TaskStatus::Planning);
        entry.set_status(TaskStatus::Failed);
        assert_eq!(waiter.await.expect("test: join"), TaskStatus::Failed);
    }

    #[test]
    fn test_snapshot_carries_attempts() {
        let entry = TaskEntry::new();
        entry.set_binding("mistral", "ollama-0");
        entry.push_attempt(AttemptRecord {
            model: "mistral".into(),
            runtime: "ollama-0".into(),
            outcome: AttemptOutcome::Failed("timeout".into()),
        });
        let snap = entry.snapshot();
        assert_eq!(snap.model.as_deref(), Some("mistral"));
        assert_eq!(snap.attempts.len(), 1);
    }
}
