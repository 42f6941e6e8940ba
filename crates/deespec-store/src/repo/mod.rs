//! Repository trait seams.
//!
//! The concrete persistence backend is deliberately pluggable: callers only
//! ever depend on these traits. [`sqlite`] provides one production-grade
//! implementation; [`memory`] provides an in-process implementation used in
//! tests and small single-shot runs.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{FeedbackDraft, LockRecord, LockType, Task, TaskId, TaskStatus};

/// Storage and lifecycle queries for tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a brand-new task. Fails if `id` already exists.
    async fn create(&self, task: Task) -> StoreResult<()>;

    /// Fetch a task by id.
    async fn get(&self, id: &TaskId) -> StoreResult<Option<Task>>;

    /// Replace the stored task wholesale. Used after in-memory mutation by
    /// the decision engine; callers are responsible for concurrency control
    /// via [`Self::transition_status`] where contention is possible.
    async fn put(&self, task: Task) -> StoreResult<()>;

    /// Atomically move a task from `from` to `to` via a `WHERE status =
    /// from` compare-and-swap. Returns `false` without error if the task
    /// was no longer in `from` when the statement ran.
    async fn transition_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> StoreResult<bool>;

    /// List every task whose immediate dependencies (as tracked in
    /// `metadata.dependencies`) are all in `Done`, and whose own status is
    /// `Pending`, ordered by `(priority desc, sequence asc)`.
    async fn list_ready(&self) -> StoreResult<Vec<Task>>;

    /// List every task, for diagnostics and cycle detection.
    async fn list_all(&self) -> StoreResult<Vec<Task>>;

    /// Reset any task left in a non-terminal, in-flight status (`Picked`,
    /// `Implementing`, `Reviewing`) back to `Pending`. Used at startup to
    /// recover from an unclean shutdown.
    async fn reset_orphaned(&self) -> StoreResult<u64>;
}

/// Mutual-exclusion leases: both whole-repository run locks and per-task
/// state locks share this interface.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Attempt to acquire a run-lock (`lock_type: None`) or state-lock
    /// (`lock_type: Some`). Returns `false` without side effects if the lock
    /// is already held and unexpired.
    async fn try_acquire(
        &self,
        lock_id: &str,
        lock_type: Option<LockType>,
        pid: i64,
        hostname: &str,
        ttl: chrono::Duration,
    ) -> StoreResult<bool>;

    /// Renew an already-held lock's heartbeat and expiry. Returns `false` if
    /// the lock is not held by `pid`.
    async fn heartbeat(
        &self,
        lock_id: &str,
        pid: i64,
        ttl: chrono::Duration,
    ) -> StoreResult<bool>;

    /// Release a lock held by `pid`. Returns `false` if not held by `pid`.
    async fn release(&self, lock_id: &str, pid: i64) -> StoreResult<bool>;

    /// Fetch a lock's current record, if held.
    async fn get(&self, lock_id: &str) -> StoreResult<Option<LockRecord>>;

    /// List every currently-held lock, expired or not, for the sweeper.
    async fn list_all(&self) -> StoreResult<Vec<(String, LockRecord)>>;

    /// Forcibly delete a lock row regardless of holder. Used by the sweeper
    /// to reclaim expired locks.
    async fn force_release(&self, lock_id: &str) -> StoreResult<bool>;
}

/// Free-text review notes and incomplete-instruction feedback, keyed by
/// task.
#[async_trait]
pub trait NotesRepository: Send + Sync {
    /// Append a pre-rendered markdown note section for a task's turn (see
    /// the per-turn note format in the workspace's external interfaces).
    async fn append_note(&self, task_id: &TaskId, rendered: String) -> StoreResult<()>;

    /// Fetch the full accumulated notes markdown for a task, if any notes
    /// have been appended.
    async fn get_notes(&self, task_id: &TaskId) -> StoreResult<Option<String>>;

    /// Append a feedback draft for a task.
    async fn append_feedback(&self, draft: FeedbackDraft) -> StoreResult<()>;

    /// List every feedback draft recorded for a task, oldest first.
    async fn list_feedback(&self, task_id: &TaskId) -> StoreResult<Vec<FeedbackDraft>>;
}
