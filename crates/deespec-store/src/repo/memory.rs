//! In-process implementations of the repository traits, backed by
//! `tokio::sync::Mutex`-guarded collections.
//!
//! Useful for unit tests and for single-shot CLI invocations that don't need
//! durability across process restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::{FeedbackDraft, LockRecord, LockType, Task, TaskId, TaskStatus};
use crate::repo::{LockRepository, NotesRepository, TaskRepository};

/// In-memory [`TaskRepository`].
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: Task) -> StoreResult<()> {
        let mut guard = self.tasks.lock().await;
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        let guard = self.tasks.lock().await;
        Ok(guard.get(id).cloned())
    }

    async fn put(&self, task: Task) -> StoreResult<()> {
        let mut guard = self.tasks.lock().await;
        guard.insert(task.id.clone(), task);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> StoreResult<bool> {
        let mut guard = self.tasks.lock().await;
        let Some(task) = guard.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != from {
            return Ok(false);
        }
        task.status = to;
        if to == TaskStatus::Picked && task.metadata.started_at.is_none() {
            task.metadata.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            task.metadata.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn list_ready(&self) -> StoreResult<Vec<Task>> {
        let guard = self.tasks.lock().await;
        let mut ready: Vec<Task> = guard
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.metadata.dependencies.iter().all(|dep| {
                    guard
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Done)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.metadata
                .priority
                .cmp(&a.metadata.priority)
                .then(a.metadata.sequence.cmp(&b.metadata.sequence))
        });
        Ok(ready)
    }

    async fn list_all(&self) -> StoreResult<Vec<Task>> {
        let guard = self.tasks.lock().await;
        Ok(guard.values().cloned().collect())
    }

    async fn reset_orphaned(&self) -> StoreResult<u64> {
        let mut guard = self.tasks.lock().await;
        let mut count = 0;
        for task in guard.values_mut() {
            if matches!(
                task.status,
                TaskStatus::Picked | TaskStatus::Implementing | TaskStatus::Reviewing
            ) {
                task.status = TaskStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// In-memory [`LockRepository`].
#[derive(Default)]
pub struct InMemoryLockRepository {
    locks: Mutex<HashMap<String, (i64, LockRecord)>>,
}

impl InMemoryLockRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockRepository for InMemoryLockRepository {
    async fn try_acquire(
        &self,
        lock_id: &str,
        lock_type: Option<LockType>,
        pid: i64,
        hostname: &str,
        ttl: chrono::Duration,
    ) -> StoreResult<bool> {
        let mut guard = self.locks.lock().await;
        let now = Utc::now();
        if let Some((_, existing)) = guard.get(lock_id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        let record = LockRecord {
            lock_id: lock_id.to_owned(),
            pid,
            hostname: hostname.to_owned(),
            acquired_at: now,
            expires_at: now + ttl,
            heartbeat_at: now,
            metadata: HashMap::new(),
            lock_type,
        };
        guard.insert(lock_id.to_owned(), (pid, record));
        Ok(true)
    }

    async fn heartbeat(&self, lock_id: &str, pid: i64, ttl: chrono::Duration) -> StoreResult<bool> {
        let mut guard = self.locks.lock().await;
        match guard.get_mut(lock_id) {
            Some((holder, record)) if *holder == pid => {
                let now = Utc::now();
                record.heartbeat_at = now;
                record.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lock_id: &str, pid: i64) -> StoreResult<bool> {
        let mut guard = self.locks.lock().await;
        match guard.get(lock_id) {
            Some((holder, _)) if *holder == pid => {
                guard.remove(lock_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, lock_id: &str) -> StoreResult<Option<LockRecord>> {
        let guard = self.locks.lock().await;
        Ok(guard.get(lock_id).map(|(_, r)| r.clone()))
    }

    async fn list_all(&self) -> StoreResult<Vec<(String, LockRecord)>> {
        let guard = self.locks.lock().await;
        Ok(guard
            .iter()
            .map(|(id, (_, r))| (id.clone(), r.clone()))
            .collect())
    }

    async fn force_release(&self, lock_id: &str) -> StoreResult<bool> {
        let mut guard = self.locks.lock().await;
        Ok(guard.remove(lock_id).is_some())
    }
}

/// In-memory [`NotesRepository`].
#[derive(Default)]
pub struct InMemoryNotesRepository {
    drafts: Mutex<Vec<FeedbackDraft>>,
    notes: Mutex<HashMap<TaskId, String>>,
}

impl InMemoryNotesRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotesRepository for InMemoryNotesRepository {
    async fn append_note(&self, task_id: &TaskId, rendered: String) -> StoreResult<()> {
        let mut guard = self.notes.lock().await;
        guard.entry(task_id.clone()).or_default().push_str(&rendered);
        Ok(())
    }

    async fn get_notes(&self, task_id: &TaskId) -> StoreResult<Option<String>> {
        let guard = self.notes.lock().await;
        Ok(guard.get(task_id).cloned())
    }

    async fn append_feedback(&self, draft: FeedbackDraft) -> StoreResult<()> {
        let mut guard = self.drafts.lock().await;
        guard.push(draft);
        Ok(())
    }

    async fn list_feedback(&self, task_id: &TaskId) -> StoreResult<Vec<FeedbackDraft>> {
        let guard = self.drafts.lock().await;
        Ok(guard
            .iter()
            .filter(|d| &d.task_id == task_id)
            .cloned()
            .collect())
    }
}
