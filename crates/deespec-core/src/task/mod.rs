//! C1: Task model and state machine.
//!
//! Wraps a [`TaskRepository`] and enforces the closed transition table from
//! [`TaskStatus::is_valid_transition`] before ever touching storage, so an
//! invalid transition never reaches the compare-and-swap layer.

use std::sync::Arc;

use deespec_store::error::StoreError;
use deespec_store::models::{Task, TaskId, TaskStatus};
use deespec_store::TaskRepository;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no such task: {0}")]
    NotFound(TaskId),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("transition for {id} lost a race: expected status {expected}")]
    Stale { id: TaskId, expected: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Thin wrapper around a [`TaskRepository`] that is the only legal path by
/// which a task's status changes.
pub struct TaskStateMachine {
    repo: Arc<dyn TaskRepository>,
}

impl TaskStateMachine {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    /// Validate the transition against the closed table, then apply it as a
    /// compare-and-swap against storage. Returns [`TaskError::Stale`] if
    /// another actor raced this one to the same task.
    pub async fn transition(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> TaskResult<Task> {
        if !TaskStatus::is_valid_transition(from, to) {
            return Err(TaskError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let applied = self.repo.transition_status(id, from, to).await?;
        if !applied {
            return Err(TaskError::Stale {
                id: id.clone(),
                expected: from,
            });
        }

        self.repo
            .get(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    pub async fn get(&self, id: &TaskId) -> TaskResult<Task> {
        self.repo.get(id).await?.ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    pub async fn list_ready(&self) -> TaskResult<Vec<Task>> {
        Ok(self.repo.list_ready().await?)
    }

    pub async fn list_all(&self) -> TaskResult<Vec<Task>> {
        Ok(self.repo.list_all().await?)
    }

    pub async fn reset_orphaned(&self) -> TaskResult<u64> {
        Ok(self.repo.reset_orphaned().await?)
    }

    /// Apply a [`crate::decision::Action`] as a whole: transition status if
    /// the action names one, then bump turn/attempt counters per its
    /// flags. `increment_turn` resets the attempt counter to 1, matching
    /// the turn/attempt monotonicity invariant.
    pub async fn apply_action(&self, id: &TaskId, action: &crate::decision::Action) -> TaskResult<Task> {
        let current = self.get(id).await?;

        let mut task = if let Some(next_status) = action.next_status {
            if next_status == current.status {
                current
            } else {
                self.transition(id, current.status, next_status).await?
            }
        } else {
            current
        };

        if let Some(next_step) = action.next_step {
            task.step = next_step;
        }

        if let Some(exec) = task.execution.as_mut() {
            if action.should_increment_turn {
                exec.current_turn += 1;
                exec.current_attempt = 1;
            }
            if action.should_increment_attempt {
                exec.current_attempt += 1;
            }
        }

        self.repo.put(task.clone()).await?;
        Ok(task)
    }
}

/// Semantic wrappers over [`TaskStateMachine::transition`], named for the
/// lifecycle event they represent. Mirrors the one-liner-per-transition
/// style used for picking up a task through finishing review.
pub mod dispatch {
    use super::*;

    pub async fn assign(sm: &TaskStateMachine, id: &TaskId) -> TaskResult<Task> {
        sm.transition(id, TaskStatus::Pending, TaskStatus::Picked).await
    }

    pub async fn start_implementing(sm: &TaskStateMachine, id: &TaskId) -> TaskResult<Task> {
        sm.transition(id, TaskStatus::Picked, TaskStatus::Implementing).await
    }

    pub async fn begin_review(sm: &TaskStateMachine, id: &TaskId) -> TaskResult<Task> {
        sm.transition(id, TaskStatus::Implementing, TaskStatus::Reviewing).await
    }

    pub async fn pass(sm: &TaskStateMachine, id: &TaskId) -> TaskResult<Task> {
        sm.transition(id, TaskStatus::Reviewing, TaskStatus::Done).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deespec_store::models::{Step, TaskKind, TaskMetadata};
    use deespec_store::repo::memory::InMemoryTaskRepository;

    fn sample(id: &str) -> Task {
        Task {
            id: TaskId::from(id),
            kind: TaskKind::Sbi,
            parent_id: None,
            title: "t".into(),
            description: String::new(),
            labels: Default::default(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            step: Step::Pick,
            execution: None,
            metadata: TaskMetadata::default(),
        }
    }

    async fn sm_with(task: Task) -> TaskStateMachine {
        let repo = Arc::new(InMemoryTaskRepository::new());
        repo.create(task).await.unwrap();
        TaskStateMachine::new(repo)
    }

    #[tokio::test]
    async fn rejects_transition_not_in_table() {
        let id = TaskId::from("t1");
        let sm = sm_with(sample("t1")).await;
        let err = sm.transition(&id, TaskStatus::Pending, TaskStatus::Done).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn applies_valid_transition() {
        let id = TaskId::from("t1");
        let sm = sm_with(sample("t1")).await;
        let task = dispatch::assign(&sm, &id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Picked);
    }

    #[tokio::test]
    async fn detects_stale_transition() {
        let id = TaskId::from("t1");
        let sm = sm_with(sample("t1")).await;
        dispatch::assign(&sm, &id).await.unwrap();
        let err = dispatch::assign(&sm, &id).await.unwrap_err();
        assert!(matches!(err, TaskError::Stale { .. }));
    }

    #[tokio::test]
    async fn full_happy_path() {
        let id = TaskId::from("t1");
        let sm = sm_with(sample("t1")).await;
        dispatch::assign(&sm, &id).await.unwrap();
        dispatch::start_implementing(&sm, &id).await.unwrap();
        dispatch::begin_review(&sm, &id).await.unwrap();
        let task = dispatch::pass(&sm, &id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }
}
