//! Workflow manager: the coordinator that ties C1-C6 together into one
//! run loop.
//!
//! Each iteration: pick ready, conflict-free tasks, dispatch each one
//! through the decision engine's synthetic pick/start advances (one
//! committed journal entry per advance), run a bounded batch of workers,
//! feed each worker's result back through the decision engine, apply the
//! resulting transition, and commit another state snapshot + journal
//! entry. Idle rounds (nothing ready, nothing running) back off
//! exponentially, capped at ten seconds, instead of busy-polling storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deespec_store::models::{Decision, JournalEntry, LockType, Task, TaskId, TaskStatus};
use deespec_store::{NotesRepository, TaskRepository};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commit;
use crate::decision;
use crate::lock::{LockGuard, LockManager};
use crate::notes::{self, NoteSection};
use crate::picker;
use crate::pool::{AgentExecutor, AgentPool, StepResult};
use crate::task::TaskStateMachine;

const MIN_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct WorkflowManager {
    tasks: TaskStateMachine,
    notes: Arc<dyn NotesRepository>,
    locks: Arc<LockManager>,
    pool: AgentPool,
    run_root: PathBuf,
}

impl WorkflowManager {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        notes: Arc<dyn NotesRepository>,
        locks: Arc<LockManager>,
        executor: Arc<dyn AgentExecutor>,
        max_concurrency: usize,
        run_root: PathBuf,
    ) -> Self {
        Self::with_agent_limits(repo, notes, locks, executor, max_concurrency, HashMap::new(), run_root)
    }

    /// As [`Self::new`], additionally configuring a per-agent concurrency
    /// cap on top of the pool-wide `max_concurrency` semaphore.
    pub fn with_agent_limits(
        repo: Arc<dyn TaskRepository>,
        notes: Arc<dyn NotesRepository>,
        locks: Arc<LockManager>,
        executor: Arc<dyn AgentExecutor>,
        max_concurrency: usize,
        agent_limits: HashMap<String, usize>,
        run_root: PathBuf,
    ) -> Self {
        Self {
            tasks: TaskStateMachine::new(repo),
            notes,
            locks,
            pool: AgentPool::with_agent_limits(executor, max_concurrency, agent_limits),
            run_root,
        }
    }

    /// Run until `cancel` fires, backing off when there is nothing to do.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let reset = self.tasks.reset_orphaned().await?;
        if reset > 0 {
            info!(count = reset, "reclaimed orphaned in-flight tasks at startup");
        }

        let mut backoff = MIN_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let did_work = self.run_once(&cancel).await?;

            if did_work {
                backoff = MIN_BACKOFF;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    /// One scheduling round. Returns `true` if any task was advanced.
    pub async fn run_once(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let all = self.tasks.list_all().await?;
        let ready = self.tasks.list_ready().await?;

        let cycle = picker::detect_cycle(&all);
        if !cycle.is_empty() {
            warn!(cycle = ?cycle, "dependency cycle detected; affected tasks will never become ready");
        }

        let picked = picker::pick(&all, ready);

        for task in &picked.ready {
            for draft in picker::detect_incomplete(task, &all, &picked.blocked_by_cycle) {
                self.notes.append_feedback(draft).await?;
            }
        }

        // A task that just finished implementing sits in `Reviewing` and
        // needs its own worker turn for the review step; it never shows up
        // in `list_ready` (which only surfaces dependency-satisfied
        // `Pending` tasks), so it is folded into this round's candidates
        // here instead.
        let reviewing: Vec<Task> = all
            .iter()
            .filter(|t| t.status == TaskStatus::Reviewing)
            .cloned()
            .collect();

        let mut candidates = picked.ready;
        candidates.extend(reviewing);

        let (batch, deferred) = AgentPool::conflict_free_batch(candidates);

        if !deferred.is_empty() {
            info!(count = deferred.len(), "deferred conflicting tasks to a later round");
        }

        if batch.is_empty() {
            return Ok(false);
        }

        // Locking discipline: agent-pool slot, then state-lock. (The
        // conflict-detector's register/unregister happens inside
        // `spawn_batch`, around each worker's actual execution window.)
        let mut guards: HashMap<_, LockGuard> = HashMap::new();
        let mut acquired_agents: HashMap<_, String> = HashMap::new();
        let mut locked_batch = Vec::with_capacity(batch.len());
        for task in batch {
            if let Some(agent) = &task.assigned_agent {
                if !self.pool.agent_capacity().try_acquire(agent).await {
                    info!(task_id = %task.id, agent, "agent at capacity; deferring task");
                    continue;
                }
                acquired_agents.insert(task.id.clone(), agent.clone());
            }

            match self.locks.acquire_state_lock(&task.id.to_string(), LockType::Write).await {
                Ok(guard) => {
                    guards.insert(task.id.clone(), guard);
                    locked_batch.push(task);
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "could not acquire state lock; deferring task");
                    if let Some(agent) = acquired_agents.remove(&task.id) {
                        self.pool.agent_capacity().release(&agent).await;
                    }
                }
            }
        }

        if locked_batch.is_empty() {
            return Ok(false);
        }

        let mut dispatched_batch = Vec::with_capacity(locked_batch.len());
        for task in locked_batch {
            if task.status == TaskStatus::Pending {
                let task = self.advance_without_execution(&task.id).await?; // Pending -> Picked
                let task = self.advance_without_execution(&task.id).await?; // Picked -> Implementing
                dispatched_batch.push(task);
            } else {
                dispatched_batch.push(task);
            }
        }

        let mut rx = self.pool.spawn_batch(dispatched_batch, cancel.clone());

        let mut advanced = false;
        while let Some(done) = rx.recv().await {
            let task_id = done.task_id.clone();
            self.handle_worker_result(done).await?;
            if let Some(guard) = guards.remove(&task_id) {
                if let Err(err) = guard.release().await {
                    warn!(task_id = %task_id, error = %err, "failed to release state lock");
                }
            }
            if let Some(agent) = acquired_agents.remove(&task_id) {
                self.pool.agent_capacity().release(&agent).await;
            }
            advanced = true;
        }

        Ok(advanced)
    }

    /// Feed one worker's result through the decision engine, apply the
    /// resulting [`decision::Action`], and commit a journal entry for it.
    ///
    /// Whether a worker just ran the implement step or the review step is
    /// told apart by the task's *pre-round* status, fetched fresh here: a
    /// task already `Reviewing` before dispatch ran its review step, so
    /// its outcome is folded into a [`Decision`] and routed through
    /// [`decision::decide_after_review`] instead of the plain
    /// [`decision::decide`] cascade.
    async fn handle_worker_result(&self, done: crate::pool::WorkerDone) -> anyhow::Result<()> {
        let task = self.tasks.get(&done.task_id).await?;

        let action = if task.status == TaskStatus::Reviewing {
            let review_decision = match &done.result {
                StepResult::Completed { .. } => Decision::Succeeded,
                StepResult::NeedsChanges { .. } => Decision::NeedsChanges,
                StepResult::Errored { .. } => Decision::Failed,
            };
            decision::decide_after_review(&task, review_decision)
        } else {
            decision::decide(&task, Some(&done.result))
        };

        if action.next_status == Some(TaskStatus::Failed) {
            warn!(task_id = %task.id, reason_tag = action.reason_tag, "task failed terminally");
        }

        let task = self.tasks.apply_action(&task.id, &action).await?;
        self.append_note(&task, &done.result).await?;
        self.commit_round(&task, &done.result).await
    }

    /// Apply one `decide(task, None)` step for a task that has not yet had
    /// an agent turn -- the synthetic PENDING->PICKED or PICKED->IMPLEMENTING
    /// advances -- and commit a journal entry for it, same as any other
    /// advance. These carry `skip_step_execution` and no `StepResult`, so
    /// the journal entry records a `PENDING` decision with no error.
    async fn advance_without_execution(&self, id: &TaskId) -> anyhow::Result<Task> {
        let task = self.tasks.get(id).await?;
        let action = decision::decide(&task, None);
        let task = self.tasks.apply_action(&task.id, &action).await?;
        self.commit_step(&task, Decision::Pending, String::new()).await?;
        Ok(task)
    }

    async fn append_note(&self, task: &Task, result: &StepResult) -> anyhow::Result<()> {
        let (decision, summary) = match result {
            StepResult::Completed { summary } => (Decision::Succeeded, Some(summary.as_str())),
            StepResult::NeedsChanges { detail } => (Decision::NeedsChanges, Some(detail.as_str())),
            StepResult::Errored { message } => (Decision::Failed, Some(message.as_str())),
        };

        let section = NoteSection {
            turn: task.execution.as_ref().map(|e| e.current_turn).unwrap_or(0),
            ts: chrono::Utc::now(),
            author: "deespec",
            step: task.step,
            decision,
            summary,
            body: summary.unwrap_or_default(),
        };

        self.notes.append_note(&task.id, notes::render(&section)).await?;
        Ok(())
    }

    async fn commit_round(&self, task: &Task, result: &StepResult) -> anyhow::Result<()> {
        let (error, decision) = match result {
            StepResult::Errored { message } => (message.clone(), Decision::Failed),
            StepResult::NeedsChanges { detail } => (detail.clone(), Decision::NeedsChanges),
            StepResult::Completed { .. } => (String::new(), Decision::Succeeded),
        };

        self.commit_step(task, decision, error).await
    }

    /// Bump the persisted state snapshot's version and append one journal
    /// entry for `task`'s current turn/step. Shared by every kind of
    /// advance -- worker-reported and synthetic pick/dispatch alike -- so
    /// each one leaves exactly one journal line and one version bump.
    async fn commit_step(&self, task: &Task, decision: Decision, error: String) -> anyhow::Result<()> {
        let state_path = commit::default_state_path(&self.run_root);
        let journal_path = commit::default_journal_path(&self.run_root);

        let current = commit::read_state(&state_path)?.unwrap_or_default();
        let mut next = current.clone();
        next.version += 1;
        next.meta.updated_at = chrono::Utc::now();

        commit::commit_state(&state_path, current.version, &next)?;

        let entry = JournalEntry {
            ts: chrono::Utc::now(),
            turn: task.execution.as_ref().map(|e| e.current_turn).unwrap_or(0),
            step: task.step,
            decision,
            elapsed_ms: 0,
            error,
            artifacts: Vec::new(),
        };

        commit::append_journal(&journal_path, &entry)?;
        Ok(())
    }
}
