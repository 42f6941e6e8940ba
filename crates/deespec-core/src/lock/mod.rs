//! C2: Lock manager.
//!
//! Acquires run-locks (whole-process exclusivity) and state-locks
//! (per-task), renews them on a background heartbeat task per held lock,
//! and runs a single sweeper that reclaims locks whose heartbeat has gone
//! stale -- covering the case where the holder process died without
//! releasing cleanly.
//!
//! Both read and write state-locks are currently treated as fully
//! exclusive; see the design notes for why shared-read semantics were left
//! unresolved rather than guessed at.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use deespec_store::models::LockType;
use deespec_store::LockRepository;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} is already held")]
    AlreadyHeld(String),

    #[error(transparent)]
    Store(#[from] deespec_store::error::StoreError),
}

pub type LockResult<T> = Result<T, LockError>;

const DEFAULT_TTL_SECS: i64 = 30;
const HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(10);
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(15);

/// A held lock's guard. Dropping it cancels its heartbeat task, but does
/// not itself release the row -- call [`LockGuard::release`] to do that
/// explicitly (an unclean drop is recovered by the sweeper once the
/// heartbeat goes stale).
pub struct LockGuard {
    lock_id: String,
    pid: i64,
    repo: Arc<dyn LockRepository>,
    heartbeat_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl LockGuard {
    pub async fn release(mut self) -> LockResult<bool> {
        self.cancel.cancel();
        if let Some(handle) = self.heartbeat_task.take() {
            let _ = handle.await;
        }
        Ok(self.repo.release(&self.lock_id, self.pid).await?)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Coordinates lock acquisition, per-lock heartbeats, and expired-lock
/// reclamation.
pub struct LockManager {
    repo: Arc<dyn LockRepository>,
    pid: i64,
    hostname: String,
}

impl LockManager {
    pub fn new(repo: Arc<dyn LockRepository>) -> Self {
        Self {
            repo,
            pid: std::process::id() as i64,
            hostname: hostname_or_unknown(),
        }
    }

    /// Acquire the whole-process run-lock. Call once at startup; held for
    /// the manager's entire lifetime.
    pub async fn acquire_run_lock(&self) -> LockResult<LockGuard> {
        self.acquire("run", None).await
    }

    /// Acquire a per-task state-lock.
    pub async fn acquire_state_lock(&self, task_id: &str, lock_type: LockType) -> LockResult<LockGuard> {
        self.acquire(&format!("task/{task_id}"), Some(lock_type)).await
    }

    async fn acquire(&self, lock_id: &str, lock_type: Option<LockType>) -> LockResult<LockGuard> {
        let ttl = ChronoDuration::seconds(DEFAULT_TTL_SECS);
        let acquired = self
            .repo
            .try_acquire(lock_id, lock_type, self.pid, &self.hostname, ttl)
            .await?;

        if !acquired {
            return Err(LockError::AlreadyHeld(lock_id.to_owned()));
        }

        let cancel = CancellationToken::new();
        let heartbeat_task = spawn_heartbeat(
            self.repo.clone(),
            lock_id.to_owned(),
            self.pid,
            cancel.clone(),
        );

        Ok(LockGuard {
            lock_id: lock_id.to_owned(),
            pid: self.pid,
            repo: self.repo.clone(),
            heartbeat_task: Some(heartbeat_task),
            cancel,
        })
    }

    /// Spawn the background sweeper that reclaims locks whose heartbeat has
    /// gone stale. Runs until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let repo = self.repo.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_once(&repo).await {
                            warn!(error = %err, "lock sweep failed");
                        }
                    }
                }
            }
        })
    }
}

async fn sweep_once(repo: &Arc<dyn LockRepository>) -> LockResult<()> {
    let now = chrono::Utc::now();
    let max_staleness = ChronoDuration::seconds(DEFAULT_TTL_SECS * 3);

    for (lock_id, record) in repo.list_all().await? {
        if record.is_expired(now) || record.is_heartbeat_stale(now, max_staleness) {
            debug!(lock_id = %lock_id, "reclaiming expired lock");
            repo.force_release(&lock_id).await?;
        }
    }

    Ok(())
}

fn spawn_heartbeat(
    repo: Arc<dyn LockRepository>,
    lock_id: String,
    pid: i64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ttl = ChronoDuration::seconds(DEFAULT_TTL_SECS);
                    match repo.heartbeat(&lock_id, pid, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(lock_id = %lock_id, "heartbeat found lock no longer held by us");
                            break;
                        }
                        Err(err) => warn!(lock_id = %lock_id, error = %err, "heartbeat failed"),
                    }
                }
            }
        }
    })
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned())
}
