//! Test fixtures shared across the workspace's integration tests: a
//! tempfile-backed SQLite database and builders for common task shapes.

use std::collections::HashSet;

use deespec_store::models::{ExecutionState, Step, Task, TaskId, TaskKind, TaskMetadata, TaskStatus};
use deespec_store::repo::sqlite;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A temporary SQLite database, kept alive for the duration of a test via
/// the held [`TempDir`] (dropping it deletes the backing file).
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let path = dir.path().join("deespec-test.sqlite3");
        let pool = sqlite::open(&path).await.expect("open sqlite db");
        Self { pool, _dir: dir }
    }
}

/// Builder for a minimal, valid [`Task`], defaulting to a leaf SBI with no
/// dependencies and a fresh execution budget.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn sbi(id: &str) -> Self {
        Self {
            task: Task {
                id: TaskId::from(id),
                kind: TaskKind::Sbi,
                parent_id: None,
                title: format!("task {id}"),
                description: String::new(),
                labels: HashSet::new(),
                assigned_agent: None,
                status: TaskStatus::Pending,
                step: Step::Pick,
                execution: Some(ExecutionState::default()),
                metadata: TaskMetadata::default(),
            },
        }
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.task.metadata.dependencies.insert(TaskId::from(id));
        self
    }

    pub fn with_file_path(mut self, path: &str) -> Self {
        self.task.metadata.file_paths.push(path.to_owned());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.metadata.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.task.assigned_agent = Some(agent.to_owned());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
