//! SQLite-backed [`TaskRepository`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::{StoreError, StoreResult};
use crate::models::{Task, TaskId, TaskKind, TaskMetadata, TaskStatus};
use crate::repo::TaskRepository;

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Task> {
    let kind_str: String = row.try_get("kind")?;
    let status_str: String = row.try_get("status")?;
    let step_str: String = row.try_get("step")?;
    let labels_json: String = row.try_get("labels_json")?;
    let execution_json: Option<String> = row.try_get("execution_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        kind: kind_str.parse::<TaskKind>()?,
        parent_id: parent_id.map(TaskId),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        labels: serde_json::from_str(&labels_json)?,
        assigned_agent: row.try_get("assigned_agent")?,
        status: status_str.parse::<TaskStatus>()?,
        step: step_str.parse::<crate::models::Step>()?,
        execution: execution_json
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        metadata: serde_json::from_str::<TaskMetadata>(&metadata_json)?,
    })
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: Task) -> StoreResult<()> {
        let labels_json = serde_json::to_string(&task.labels)?;
        let execution_json = task
            .execution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata_json = serde_json::to_string(&task.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, kind, parent_id, title, description, labels_json,
                 assigned_agent, status, step, execution_json, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.0)
        .bind(task.kind.to_string())
        .bind(task.parent_id.map(|p| p.0))
        .bind(task.title)
        .bind(task.description)
        .bind(labels_json)
        .bind(task.assigned_agent)
        .bind(task.status.to_string())
        .bind(task.step.to_string())
        .bind(execution_json)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn put(&self, task: Task) -> StoreResult<()> {
        let labels_json = serde_json::to_string(&task.labels)?;
        let execution_json = task
            .execution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata_json = serde_json::to_string(&task.metadata)?;

        sqlx::query(
            r#"
            UPDATE tasks SET
                kind = ?, parent_id = ?, title = ?, description = ?,
                labels_json = ?, assigned_agent = ?, status = ?, step = ?,
                execution_json = ?, metadata_json = ?
            WHERE id = ?
            "#,
        )
        .bind(task.kind.to_string())
        .bind(task.parent_id.map(|p| p.0))
        .bind(task.title)
        .bind(task.description)
        .bind(labels_json)
        .bind(task.assigned_agent)
        .bind(task.status.to_string())
        .bind(task.step.to_string())
        .bind(execution_json)
        .bind(metadata_json)
        .bind(task.id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_status(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, metadata_json FROM tasks WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };

        let status_str: String = row.try_get("status")?;
        if status_str.parse::<TaskStatus>()? != from {
            return Ok(false);
        }

        let metadata_json: String = row.try_get("metadata_json")?;
        let mut metadata: TaskMetadata = serde_json::from_str(&metadata_json)?;
        if to == TaskStatus::Picked && metadata.started_at.is_none() {
            metadata.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            metadata.completed_at = Some(Utc::now());
        }
        let metadata_json = serde_json::to_string(&metadata)?;

        let result = sqlx::query("UPDATE tasks SET status = ?, metadata_json = ? WHERE id = ? AND status = ?")
            .bind(to.to_string())
            .bind(metadata_json)
            .bind(&id.0)
            .bind(from.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_ready(&self) -> StoreResult<Vec<Task>> {
        let all = self.list_all().await?;
        let done: std::collections::HashSet<TaskId> = all
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.clone())
            .collect();

        let mut ready: Vec<Task> = all
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.metadata.dependencies.iter().all(|d| done.contains(d)))
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
        let rows = sqlx::query("SELECT * FROM tasks").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn reset_orphaned(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending' WHERE status IN ('picked', 'implementing', 'reviewing')",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
