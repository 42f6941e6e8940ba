//! SQLite-backed [`NotesRepository`].

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::StoreResult;
use crate::models::{FeedbackDraft, TaskId};
use crate::repo::NotesRepository;

pub struct SqliteNotesRepository {
    pool: SqlitePool,
}

impl SqliteNotesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotesRepository for SqliteNotesRepository {
    async fn append_note(&self, task_id: &TaskId, rendered: String) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notes (task_id, body) VALUES (?, ?)
            ON CONFLICT(task_id) DO UPDATE SET body = body || excluded.body
            "#,
        )
        .bind(&task_id.0)
        .bind(rendered)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_notes(&self, task_id: &TaskId) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT body FROM notes WHERE task_id = ?")
            .bind(&task_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_get("body")).transpose().map_err(Into::into)
    }

    async fn append_feedback(&self, draft: FeedbackDraft) -> StoreResult<()> {
        sqlx::query("INSERT INTO feedback_drafts (task_id, reason, detail) VALUES (?, ?, ?)")
            .bind(draft.task_id.0)
            .bind(draft.reason)
            .bind(draft.detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_feedback(&self, task_id: &TaskId) -> StoreResult<Vec<FeedbackDraft>> {
        let rows = sqlx::query(
            "SELECT task_id, reason, detail FROM feedback_drafts WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(&task_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(FeedbackDraft {
                    task_id: TaskId(row.try_get("task_id")?),
                    reason: row.try_get("reason")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }
}
