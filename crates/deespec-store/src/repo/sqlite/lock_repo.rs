//! SQLite-backed [`LockRepository`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::StoreResult;
use crate::models::{LockRecord, LockType};
use crate::repo::LockRepository;

pub struct SqliteLockRepository {
    pool: SqlitePool,
}

impl SqliteLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<LockRecord> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let lock_type: Option<String> = row.try_get("lock_type")?;
    Ok(LockRecord {
        lock_id: row.try_get("lock_id")?,
        pid: row.try_get("pid")?,
        hostname: row.try_get("hostname")?,
        acquired_at: row.try_get::<String, _>("acquired_at")?.parse::<DateTime<Utc>>()?,
        expires_at: row.try_get::<String, _>("expires_at")?.parse::<DateTime<Utc>>()?,
        heartbeat_at: row.try_get::<String, _>("heartbeat_at")?.parse::<DateTime<Utc>>()?,
        metadata: serde_json::from_str(&metadata_json)?,
        lock_type: lock_type.map(|s| s.parse()).transpose()?,
    })
}

#[async_trait]
impl LockRepository for SqliteLockRepository {
    async fn try_acquire(
        &self,
        lock_id: &str,
        lock_type: Option<LockType>,
        pid: i64,
        hostname: &str,
        ttl: chrono::Duration,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query("SELECT expires_at FROM locks WHERE lock_id = ?")
            .bind(lock_id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let expires_at: String = row.try_get("expires_at")?;
            let expires_at: DateTime<Utc> = expires_at.parse()?;
            if now <= expires_at {
                return Ok(false);
            }
            sqlx::query("DELETE FROM locks WHERE lock_id = ?")
                .bind(lock_id)
                .execute(&mut *tx)
                .await?;
        }

        let expires_at = now + ttl;
        sqlx::query(
            r#"
            INSERT INTO locks
                (lock_id, pid, hostname, acquired_at, expires_at, heartbeat_at, metadata_json, lock_type)
            VALUES (?, ?, ?, ?, ?, ?, '{}', ?)
            "#,
        )
        .bind(lock_id)
        .bind(pid)
        .bind(hostname)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(lock_type.map(|t| t.to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn heartbeat(&self, lock_id: &str, pid: i64, ttl: chrono::Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let expires_at = now + ttl;
        let result = sqlx::query(
            "UPDATE locks SET heartbeat_at = ?, expires_at = ? WHERE lock_id = ? AND pid = ?",
        )
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(lock_id)
        .bind(pid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, lock_id: &str, pid: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_id = ? AND pid = ?")
            .bind(lock_id)
            .bind(pid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, lock_id: &str) -> StoreResult<Option<LockRecord>> {
        let row = sqlx::query("SELECT * FROM locks WHERE lock_id = ?")
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_all(&self) -> StoreResult<Vec<(String, LockRecord)>> {
        let rows = sqlx::query("SELECT * FROM locks").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| row_to_record(r).map(|rec| (rec.lock_id.clone(), rec)))
            .collect()
    }

    async fn force_release(&self, lock_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_id = ?")
            .bind(lock_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
