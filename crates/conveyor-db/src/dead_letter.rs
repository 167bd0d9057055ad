//! PostgreSQL dead-letter store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use conveyor_core::config::DeadLetterConfig;
use conveyor_core::models::message::TaskMessage;
use conveyor_core::{Broker, DeadLetter, DeadLetterStore, StoreError};

use crate::sql::map_sqlx;

const TABLE: &str = "conveyor_dead_letters";

pub struct PgDeadLetterStore {
    pool: PgPool,
    config: DeadLetterConfig,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool, config: DeadLetterConfig, auto_create_tables: bool) -> Self {
        Self {
            pool,
            config,
            auto_create_tables,
            init: Mutex::new(false),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        if !self.auto_create_tables {
            return Ok(());
        }
        let mut initialized = self.init.lock().await;
        if *initialized {
            return Ok(());
        }
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TABLE} (
                task_id TEXT PRIMARY KEY,
                message JSONB NOT NULL,
                reason TEXT NOT NULL,
                stored_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE}_stored_at_idx ON {TABLE} (stored_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }

    fn row_to_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, StoreError> {
        let message: serde_json::Value = row.get("message");
        Ok(DeadLetter {
            message: serde_json::from_value(message)?,
            reason: row.get("reason"),
            stored_at: row.get("stored_at"),
            expires_at: row.get("expires_at"),
        })
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    #[tracing::instrument(skip(self, letter), fields(task.id = %letter.message.id))]
    async fn store(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let payload = serde_json::to_value(&letter.message)?;
        let expires_at = letter.expires_at.or_else(|| {
            self.config
                .retention
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| letter.stored_at + d)
        });

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE} (task_id, message, reason, stored_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id) DO UPDATE SET
                message = EXCLUDED.message,
                reason = EXCLUDED.reason,
                stored_at = EXCLUDED.stored_at,
                expires_at = EXCLUDED.expires_at
            "#
        ))
        .bind(&letter.message.id)
        .bind(payload)
        .bind(&letter.reason)
        .bind(letter.stored_at)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        // Evict the oldest entries beyond capacity.
        sqlx::query(&format!(
            r#"
            DELETE FROM {TABLE}
            WHERE task_id IN (
                SELECT task_id FROM {TABLE}
                ORDER BY stored_at DESC
                OFFSET $1
            )
            "#
        ))
        .bind(self.config.max_messages as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        tracing::warn!(reason = %letter.reason, "Message dead-lettered");
        Ok(())
    }

    async fn requeue(&self, task_id: &str, broker: &dyn Broker) -> Result<bool, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE task_id = $1 RETURNING task_id, message, reason, stored_at, expires_at"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let letter = Self::row_to_letter(&row)?;
        let message: TaskMessage = letter.message.clone();

        if let Err(e) = broker.publish(message).await {
            // Re-insert so the message is not lost, then surface the error.
            if let Err(restore) = self.store(letter).await {
                tracing::error!(
                    task_id = %task_id,
                    error = %restore,
                    "Failed to restore dead letter after broker failure"
                );
            }
            return Err(e);
        }
        tracing::info!(task_id = %task_id, "Dead-lettered message requeued");
        Ok(true)
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT task_id, message, reason, stored_at, expires_at
            FROM {TABLE}
            ORDER BY stored_at DESC
            OFFSET $1 LIMIT $2
            "#
        ))
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_letter).collect()
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE expires_at IS NOT NULL AND expires_at <= $1"
        ))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(&format!("DELETE FROM {TABLE}"))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.ensure_schema().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TABLE}"))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(count.max(0) as usize)
    }
}
