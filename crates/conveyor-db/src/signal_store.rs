//! PostgreSQL signal store for the queued-dispatch mode.
//!
//! `dequeue` claims with `FOR UPDATE SKIP LOCKED`, so multiple processors
//! can drain the same store without double-processing.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::models::signal::SignalMessage;
use conveyor_core::{SignalStore, StoreError};

use crate::sql::map_sqlx;

const TABLE: &str = "conveyor_signal_messages";

pub struct PgSignalStore {
    pool: PgPool,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgSignalStore {
    pub fn new(pool: PgPool, auto_create_tables: bool) -> Self {
        Self {
            pool,
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
                id UUID PRIMARY KEY,
                signal JSONB NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                claimed_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE}_pending_idx ON {TABLE} (enqueued_at) WHERE claimed_at IS NULL"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }
}

#[async_trait]
impl SignalStore for PgSignalStore {
    async fn enqueue(&self, message: SignalMessage) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE} (id, signal, enqueued_at, attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#
        ))
        .bind(message.id)
        .bind(serde_json::to_value(&message.signal)?)
        .bind(message.enqueued_at)
        .bind(message.attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<SignalMessage>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
            SET claimed_at = NOW(), attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM {TABLE}
                WHERE claimed_at IS NULL
                ORDER BY enqueued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, signal, enqueued_at, attempts
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let signal: serde_json::Value = row.get("signal");
            claimed.push(SignalMessage {
                id: row.get("id"),
                signal: serde_json::from_value(signal)?,
                enqueued_at: row.get("enqueued_at"),
                attempts: row.get::<i32, _>("attempts").max(0) as u32,
            });
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE id = $1 AND claimed_at IS NOT NULL"
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("signal message {}", id)));
        }
        Ok(())
    }

    async fn reject(&self, id: Uuid, requeue: bool) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let result = if requeue {
            sqlx::query(&format!(
                "UPDATE {TABLE} SET claimed_at = NULL WHERE id = $1 AND claimed_at IS NOT NULL"
            ))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
        } else {
            sqlx::query(&format!(
                "DELETE FROM {TABLE} WHERE id = $1 AND claimed_at IS NOT NULL"
            ))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("signal message {}", id)));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {TABLE} WHERE claimed_at IS NULL"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(count.max(0) as u64)
    }
}
