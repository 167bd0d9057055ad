//! PostgreSQL delayed-message store.
//!
//! `get_due_messages` removes and returns due rows with a single
//! `DELETE ... RETURNING`, so concurrent drains never hand out the same
//! message twice. The task-ID primary key doubles as the reverse index;
//! re-adding a task ID replaces its delivery time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use conveyor_core::models::message::TaskMessage;
use conveyor_core::{DelayedMessageStore, StoreError};

use crate::sql::map_sqlx;

const TABLE: &str = "conveyor_delayed_messages";

pub struct PgDelayedStore {
    pool: PgPool,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgDelayedStore {
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
                task_id TEXT PRIMARY KEY,
                message JSONB NOT NULL,
                delivery_time TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE}_delivery_time_idx ON {TABLE} (delivery_time)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }
}

#[async_trait]
impl DelayedMessageStore for PgDelayedStore {
    #[tracing::instrument(skip(self, message), fields(task.id = %message.id))]
    async fn add(
        &self,
        message: TaskMessage,
        delivery_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let payload = serde_json::to_value(&message)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE} (task_id, message, delivery_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id) DO UPDATE SET
                message = EXCLUDED.message,
                delivery_time = EXCLUDED.delivery_time
            "#
        ))
        .bind(&message.id)
        .bind(payload)
        .bind(delivery_time)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>, StoreError> {
        self.ensure_schema().await?;
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(&format!(
            r#"
            DELETE FROM {TABLE}
            WHERE delivery_time <= $1
            RETURNING task_id, message
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut due = Vec::with_capacity(rows.len());
        for (task_id, payload) in rows {
            match serde_json::from_value::<TaskMessage>(payload) {
                Ok(message) => due.push(message),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Dropping undecodable delayed message");
                }
            }
        }
        due.sort_by_key(|m| m.eta.unwrap_or(m.sent_at));
        Ok(due)
    }

    async fn remove(&self, task_id: &str) -> Result<bool, StoreError> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!("DELETE FROM {TABLE} WHERE task_id = $1"))
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        self.ensure_schema().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TABLE}"))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(count.max(0) as usize)
    }

    async fn next_delivery_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.ensure_schema().await?;
        sqlx::query_scalar(&format!("SELECT MIN(delivery_time) FROM {TABLE}"))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)
    }
}
