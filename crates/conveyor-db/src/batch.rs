//! PostgreSQL batch store.
//!
//! Mark operations load the batch `FOR UPDATE`, apply the pure transition
//! logic from `conveyor_core::models::batch` and write back in the same
//! transaction, so concurrent marks on one batch serialize instead of
//! losing updates.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::models::batch::{Batch, BatchState};
use conveyor_core::{BatchStore, StoreError};

use crate::sql::map_sqlx;

const BATCHES: &str = "conveyor_batches";
const BATCH_TASKS: &str = "conveyor_batch_tasks";

pub struct PgBatchStore {
    pool: PgPool,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgBatchStore {
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
            CREATE TABLE IF NOT EXISTS {BATCHES} (
                id UUID PRIMARY KEY,
                name TEXT,
                state TEXT NOT NULL,
                task_ids JSONB NOT NULL,
                completed_task_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
                failed_task_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {BATCH_TASKS} (
                task_id TEXT PRIMARY KEY,
                batch_id UUID NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }

    fn row_to_batch(row: &sqlx::postgres::PgRow) -> Result<Batch, StoreError> {
        let state: serde_json::Value = serde_json::Value::String(row.get("state"));
        Ok(Batch {
            id: row.get("id"),
            name: row.get("name"),
            state: serde_json::from_value(state)?,
            task_ids: serde_json::from_value(row.get("task_ids"))?,
            completed_task_ids: serde_json::from_value(row.get("completed_task_ids"))?,
            failed_task_ids: serde_json::from_value(row.get("failed_task_ids"))?,
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn state_to_str(state: BatchState) -> String {
        // serde produces the canonical snake_case tag.
        serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "pending".to_string())
    }

    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
    ) -> Result<Option<Batch>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT id, name, state, task_ids, completed_task_ids, failed_task_ids,
                   created_at, completed_at
            FROM {BATCHES}
            WHERE id = $1
            FOR UPDATE
            "#
        ))
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        batch: &Batch,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            UPDATE {BATCHES}
            SET state = $2,
                completed_task_ids = $3,
                failed_task_ids = $4,
                completed_at = $5
            WHERE id = $1
            "#
        ))
        .bind(batch.id)
        .bind(Self::state_to_str(batch.state))
        .bind(serde_json::to_value(&batch.completed_task_ids)?)
        .bind(serde_json::to_value(&batch.failed_task_ids)?)
        .bind(batch.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn mark(&self, task_id: &str, completed: bool) -> Result<Option<Batch>, StoreError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let batch_id: Option<Uuid> = sqlx::query_scalar(&format!(
            "SELECT batch_id FROM {BATCH_TASKS} WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(batch_id) = batch_id else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let Some(mut batch) = Self::load_for_update(&mut tx, batch_id).await? else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        if completed {
            batch.record_completed(task_id);
        } else {
            batch.record_failed(task_id);
        }
        Self::write_back(&mut tx, &batch).await?;
        tx.commit().await.map_err(map_sqlx)?;

        if batch.state.is_terminal() {
            tracing::info!(
                batch_id = %batch.id,
                state = ?batch.state,
                completed = batch.completed_count(),
                failed = batch.failed_count(),
                "Batch reached terminal state"
            );
        }
        Ok(Some(batch))
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    #[tracing::instrument(skip(self, batch), fields(batch.id = %batch.id))]
    async fn create(&self, batch: Batch) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {BATCHES} (
                id, name, state, task_ids, completed_task_ids, failed_task_ids,
                created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#
        ))
        .bind(batch.id)
        .bind(&batch.name)
        .bind(Self::state_to_str(batch.state))
        .bind(serde_json::to_value(&batch.task_ids)?)
        .bind(serde_json::to_value(&batch.completed_task_ids)?)
        .bind(serde_json::to_value(&batch.failed_task_ids)?)
        .bind(batch.created_at)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch.id
            )));
        }

        for task_id in &batch.task_ids {
            sqlx::query(&format!(
                r#"
                INSERT INTO {BATCH_TASKS} (task_id, batch_id)
                VALUES ($1, $2)
                ON CONFLICT (task_id) DO UPDATE SET batch_id = EXCLUDED.batch_id
                "#
            ))
            .bind(task_id)
            .bind(batch.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(&format!(
            r#"
            SELECT id, name, state, task_ids, completed_task_ids, failed_task_ids,
                   created_at, completed_at
            FROM {BATCHES}
            WHERE id = $1
            "#
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn mark_task_completed(&self, task_id: &str) -> Result<Option<Batch>, StoreError> {
        self.mark(task_id, true).await
    }

    async fn mark_task_failed(&self, task_id: &str) -> Result<Option<Batch>, StoreError> {
        self.mark(task_id, false).await
    }

    async fn update_state(&self, batch_id: Uuid, new_state: BatchState) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let completed_at = if new_state.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        let result = sqlx::query(&format!(
            r#"
            UPDATE {BATCHES}
            SET state = $2,
                completed_at = COALESCE(completed_at, $3)
            WHERE id = $1
            "#
        ))
        .bind(batch_id)
        .bind(Self::state_to_str(new_state))
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("batch {}", batch_id)));
        }
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(&format!("DELETE FROM {BATCH_TASKS} WHERE batch_id = $1"))
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query(&format!("DELETE FROM {BATCHES} WHERE id = $1"))
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn batch_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.ensure_schema().await?;
        sqlx::query_scalar(&format!(
            "SELECT batch_id FROM {BATCH_TASKS} WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }
}
