//! PostgreSQL saga store.
//!
//! Multiple workers update different steps of the same saga concurrently,
//! so every mutation is one transaction: load the saga row `FOR UPDATE`,
//! apply the pure state machine from `conveyor_core::models::saga`, write
//! back, refresh the task index, and stamp a TTL when the resulting state
//! is terminal. The `state` column with its `(state, created_at)` index is
//! the per-state secondary index. Operations run under the configured
//! resilience policy so transient connection errors retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::config::SagaStoreConfig;
use conveyor_core::models::saga::{Saga, SagaState, SagaStepState, StepUpdate};
use conveyor_core::{SagaStore, StoreError};
use conveyor_infra::RetryPolicy;

use crate::sql::map_sqlx;

const SAGAS: &str = "conveyor_sagas";
const SAGA_TASKS: &str = "conveyor_saga_tasks";

pub struct PgSagaStore {
    pool: PgPool,
    config: SagaStoreConfig,
    retry: RetryPolicy,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgSagaStore {
    pub fn new(pool: PgPool, config: SagaStoreConfig, auto_create_tables: bool) -> Self {
        let retry = RetryPolicy::from_config(&config.resilience);
        Self {
            pool,
            config,
            retry,
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
            CREATE TABLE IF NOT EXISTS {SAGAS} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                current_step_index INTEGER NOT NULL DEFAULT 0,
                steps JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                failure_reason TEXT,
                expires_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {SAGAS}_state_created_idx ON {SAGAS} (state, created_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {SAGA_TASKS} (
                task_id TEXT PRIMARY KEY,
                saga_id UUID NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }

    fn state_to_str(state: SagaState) -> String {
        serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "created".to_string())
    }

    fn row_to_saga(row: &sqlx::postgres::PgRow) -> Result<Saga, StoreError> {
        let state: serde_json::Value = serde_json::Value::String(row.get("state"));
        Ok(Saga {
            id: row.get("id"),
            name: row.get("name"),
            state: serde_json::from_value(state)?,
            current_step_index: row.get::<i32, _>("current_step_index").max(0) as u32,
            steps: serde_json::from_value(row.get("steps"))?,
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            failure_reason: row.get("failure_reason"),
        })
    }

    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: Uuid,
    ) -> Result<Saga, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT id, name, state, current_step_index, steps, created_at,
                   completed_at, failure_reason
            FROM {SAGAS}
            WHERE id = $1 AND (expires_at IS NULL OR expires_at > NOW())
            FOR UPDATE
            "#
        ))
        .bind(saga_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        match row {
            Some(row) => Self::row_to_saga(&row),
            None => Err(StoreError::NotFound(format!("saga {}", saga_id))),
        }
    }

    fn terminal_expiry(&self, state: SagaState) -> Option<DateTime<Utc>> {
        if !state.is_terminal() {
            return None;
        }
        self.config
            .completed_ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d)
    }

    async fn write_back(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        saga: &Saga,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            UPDATE {SAGAS}
            SET state = $2,
                current_step_index = $3,
                steps = $4,
                completed_at = $5,
                failure_reason = $6,
                expires_at = COALESCE(expires_at, $7)
            WHERE id = $1
            "#
        ))
        .bind(saga.id)
        .bind(Self::state_to_str(saga.state))
        .bind(saga.current_step_index as i32)
        .bind(serde_json::to_value(&saga.steps)?)
        .bind(saga.completed_at)
        .bind(&saga.failure_reason)
        .bind(self.terminal_expiry(saga.state))
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        for task_id in saga.referenced_task_ids() {
            sqlx::query(&format!(
                r#"
                INSERT INTO {SAGA_TASKS} (task_id, saga_id)
                VALUES ($1, $2)
                ON CONFLICT (task_id) DO UPDATE SET saga_id = EXCLUDED.saga_id
                "#
            ))
            .bind(&task_id)
            .bind(saga.id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    /// Load-mutate-store skeleton shared by every mutation.
    async fn mutate<F>(&self, saga_id: Uuid, apply: F) -> Result<(), StoreError>
    where
        F: Fn(&mut Saga) -> Result<(), StoreError> + Send + Sync,
    {
        self.ensure_schema().await?;
        let apply = &apply;
        self.retry
            .run("saga_mutation", move || async move {
                let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
                let mut saga = Self::load_for_update(&mut tx, saga_id).await?;
                apply(&mut saga)?;
                self.write_back(&mut tx, &saga).await?;
                tx.commit().await.map_err(map_sqlx)
            })
            .await
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    #[tracing::instrument(skip(self, saga), fields(saga.id = %saga.id, saga.name = %saga.name))]
    async fn create(&self, saga: Saga) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let saga = &saga;
        self.retry
            .run("saga_create", move || async move {
                let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
                let inserted = sqlx::query(&format!(
                    r#"
                    INSERT INTO {SAGAS} (
                        id, name, state, current_step_index, steps, created_at,
                        completed_at, failure_reason, expires_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (id) DO NOTHING
                    "#
                ))
                .bind(saga.id)
                .bind(&saga.name)
                .bind(Self::state_to_str(saga.state))
                .bind(saga.current_step_index as i32)
                .bind(serde_json::to_value(&saga.steps)?)
                .bind(saga.created_at)
                .bind(saga.completed_at)
                .bind(&saga.failure_reason)
                .bind(self.terminal_expiry(saga.state))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                if inserted.rows_affected() == 0 {
                    tx.rollback().await.ok();
                    return Err(StoreError::Conflict(format!(
                        "saga {} already exists",
                        saga.id
                    )));
                }

                for task_id in saga.referenced_task_ids() {
                    sqlx::query(&format!(
                        r#"
                        INSERT INTO {SAGA_TASKS} (task_id, saga_id)
                        VALUES ($1, $2)
                        ON CONFLICT (task_id) DO UPDATE SET saga_id = EXCLUDED.saga_id
                        "#
                    ))
                    .bind(&task_id)
                    .bind(saga.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                }
                tx.commit().await.map_err(map_sqlx)
            })
            .await
    }

    async fn get(&self, saga_id: Uuid) -> Result<Option<Saga>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(&format!(
            r#"
            SELECT id, name, state, current_step_index, steps, created_at,
                   completed_at, failure_reason
            FROM {SAGAS}
            WHERE id = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#
        ))
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(Self::row_to_saga).transpose()
    }

    async fn update_state(
        &self,
        saga_id: Uuid,
        new_state: SagaState,
        failure_reason: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(saga_id, move |saga| {
            saga.transition(new_state, failure_reason.clone());
            Ok(())
        })
        .await
    }

    async fn update_step_state(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        new_state: SagaStepState,
        update: StepUpdate,
    ) -> Result<(), StoreError> {
        self.mutate(saga_id, move |saga| {
            saga.apply_step_update(step_id, new_state, update.clone())
                .map(|_| ())
                .map_err(|e| StoreError::NotFound(e.to_string()))
        })
        .await
    }

    async fn advance_step(&self, saga_id: Uuid) -> Result<(), StoreError> {
        self.mutate(saga_id, |saga| {
            saga.advance_step();
            Ok(())
        })
        .await
    }

    async fn mark_step_compensated(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        success: bool,
        compensate_task_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(saga_id, move |saga| {
            saga.apply_compensation(
                step_id,
                success,
                compensate_task_id.clone(),
                error.clone(),
            )
            .map(|_| ())
            .map_err(|e| StoreError::NotFound(e.to_string()))
        })
        .await
    }

    async fn delete(&self, saga_id: Uuid) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(&format!("DELETE FROM {SAGA_TASKS} WHERE saga_id = $1"))
            .bind(saga_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query(&format!("DELETE FROM {SAGAS} WHERE id = $1"))
            .bind(saga_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn get_saga_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.ensure_schema().await?;
        sqlx::query_scalar(&format!(
            r#"
            SELECT t.saga_id FROM {SAGA_TASKS} t
            JOIN {SAGAS} s ON s.id = t.saga_id
            WHERE t.task_id = $1 AND (s.expires_at IS NULL OR s.expires_at > NOW())
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn get_by_state(
        &self,
        state: SagaState,
        limit: usize,
    ) -> Result<Vec<Saga>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, name, state, current_step_index, steps, created_at,
                   completed_at, failure_reason
            FROM {SAGAS}
            WHERE state = $1 AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(Self::state_to_str(state))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_saga).collect()
    }
}
