//! PostgreSQL result backend.
//!
//! `store_result` upserts the result row and publishes the serialized
//! result on the task's notification channel inside the same transaction;
//! the payload travels through a bound `pg_notify` parameter, never through
//! SQL text. `wait_for_result` races a local waiter, a dedicated
//! `PgListener` subscription and a polling fallback; the first to produce a
//! terminal result wins. An optional background loop deletes expired rows
//! in batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use conveyor_core::config::ResultBackendConfig;
use conveyor_core::models::result::{ExceptionInfo, TaskResult, TaskState};
use conveyor_core::{ResultBackend, StoreError, WaitError};

use crate::channel::channel_for;
use crate::sql::{map_sqlx, qualified_table};

pub struct PgResultBackend {
    pool: PgPool,
    config: ResultBackendConfig,
    table: String,
    init: Mutex<bool>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<TaskResult>>>>,
}

impl PgResultBackend {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, config: ResultBackendConfig) -> Result<Self, StoreError> {
        let table = qualified_table(config.schema.as_deref(), &config.table_name)?;
        Ok(Self {
            pool,
            config,
            table,
            init: Mutex::new(false),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Connect a new pool from the configuration.
    pub async fn connect(config: ResultBackendConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(config.command_timeout)
            .connect(&config.connection_string)
            .await
            .map_err(map_sqlx)?;
        Self::new(pool, config)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent table bootstrap guarded by the init mutex; first use
    /// calls this before touching the table.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        if !self.config.auto_create_tables {
            return Ok(());
        }
        let mut initialized = self.init.lock().await;
        if *initialized {
            return Ok(());
        }

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                task_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                result BYTEA,
                content_type TEXT,
                exception JSONB,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT,
                retries INTEGER NOT NULL DEFAULT 0,
                worker TEXT,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                retry_after_ms BIGINT,
                do_not_increment_retries BOOLEAN NOT NULL DEFAULT FALSE,
                terminated BOOLEAN,
                requeue_delay_ms BIGINT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ
            )
            "#,
            table = self.table
        );
        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (expires_at) WHERE expires_at IS NOT NULL",
            index = format!("{}_expires_at_idx", self.config.table_name),
            table = self.table
        );
        sqlx::query(&create_index)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        *initialized = true;
        tracing::debug!(table = %self.table, "Result backend schema ready");
        Ok(())
    }

    fn row_to_result(row: &PgRow) -> Result<TaskResult, StoreError> {
        let state: String = row.get("state");
        let state: TaskState = state
            .parse()
            .map_err(|e: anyhow::Error| StoreError::Other(e))?;
        let exception: Option<serde_json::Value> = row.get("exception");
        let metadata: serde_json::Value = row.get("metadata");

        Ok(TaskResult {
            task_id: row.get("task_id"),
            state,
            result: row.get("result"),
            content_type: row.get("content_type"),
            exception: exception
                .map(serde_json::from_value::<ExceptionInfo>)
                .transpose()?,
            completed_at: row.get("completed_at"),
            duration_ms: row.get("duration_ms"),
            retries: row.get::<i32, _>("retries").max(0) as u32,
            worker: row.get("worker"),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            retry_after: row
                .get::<Option<i64>, _>("retry_after_ms")
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            do_not_increment_retries: row.get("do_not_increment_retries"),
            terminated: row.get("terminated"),
            requeue_delay: row
                .get::<Option<i64>, _>("requeue_delay_ms")
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn fetch(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        self.ensure_schema().await?;
        let select = format!(
            r#"
            SELECT task_id, state, result, content_type, exception, completed_at,
                   duration_ms, retries, worker, metadata, retry_after_ms,
                   do_not_increment_retries, terminated, requeue_delay_ms
            FROM {table}
            WHERE task_id = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
            table = self.table
        );
        let row = sqlx::query(&select)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(Self::row_to_result).transpose()
    }

    async fn fetch_terminal(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        Ok(self
            .fetch(task_id)
            .await?
            .filter(|r| r.state.is_terminal()))
    }

    fn notify_channel(&self, task_id: &str) -> Result<String, StoreError> {
        channel_for(&self.config.notify_channel_prefix, task_id)
    }

    /// Dedicated-listener arm of the wait protocol. Resolves only on a
    /// terminal result for `task_id`; on listener errors it parks forever
    /// and lets the polling fallback win.
    async fn listen_for(&self, task_id: &str) -> TaskResult {
        let channel = match self.notify_channel(task_id) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot derive notify channel, relying on polling");
                return std::future::pending().await;
            }
        };
        // Listener connections are dedicated, never shared across waiters.
        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "Listener connect failed, relying on polling");
                return std::future::pending().await;
            }
        };
        if let Err(e) = listener.listen(&channel).await {
            tracing::warn!(error = %e, channel = %channel, "LISTEN failed, relying on polling");
            return std::future::pending().await;
        }

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    match serde_json::from_str::<TaskResult>(notification.payload()) {
                        Ok(result) if result.task_id == task_id && result.state.is_terminal() => {
                            return result;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Poll still wins; malformed payloads are dropped.
                            tracing::warn!(error = %e, "Undecodable result notification ignored");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Listener connection lost, relying on polling");
                    return std::future::pending().await;
                }
            }
        }
    }

    /// Spawn the expired-row cleanup loop when configured.
    pub fn spawn_cleanup(self: &Arc<Self>) -> Option<CleanupHandle> {
        let interval = self.config.cleanup_interval?;
        let backend = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = interval.as_secs(),
                batch_size = backend.config.cleanup_batch_size,
                "Result cleanup loop started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match backend.cleanup_expired().await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!(deleted = n, "Deleted expired results"),
                            Err(e) => tracing::error!(error = %e, "Result cleanup failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Result cleanup loop shutting down");
                        break;
                    }
                }
            }
        });
        Some(CleanupHandle { shutdown_tx })
    }

    /// One bounded cleanup pass.
    pub async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let delete = format!(
            r#"
            DELETE FROM {table}
            WHERE ctid IN (
                SELECT ctid FROM {table}
                WHERE expires_at IS NOT NULL AND expires_at < NOW()
                LIMIT $1
            )
            "#,
            table = self.table
        );
        let result = sqlx::query(&delete)
            .bind(self.config.cleanup_batch_size as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn complete_local_waiters(&self, result: &TaskResult) {
        if !result.state.is_terminal() {
            return;
        }
        let senders = self
            .waiters
            .lock()
            .await
            .remove(&result.task_id)
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(result.clone());
        }
    }
}

#[async_trait]
impl ResultBackend for PgResultBackend {
    #[tracing::instrument(skip(self, result), fields(task.id = %result.task_id, state = %result.state))]
    async fn store_result(
        &self,
        result: &TaskResult,
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let expiry = expiry.or(self.config.default_expiry);
        let expires_at: Option<DateTime<Utc>> = expiry
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        let exception = result
            .exception
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let metadata = serde_json::to_value(&result.metadata)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let upsert = format!(
            r#"
            INSERT INTO {table} (
                task_id, state, result, content_type, exception, completed_at,
                duration_ms, retries, worker, metadata, retry_after_ms,
                do_not_increment_retries, terminated, requeue_delay_ms,
                updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), $15)
            ON CONFLICT (task_id) DO UPDATE SET
                state = EXCLUDED.state,
                result = EXCLUDED.result,
                content_type = EXCLUDED.content_type,
                exception = EXCLUDED.exception,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms,
                retries = EXCLUDED.retries,
                worker = EXCLUDED.worker,
                metadata = EXCLUDED.metadata,
                retry_after_ms = EXCLUDED.retry_after_ms,
                do_not_increment_retries = EXCLUDED.do_not_increment_retries,
                terminated = EXCLUDED.terminated,
                requeue_delay_ms = EXCLUDED.requeue_delay_ms,
                updated_at = NOW(),
                expires_at = EXCLUDED.expires_at
            "#,
            table = self.table
        );
        sqlx::query(&upsert)
            .bind(&result.task_id)
            .bind(result.state.to_string())
            .bind(result.result.as_deref())
            .bind(result.content_type.as_deref())
            .bind(exception)
            .bind(result.completed_at)
            .bind(result.duration_ms)
            .bind(result.retries as i32)
            .bind(result.worker.as_deref())
            .bind(metadata)
            .bind(result.retry_after.map(|d| d.as_millis() as i64))
            .bind(result.do_not_increment_retries)
            .bind(result.terminated)
            .bind(result.requeue_delay.map(|d| d.as_millis() as i64))
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        // Publish inside the transaction; the channel name is sanitized and
        // the payload is a bound parameter, so no untrusted bytes reach the
        // notification command.
        if self.config.use_notify && result.state.is_terminal() {
            let channel = self.notify_channel(&result.task_id)?;
            let payload = serde_json::to_string(result)?;
            if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&channel)
                .bind(&payload)
                .execute(&mut *tx)
                .await
            {
                // Waiters still converge through polling.
                tracing::warn!(error = %e, channel = %channel, "pg_notify failed, poll will deliver");
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        self.complete_local_waiters(result).await;
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        self.fetch_terminal(task_id).await
    }

    async fn wait_for_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) -> Result<TaskResult, WaitError> {
        // Local short-circuit.
        if let Some(result) = self.fetch_terminal(task_id).await? {
            return Ok(result);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(tx);

        // Close the race window between the first get and registration.
        if let Some(result) = self.fetch_terminal(task_id).await? {
            return Ok(result);
        }

        let push = self.listen_for(task_id);

        let poll = async {
            loop {
                tokio::time::sleep(self.config.polling_interval).await;
                match self.fetch_terminal(task_id).await {
                    Ok(Some(result)) => return result,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Result poll failed, will retry"),
                }
            }
        };

        let timeout_sleep = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            notified = rx => match notified {
                Ok(result) => Ok(result),
                Err(_) => self
                    .fetch_terminal(task_id)
                    .await?
                    .ok_or_else(|| WaitError::Cancelled(task_id.to_string())),
            },
            result = push => Ok(result),
            result = poll => Ok(result),
            _ = timeout_sleep => Err(WaitError::Timeout(task_id.to_string())),
            _ = token.cancelled() => Err(WaitError::Cancelled(task_id.to_string())),
        }
    }

    async fn update_state(
        &self,
        task_id: &str,
        state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let metadata = serde_json::to_value(metadata.unwrap_or_default())?;
        let upsert = format!(
            r#"
            INSERT INTO {table} (task_id, state, metadata, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (task_id) DO UPDATE SET
                state = EXCLUDED.state,
                metadata = {table}.metadata || EXCLUDED.metadata,
                updated_at = NOW()
            "#,
            table = self.table
        );
        sqlx::query(&upsert)
            .bind(task_id)
            .bind(state.to_string())
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_state(&self, task_id: &str) -> Result<Option<TaskState>, StoreError> {
        self.ensure_schema().await?;
        let select = format!(
            "SELECT state FROM {table} WHERE task_id = $1 AND (expires_at IS NULL OR expires_at > NOW())",
            table = self.table
        );
        let state: Option<String> = sqlx::query_scalar(&select)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        state
            .map(|s| s.parse().map_err(|e: anyhow::Error| StoreError::Other(e)))
            .transpose()
    }
}

pub struct CleanupHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl CleanupHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
