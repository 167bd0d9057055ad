//! PostgreSQL revocation store.
//!
//! The revoked set lives in a table; events ride LISTEN/NOTIFY on one
//! configured channel. Publishing happens inside the upsert transaction
//! with the payload bound as a parameter. Every subscription takes its own
//! `PgListener` connection and fans out through an unbounded in-process
//! channel, so slow consumers never back-pressure publishers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use conveyor_core::config::RevocationConfig;
use conveyor_core::models::revocation::{
    RevocationEntry, RevocationEvent, RevocationOptions, RevocationSignal,
};
use conveyor_core::{RevocationStore, StoreError};

use crate::channel::is_valid_channel;
use crate::sql::map_sqlx;

const TABLE: &str = "conveyor_revocations";

pub struct PgRevocationStore {
    pool: PgPool,
    config: RevocationConfig,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgRevocationStore {
    pub fn new(
        pool: PgPool,
        config: RevocationConfig,
        auto_create_tables: bool,
    ) -> Result<Self, StoreError> {
        if !is_valid_channel(&config.channel) {
            return Err(StoreError::Other(anyhow::anyhow!(
                "invalid revocation channel \"{}\"",
                config.channel
            )));
        }
        Ok(Self {
            pool,
            config,
            auto_create_tables,
            init: Mutex::new(false),
        })
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
                terminate BOOLEAN NOT NULL DEFAULT FALSE,
                signal TEXT NOT NULL DEFAULT 'graceful',
                revoked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }

    fn signal_to_str(signal: RevocationSignal) -> &'static str {
        match signal {
            RevocationSignal::Graceful => "graceful",
            RevocationSignal::Immediate => "immediate",
        }
    }
}

#[async_trait]
impl RevocationStore for PgRevocationStore {
    #[tracing::instrument(skip(self, options))]
    async fn revoke(&self, task_id: &str, options: RevocationOptions) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let entry = RevocationEntry::new(task_id, options);
        let event = RevocationEvent::from(&entry);
        let payload = serde_json::to_string(&event)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE} (task_id, terminate, signal, revoked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id) DO UPDATE SET
                terminate = EXCLUDED.terminate,
                signal = EXCLUDED.signal,
                revoked_at = EXCLUDED.revoked_at,
                expires_at = EXCLUDED.expires_at
            "#
        ))
        .bind(&entry.task_id)
        .bind(entry.options.terminate)
        .bind(Self::signal_to_str(entry.options.signal))
        .bind(entry.revoked_at)
        .bind(entry.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.config.channel)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        tracing::info!(task_id = %task_id, "Task revoked");
        Ok(())
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool, StoreError> {
        self.ensure_schema().await?;
        // Lazy purge of this entry when expired.
        sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE task_id = $1 AND expires_at IS NOT NULL AND expires_at <= NOW()"
        ))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {TABLE} WHERE task_id = $1)"
        ))
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(exists)
    }

    async fn revoked_task_ids(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_schema().await?;
        sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE expires_at IS NOT NULL AND expires_at <= NOW()"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        sqlx::query_scalar(&format!("SELECT task_id FROM {TABLE}"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn cleanup(&self, max_age: Duration) -> Result<u64, StoreError> {
        self.ensure_schema().await?;
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query(&format!("DELETE FROM {TABLE} WHERE revoked_at < $1"))
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RevocationEvent>, StoreError> {
        self.ensure_schema().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();
        let channel = self.config.channel.clone();

        // One dedicated listener connection per subscription lifetime; the
        // task ends when the receiver is dropped.
        tokio::spawn(async move {
            loop {
                let mut listener = match sqlx::postgres::PgListener::connect_with(&pool).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::warn!(error = %e, "Revocation listener connect failed, will retry");
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                if let Err(e) = listener.listen(&channel).await {
                    tracing::warn!(error = %e, "Revocation LISTEN failed, will retry");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }

                loop {
                    match listener.recv().await {
                        Ok(notification) => {
                            match serde_json::from_str::<RevocationEvent>(notification.payload()) {
                                Ok(event) => {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    // Dropped, never propagated.
                                    tracing::warn!(error = %e, "Undecodable revocation event ignored");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Revocation listener lost, reconnecting");
                            break;
                        }
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
