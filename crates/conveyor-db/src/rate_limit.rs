//! PostgreSQL sliding-window rate limiter.
//!
//! One transaction per decision: prune entries that slid out of the
//! window, lock and count the remainder (`FOR UPDATE` serializes
//! concurrent acquisitions on the same resource key at the default READ
//! COMMITTED level; nothing weaker may be configured on the pool), then
//! insert or deny. Distinct resource keys never contend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

use conveyor_core::models::rate_limit::{RateLimitLease, RateLimitPolicy};
use conveyor_core::{RateLimiter, StoreError};

use crate::sql::map_sqlx;

const TABLE: &str = "conveyor_rate_limit_entries";

pub struct PgRateLimiter {
    pool: PgPool,
    auto_create_tables: bool,
    init: Mutex<bool>,
}

impl PgRateLimiter {
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
                id BIGSERIAL PRIMARY KEY,
                resource_key TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE}_key_time_idx ON {TABLE} (resource_key, acquired_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        *initialized = true;
        Ok(())
    }

    fn window(policy: &RateLimitPolicy) -> chrono::Duration {
        chrono::Duration::from_std(policy.window).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    #[tracing::instrument(skip(self, policy))]
    async fn try_acquire(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitLease, StoreError> {
        self.ensure_schema().await?;
        let now = Utc::now();
        let window = Self::window(policy);
        let cutoff = now - window;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(&format!(
            "DELETE FROM {TABLE} WHERE resource_key = $1 AND acquired_at <= $2"
        ))
        .bind(key)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let entries: Vec<DateTime<Utc>> = sqlx::query_scalar(&format!(
            r#"
            SELECT acquired_at FROM {TABLE}
            WHERE resource_key = $1 AND acquired_at > $2
            ORDER BY acquired_at ASC
            FOR UPDATE
            "#
        ))
        .bind(key)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let count = entries.len() as u32;
        if count < policy.limit {
            sqlx::query(&format!(
                "INSERT INTO {TABLE} (resource_key, acquired_at) VALUES ($1, $2)"
            ))
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            tx.commit().await.map_err(map_sqlx)?;
            return Ok(RateLimitLease::Acquired {
                remaining: policy.limit - count - 1,
                reset_at: now + window,
            });
        }

        tx.commit().await.map_err(map_sqlx)?;
        let oldest = entries[0];
        let reset_at = oldest + window;
        let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
        Ok(RateLimitLease::RateLimited {
            retry_after,
            reset_at,
        })
    }

    async fn usage(&self, key: &str, policy: &RateLimitPolicy) -> Result<u32, StoreError> {
        self.ensure_schema().await?;
        let cutoff = Utc::now() - Self::window(policy);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {TABLE} WHERE resource_key = $1 AND acquired_at > $2"
        ))
        .bind(key)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(count.max(0) as u32)
    }

    async fn retry_after(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<Duration>, StoreError> {
        self.ensure_schema().await?;
        let now = Utc::now();
        let window = Self::window(policy);
        let cutoff = now - window;

        let entries: Vec<DateTime<Utc>> = sqlx::query_scalar(&format!(
            r#"
            SELECT acquired_at FROM {TABLE}
            WHERE resource_key = $1 AND acquired_at > $2
            ORDER BY acquired_at ASC
            "#
        ))
        .bind(key)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if (entries.len() as u32) < policy.limit {
            return Ok(None);
        }
        let reset_at = entries[0] + window;
        Ok(Some((reset_at - now).to_std().unwrap_or(Duration::ZERO)))
    }
}
