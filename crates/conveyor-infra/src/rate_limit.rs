//! In-process sliding-window rate limiter.
//!
//! One admission log per resource key; `try_acquire` prunes, counts and
//! inserts under a single lock so concurrent callers on the same key never
//! over-admit. Independent `(key, policy)` pairs do not interfere. The
//! distributed counterpart backed by Postgres lives in `conveyor-db`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use conveyor_core::models::rate_limit::{RateLimitLease, RateLimitPolicy};
use conveyor_core::{RateLimiter, StoreError};

#[derive(Default)]
pub struct SlidingWindowRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn window_duration(policy: &RateLimitPolicy) -> chrono::Duration {
        chrono::Duration::from_std(policy.window).unwrap_or(chrono::Duration::zero())
    }

    fn prune(entries: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while entries.front().map(|t| *t <= cutoff).unwrap_or(false) {
            entries.pop_front();
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    #[tracing::instrument(skip(self, policy))]
    async fn try_acquire(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitLease, StoreError> {
        let now = Utc::now();
        let window = Self::window_duration(policy);
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(key.to_string()).or_default();
        Self::prune(entries, now - window);

        let count = entries.len() as u32;
        if count < policy.limit {
            entries.push_back(now);
            tracing::trace!(key = %key, remaining = policy.limit - count - 1, "Rate limit admission granted");
            return Ok(RateLimitLease::Acquired {
                remaining: policy.limit - count - 1,
                reset_at: now + window,
            });
        }

        // Full: the oldest entry leaving the window frees the next slot.
        let oldest = *entries.front().expect("window is full but empty");
        let reset_at = oldest + window;
        let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(
            key = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit admission denied"
        );
        Ok(RateLimitLease::RateLimited {
            retry_after,
            reset_at,
        })
    }

    async fn usage(&self, key: &str, policy: &RateLimitPolicy) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(key.to_string()).or_default();
        Self::prune(entries, now - Self::window_duration(policy));
        Ok(entries.len() as u32)
    }

    async fn retry_after(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<Duration>, StoreError> {
        let now = Utc::now();
        let window = Self::window_duration(policy);
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(key.to_string()).or_default();
        Self::prune(entries, now - window);

        if (entries.len() as u32) < policy.limit {
            return Ok(None);
        }
        let oldest = *entries.front().expect("window is full but empty");
        Ok(Some(
            (oldest + window - now).to_std().unwrap_or(Duration::ZERO),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: u32, window: Duration) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, window)
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_denies_with_retry_after() {
        let limiter = SlidingWindowRateLimiter::new();
        let p = policy(3, Duration::from_secs(1));

        for expected_remaining in [2, 1, 0] {
            match limiter.try_acquire("k", &p).await.unwrap() {
                RateLimitLease::Acquired { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected Acquired, got {:?}", other),
            }
        }

        match limiter.try_acquire("k", &p).await.unwrap() {
            RateLimitLease::RateLimited { retry_after, .. } => {
                // The first admission was a moment ago; close to a full window
                // remains.
                assert!(retry_after > Duration::from_millis(800));
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn window_slides() {
        let limiter = SlidingWindowRateLimiter::new();
        let p = policy(2, Duration::from_millis(150));

        assert!(limiter.try_acquire("k", &p).await.unwrap().acquired());
        assert!(limiter.try_acquire("k", &p).await.unwrap().acquired());
        assert!(!limiter.try_acquire("k", &p).await.unwrap().acquired());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(limiter.try_acquire("k", &p).await.unwrap().acquired());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = SlidingWindowRateLimiter::new();
        let p = policy(1, Duration::from_secs(5));

        assert!(limiter.try_acquire("a", &p).await.unwrap().acquired());
        assert!(!limiter.try_acquire("a", &p).await.unwrap().acquired());
        assert!(limiter.try_acquire("b", &p).await.unwrap().acquired());
    }

    #[tokio::test]
    async fn usage_and_retry_after_are_read_only() {
        let limiter = SlidingWindowRateLimiter::new();
        let p = policy(2, Duration::from_secs(5));

        assert_eq!(limiter.usage("k", &p).await.unwrap(), 0);
        assert_eq!(limiter.retry_after("k", &p).await.unwrap(), None);

        limiter.try_acquire("k", &p).await.unwrap();
        assert_eq!(limiter.usage("k", &p).await.unwrap(), 1);
        assert_eq!(limiter.retry_after("k", &p).await.unwrap(), None);

        limiter.try_acquire("k", &p).await.unwrap();
        assert_eq!(limiter.usage("k", &p).await.unwrap(), 2);
        assert!(limiter.retry_after("k", &p).await.unwrap().is_some());
        // Reads did not consume admissions.
        assert_eq!(limiter.usage("k", &p).await.unwrap(), 2);
    }
}
