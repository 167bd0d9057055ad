//! Sliding-window rate-limit policy and lease types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum admissions per window.
    pub limit: u32,
    pub window: Duration,
    /// Override for the resource key; defaults to the task name when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            resource_key: None,
        }
    }

    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    /// Resource key this policy applies to for the given task name.
    pub fn key_for<'a>(&'a self, task_name: &'a str) -> &'a str {
        self.resource_key.as_deref().unwrap_or(task_name)
    }
}

/// One admission decision. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitLease {
    Acquired {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    RateLimited {
        retry_after: Duration,
        reset_at: DateTime<Utc>,
    },
}

impl RateLimitLease {
    pub fn acquired(&self) -> bool {
        matches!(self, RateLimitLease::Acquired { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitLease::Acquired { .. } => None,
            RateLimitLease::RateLimited { retry_after, .. } => Some(*retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_defaults_to_task_name() {
        let policy = RateLimitPolicy::new(10, Duration::from_secs(1));
        assert_eq!(policy.key_for("emails.send"), "emails.send");

        let policy = policy.with_resource_key("smtp");
        assert_eq!(policy.key_for("emails.send"), "smtp");
    }

    #[test]
    fn lease_accessors() {
        let lease = RateLimitLease::Acquired {
            remaining: 2,
            reset_at: Utc::now(),
        };
        assert!(lease.acquired());
        assert_eq!(lease.retry_after(), None);

        let lease = RateLimitLease::RateLimited {
            retry_after: Duration::from_millis(900),
            reset_at: Utc::now(),
        };
        assert!(!lease.acquired());
        assert_eq!(lease.retry_after(), Some(Duration::from_millis(900)));
    }
}
