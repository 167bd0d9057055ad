//! Configuration structures for brokers, stores and the worker.
//!
//! Each struct has sensible defaults and a `from_env` constructor reading
//! `CONVEYOR_*` variables. Validation happens at startup; configuration
//! errors are fatal to the path that needs them and never surface at
//! runtime.

use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(name, default_ms))
}

/// Result backend configuration (spec'd for the PostgreSQL adapter; the
/// in-memory backend honours `default_expiry` and `polling_interval`).
#[derive(Debug, Clone)]
pub struct ResultBackendConfig {
    pub connection_string: String,
    pub table_name: String,
    pub schema: Option<String>,
    pub default_expiry: Option<Duration>,
    /// Polling cadence of the wait-for-result fallback loop.
    pub polling_interval: Duration,
    /// Use push notifications (LISTEN/NOTIFY) in addition to polling.
    pub use_notify: bool,
    pub notify_channel_prefix: String,
    pub auto_create_tables: bool,
    /// When set, a background loop deletes expired rows at this interval.
    pub cleanup_interval: Option<Duration>,
    pub cleanup_batch_size: u32,
    pub command_timeout: Duration,
}

impl Default for ResultBackendConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            table_name: "task_results".to_string(),
            schema: None,
            default_expiry: Some(Duration::from_secs(24 * 3600)),
            polling_interval: Duration::from_millis(500),
            use_notify: true,
            notify_channel_prefix: "conveyor_result".to_string(),
            auto_create_tables: true,
            cleanup_interval: Some(Duration::from_secs(300)),
            cleanup_batch_size: 1000,
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl ResultBackendConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connection_string: env::var("CONVEYOR_BACKEND_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .unwrap_or_default(),
            table_name: env::var("CONVEYOR_BACKEND_TABLE")
                .unwrap_or(defaults.table_name),
            schema: env::var("CONVEYOR_BACKEND_SCHEMA").ok(),
            default_expiry: match env_parse::<i64>("CONVEYOR_RESULT_EXPIRY_SECS", 24 * 3600) {
                secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
                _ => None,
            },
            polling_interval: env_millis("CONVEYOR_RESULT_POLL_INTERVAL_MS", 500),
            use_notify: env_parse("CONVEYOR_RESULT_USE_NOTIFY", true),
            notify_channel_prefix: env::var("CONVEYOR_NOTIFY_CHANNEL_PREFIX")
                .unwrap_or(defaults.notify_channel_prefix),
            auto_create_tables: env_parse("CONVEYOR_AUTO_CREATE_TABLES", true),
            cleanup_interval: match env_parse::<i64>("CONVEYOR_RESULT_CLEANUP_INTERVAL_SECS", 300) {
                secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
                _ => None,
            },
            cleanup_batch_size: env_parse("CONVEYOR_RESULT_CLEANUP_BATCH_SIZE", 1000),
            command_timeout: env_secs("CONVEYOR_COMMAND_TIMEOUT_SECS", 30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Capacity; the oldest entries are evicted beyond it.
    pub max_messages: usize,
    /// Retention applied to stored entries, when set.
    pub retention: Option<Duration>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevocationConfig {
    /// Channel all revocation events are published on.
    pub channel: String,
    pub key_prefix: String,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            channel: "conveyor_revocations".to_string(),
            key_prefix: "conveyor:revoked".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DelayedStoreConfig {
    /// Key prefix for persisted entries. Part of the schema: changing it
    /// orphans previously persisted entries.
    pub key_prefix: String,
}

impl Default for DelayedStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "conveyor:delayed".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchStoreConfig {
    pub key_prefix: String,
}

impl Default for BatchStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "conveyor:batch".to_string(),
        }
    }
}

/// Resilience options used by stores whose backends can fail transiently.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaStoreConfig {
    pub key_prefix: String,
    /// TTL applied to sagas entering a terminal state.
    pub completed_ttl: Option<Duration>,
    pub resilience: ResilienceConfig,
}

impl Default for SagaStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "conveyor:saga".to_string(),
            completed_ttl: Some(Duration::from_secs(24 * 3600)),
            resilience: ResilienceConfig::default(),
        }
    }
}

/// Worker-level feature toggles and concurrency bound.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    /// Bounded number of in-flight executions.
    pub concurrency: usize,
    pub enable_revocation: bool,
    pub check_revocation_before_execution: bool,
    pub enable_rate_limiting: bool,
    /// Fixed requeue delay on rate-limit denial; falls back to the lease's
    /// retry-after when unset.
    pub rate_limit_requeue_delay: Option<Duration>,
    /// Cadence of the delayed-message dispatcher when nothing is due sooner.
    pub dispatcher_tick: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            concurrency: default_concurrency(),
            enable_revocation: true,
            check_revocation_before_execution: true,
            enable_rate_limiting: true,
            rate_limit_requeue_delay: None,
            dispatcher_tick: Duration::from_secs(1),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queues = env::var("CONVEYOR_QUEUES")
            .map(|v| {
                v.split(',')
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.queues);
        Self {
            queues,
            concurrency: env_parse("CONVEYOR_CONCURRENCY", defaults.concurrency),
            enable_revocation: env_parse("CONVEYOR_ENABLE_REVOCATION", true),
            check_revocation_before_execution: env_parse(
                "CONVEYOR_CHECK_REVOCATION_BEFORE_EXECUTION",
                true,
            ),
            enable_rate_limiting: env_parse("CONVEYOR_ENABLE_RATE_LIMITING", true),
            rate_limit_requeue_delay: match env_parse::<i64>(
                "CONVEYOR_RATE_LIMIT_REQUEUE_DELAY_MS",
                0,
            ) {
                ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
                _ => None,
            },
            dispatcher_tick: env_millis("CONVEYOR_DISPATCHER_TICK_MS", 1000),
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.queues.is_empty() {
            anyhow::bail!("worker must consume at least one queue");
        }
        if self.concurrency == 0 {
            anyhow::bail!("worker concurrency must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WorkerConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.concurrency >= 1);
        assert_eq!(cfg.queues, vec!["default".to_string()]);

        let backend = ResultBackendConfig::default();
        assert_eq!(backend.table_name, "task_results");
        assert!(backend.use_notify);
        assert!(backend.cleanup_interval.is_some());
    }

    #[test]
    fn empty_queues_fail_validation() {
        let cfg = WorkerConfig {
            queues: vec![],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let cfg = WorkerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
