//! Error types shared across the framework.
//!
//! [`TaskError`] is the control-flow boundary between handlers and the
//! executor: handlers express intent (retry, reject) by returning the
//! matching variant and the executor dispatches on it. [`StoreError`] covers
//! broker/store I/O with a transient classifier the resilience layer keys
//! off. [`WaitError`] is the tri-state outcome of a blocking result wait.

use std::time::Duration;

/// Raised by (or on behalf of) a task handler; classified by the executor
/// into a terminal [`TaskResult`](crate::models::result::TaskResult).
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The handler wants the task redelivered after an optional countdown.
    #[error("task requested retry")]
    Retry {
        countdown: Option<Duration>,
        cause: Option<String>,
    },

    /// Terminal, non-retriable refusal.
    #[error("task rejected: {reason}")]
    Reject { reason: String },

    /// The soft time limit elapsed while the handler was still running.
    #[error("soft time limit ({limit:?}) exceeded for task {task_id}")]
    SoftTimeLimitExceeded { task_id: String, limit: Duration },

    /// The hard time limit cancelled the handler.
    #[error("time limit ({limit:?}) exceeded for task {task_id}")]
    TimeLimitExceeded { task_id: String, limit: Duration },

    /// Cancellation observed by the handler; the executor decides whether it
    /// came from revocation or from the external caller.
    #[error("task cancelled")]
    Cancelled,

    /// Anything else a handler surfaces becomes a Failure outcome.
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

impl TaskError {
    pub fn retry(countdown: Option<Duration>, cause: Option<String>) -> Self {
        TaskError::Retry { countdown, cause }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        TaskError::Reject {
            reason: reason.into(),
        }
    }

    /// Stable label used in exception info and circuit-breaker filters.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Retry { .. } => "retry",
            TaskError::Reject { .. } => "reject",
            TaskError::SoftTimeLimitExceeded { .. } => "soft_time_limit_exceeded",
            TaskError::TimeLimitExceeded { .. } => "time_limit_exceeded",
            TaskError::Cancelled => "cancelled",
            TaskError::Failure(_) => "failure",
        }
    }
}

/// Broker and store I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Transient errors are retried under the resilience policy; everything
    /// else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Busy(_)
        )
    }
}

/// Outcome of `wait_for_result` when no result arrived.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for result of task {0}")]
    Timeout(String),

    #[error("wait for task {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Connection("refused".into()).is_transient());
        assert!(StoreError::Timeout("5s".into()).is_transient());
        assert!(StoreError::Busy("loading".into()).is_transient());
        assert!(!StoreError::NotFound("T1".into()).is_transient());
        assert!(!StoreError::Conflict("stale".into()).is_transient());
        assert!(!StoreError::Other(anyhow::anyhow!("x")).is_transient());
    }

    #[test]
    fn task_error_kinds_are_stable() {
        assert_eq!(TaskError::retry(None, None).kind(), "retry");
        assert_eq!(TaskError::reject("nope").kind(), "reject");
        assert_eq!(
            TaskError::Failure(anyhow::anyhow!("boom")).kind(),
            "failure"
        );
        assert_eq!(TaskError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn failure_preserves_source_chain() {
        let err: TaskError = anyhow::anyhow!("inner detail").into();
        assert!(err.to_string().contains("inner detail"));
    }
}
