//! Lifecycle signals emitted around task execution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TaskPreRun,
    TaskPostRun,
    TaskSuccess,
    TaskFailure,
    TaskRetry,
    TaskRevoked,
    TaskRejected,
    TaskRequeued,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSignal {
    pub kind: SignalKind,
    pub task_id: String,
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    pub worker: String,
    /// Event-specific fields (error message, retry delay, queue, ...).
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl TaskSignal {
    pub fn new(
        kind: SignalKind,
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            task_name: task_name.into(),
            timestamp: Utc::now(),
            worker: worker.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Envelope used by the queued-dispatch mode: signals are stored and
/// processed by a background subscriber instead of being dispatched inline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    pub id: Uuid,
    pub signal: TaskSignal,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl SignalMessage {
    pub fn new(signal: TaskSignal) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_round_trips() {
        let signal = TaskSignal::new(SignalKind::TaskRetry, "T1", "emails.send", "worker-1")
            .with_field("retry_after_ms", "900");
        let json = serde_json::to_string(&signal).unwrap();
        let back: TaskSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
        assert_eq!(back.fields["retry_after_ms"], "900");
    }
}
