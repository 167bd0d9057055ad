//! Distributed cancellation entries and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a revocation should be acted on by a worker that is currently
/// executing the task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevocationSignal {
    /// Cooperative: the task observes its cancellation token when it next
    /// checks it.
    #[default]
    Graceful,
    /// Cancel the token immediately; the task stops at its next suspension
    /// point. There is no forced thread abort.
    Immediate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationOptions {
    /// Cancel the task even if it is already running.
    pub terminate: bool,
    pub signal: RevocationSignal,
    /// How long the revocation entry stays active. `None` means until
    /// cleanup removes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationEntry {
    pub task_id: String,
    pub options: RevocationOptions,
    pub revoked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RevocationEntry {
    pub fn new(task_id: impl Into<String>, options: RevocationOptions) -> Self {
        let revoked_at = Utc::now();
        let expires_at = options
            .expiry
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| revoked_at + d);
        Self {
            task_id: task_id.into(),
            options,
            revoked_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// Published on the revocation channel whenever a task is revoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevocationEvent {
    pub task_id: String,
    pub options: RevocationOptions,
    pub timestamp: DateTime<Utc>,
}

impl From<&RevocationEntry> for RevocationEvent {
    fn from(entry: &RevocationEntry) -> Self {
        Self {
            task_id: entry.task_id.clone(),
            options: entry.options.clone(),
            timestamp: entry.revoked_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn entry_without_expiry_never_expires() {
        let entry = RevocationEntry::new("T1", RevocationOptions::default());
        assert!(!entry.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn entry_with_expiry_expires() {
        let entry = RevocationEntry::new(
            "T1",
            RevocationOptions {
                expiry: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        assert!(!entry.is_expired(Utc::now()));
        assert!(entry.is_expired(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn event_round_trips_as_json() {
        let entry = RevocationEntry::new(
            "T1",
            RevocationOptions {
                terminate: true,
                signal: RevocationSignal::Immediate,
                expiry: None,
            },
        );
        let event = RevocationEvent::from(&entry);
        let json = serde_json::to_string(&event).unwrap();
        let back: RevocationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
