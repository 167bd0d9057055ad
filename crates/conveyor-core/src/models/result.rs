//! Task outcomes as stored by the result backend.

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
    Rejected,
    Requeued,
}

impl TaskState {
    /// Terminal states never transition again; non-terminal results may be
    /// overwritten by a later write for the same task ID.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked | TaskState::Rejected
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Started => write!(f, "started"),
            TaskState::Success => write!(f, "success"),
            TaskState::Failure => write!(f, "failure"),
            TaskState::Retry => write!(f, "retry"),
            TaskState::Revoked => write!(f, "revoked"),
            TaskState::Rejected => write!(f, "rejected"),
            TaskState::Requeued => write!(f, "requeued"),
        }
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "started" => Ok(TaskState::Started),
            "success" => Ok(TaskState::Success),
            "failure" => Ok(TaskState::Failure),
            "retry" => Ok(TaskState::Retry),
            "revoked" => Ok(TaskState::Revoked),
            "rejected" => Ok(TaskState::Rejected),
            "requeued" => Ok(TaskState::Requeued),
            _ => Err(anyhow::anyhow!("Invalid task state: {}", s)),
        }
    }
}

/// Serialized view of the error that produced a Failure or Retry outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn from_task_error(err: &TaskError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub state: TaskState,
    /// Serialized handler output; present only on Success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// How long the caller should wait before redelivering (Retry only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    /// Set on rate-limit back-offs so they never exhaust the retry budget.
    #[serde(default)]
    pub do_not_increment_retries: bool,
    /// Revoked only: distinguishes "never started" (false) from "cancelled
    /// mid-flight" (true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<bool>,
    /// Requeued only: delay requested by a filter before redelivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_delay: Option<Duration>,
}

impl TaskResult {
    fn base(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            result: None,
            content_type: None,
            exception: None,
            completed_at: None,
            duration_ms: None,
            retries: 0,
            worker: None,
            metadata: HashMap::new(),
            retry_after: None,
            do_not_increment_retries: false,
            terminated: None,
            requeue_delay: None,
        }
    }

    /// Placeholder row for a task with no outcome yet; used by state
    /// updates that arrive before any result is stored.
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self::base(task_id, TaskState::Pending)
    }

    pub fn success(
        task_id: impl Into<String>,
        result: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        let mut r = Self::base(task_id, TaskState::Success);
        r.result = Some(result);
        r.content_type = Some(content_type.into());
        r.completed_at = Some(Utc::now());
        r
    }

    pub fn failure(task_id: impl Into<String>, exception: ExceptionInfo) -> Self {
        let mut r = Self::base(task_id, TaskState::Failure);
        r.exception = Some(exception);
        r.completed_at = Some(Utc::now());
        r
    }

    pub fn retry(
        task_id: impl Into<String>,
        retry_after: Option<Duration>,
        exception: Option<ExceptionInfo>,
    ) -> Self {
        let mut r = Self::base(task_id, TaskState::Retry);
        r.retry_after = retry_after;
        r.exception = exception;
        r
    }

    pub fn rejected(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut r = Self::base(task_id, TaskState::Rejected);
        r.exception = Some(ExceptionInfo::new("reject", reason));
        r.completed_at = Some(Utc::now());
        r
    }

    pub fn revoked(task_id: impl Into<String>, terminated: bool) -> Self {
        let mut r = Self::base(task_id, TaskState::Revoked);
        r.terminated = Some(terminated);
        r.completed_at = Some(Utc::now());
        r
    }

    pub fn requeued(task_id: impl Into<String>, delay: Option<Duration>) -> Self {
        let mut r = Self::base(task_id, TaskState::Requeued);
        r.requeue_delay = delay;
        r
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as i64);
        self
    }

    /// Deserialize the stored Success payload.
    pub fn result_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
        assert!(TaskState::Revoked.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Started.is_terminal());
        assert!(!TaskState::Retry.is_terminal());
        assert!(!TaskState::Requeued.is_terminal());
    }

    #[test]
    fn state_round_trip() {
        for state in [
            TaskState::Pending,
            TaskState::Started,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Retry,
            TaskState::Revoked,
            TaskState::Rejected,
            TaskState::Requeued,
        ] {
            assert_eq!(state.to_string().parse::<TaskState>().unwrap(), state);
        }
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn success_result_carries_payload() {
        let r = TaskResult::success("T1", b"{\"v\":42}".to_vec(), "application/json");
        assert_eq!(r.state, TaskState::Success);
        assert!(r.completed_at.is_some());

        #[derive(Deserialize)]
        struct Out {
            v: u32,
        }
        assert_eq!(r.result_as::<Out>().unwrap().v, 42);
    }

    #[test]
    fn revoked_result_records_terminated_flag() {
        let r = TaskResult::revoked("T1", false);
        assert_eq!(r.state, TaskState::Revoked);
        assert_eq!(r.terminated, Some(false));
    }

    #[test]
    fn retry_result_serializes_and_back() {
        let r = TaskResult::retry("T1", Some(Duration::from_millis(900)), None).with_retries(2);
        let json = serde_json::to_string(&r).unwrap();
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.retry_after, Some(Duration::from_millis(900)));
    }
}
