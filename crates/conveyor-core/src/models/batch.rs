//! Batches: a group of task IDs with an aggregated completion state.
//!
//! The transition logic is pure and lives on [`Batch`] so that the in-memory
//! and Postgres stores apply identical semantics; the stores only provide
//! atomicity around it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed
                | BatchState::Failed
                | BatchState::PartiallyCompleted
                | BatchState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: BatchState,
    /// Ordered as submitted.
    pub task_ids: Vec<String>,
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(name: Option<String>, task_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            state: BatchState::Pending,
            task_ids,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_task_ids.len() + self.failed_task_ids.len() == self.task_ids.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_task_ids.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_task_ids.len()
    }

    /// Percentage of tasks that have landed in either completion set.
    pub fn progress(&self) -> u8 {
        if self.task_ids.is_empty() {
            return 100;
        }
        let landed = self.completed_task_ids.len() + self.failed_task_ids.len();
        ((landed * 100) / self.task_ids.len()) as u8
    }

    /// Record a task completion. Returns false when the task does not belong
    /// to this batch or already landed in either set.
    pub fn record_completed(&mut self, task_id: &str) -> bool {
        self.record(task_id, true)
    }

    /// Record a task failure. Same duplicate/foreign-ID rules as
    /// [`Batch::record_completed`].
    pub fn record_failed(&mut self, task_id: &str) -> bool {
        self.record(task_id, false)
    }

    fn record(&mut self, task_id: &str, completed: bool) -> bool {
        if !self.task_ids.iter().any(|t| t == task_id) {
            return false;
        }
        if self.completed_task_ids.iter().any(|t| t == task_id)
            || self.failed_task_ids.iter().any(|t| t == task_id)
        {
            return false;
        }

        if completed {
            self.completed_task_ids.push(task_id.to_string());
        } else {
            self.failed_task_ids.push(task_id.to_string());
        }

        if self.state == BatchState::Pending {
            self.state = BatchState::Processing;
        }

        if self.is_finished() {
            self.state = match (self.completed_task_ids.is_empty(), self.failed_task_ids.is_empty())
            {
                (false, true) => BatchState::Completed,
                (true, false) => BatchState::Failed,
                _ => BatchState::PartiallyCompleted,
            };
            self.completed_at = Some(Utc::now());
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: &[&str]) -> Batch {
        Batch::new(None, ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn pending_moves_to_processing_on_first_mark() {
        let mut b = batch(&["a", "b"]);
        assert!(b.record_completed("a"));
        assert_eq!(b.state, BatchState::Processing);
        assert!(b.completed_at.is_none());
    }

    #[test]
    fn all_completed_lands_in_completed() {
        let mut b = batch(&["a", "b"]);
        b.record_completed("a");
        b.record_completed("b");
        assert_eq!(b.state, BatchState::Completed);
        assert!(b.completed_at.is_some());
        assert_eq!(b.progress(), 100);
    }

    #[test]
    fn all_failed_lands_in_failed() {
        let mut b = batch(&["a", "b"]);
        b.record_failed("a");
        b.record_failed("b");
        assert_eq!(b.state, BatchState::Failed);
    }

    #[test]
    fn mixed_outcome_is_partially_completed() {
        let mut b = batch(&["a", "b", "c"]);
        b.record_completed("a");
        b.record_failed("b");
        assert!(!b.is_finished());
        b.record_completed("c");
        assert_eq!(b.state, BatchState::PartiallyCompleted);
        assert_eq!(b.completed_count(), 2);
        assert_eq!(b.failed_count(), 1);
        assert_eq!(b.progress(), 100);
        assert!(b.completed_at.is_some());
    }

    #[test]
    fn duplicate_and_foreign_marks_are_rejected() {
        let mut b = batch(&["a", "b"]);
        assert!(b.record_completed("a"));
        assert!(!b.record_completed("a"));
        assert!(!b.record_failed("a"));
        assert!(!b.record_completed("zzz"));
        assert_eq!(b.completed_count(), 1);
        assert_eq!(b.failed_count(), 0);
    }

    #[test]
    fn completion_sets_stay_disjoint_subsets() {
        let mut b = batch(&["a", "b", "c", "d"]);
        b.record_completed("a");
        b.record_failed("b");
        b.record_completed("c");

        for id in b.completed_task_ids.iter().chain(&b.failed_task_ids) {
            assert!(b.task_ids.contains(id));
        }
        assert!(!b
            .completed_task_ids
            .iter()
            .any(|id| b.failed_task_ids.contains(id)));
        assert_eq!(b.progress(), 75);
    }

    #[test]
    fn empty_batch_reports_full_progress() {
        let b = batch(&[]);
        assert_eq!(b.progress(), 100);
        assert!(b.is_finished());
    }
}
