//! Sagas: multi-step workflows with compensation.
//!
//! Like [`Batch`](super::batch::Batch), the state machine is pure and lives
//! here; stores wrap these methods in whatever atomicity their backend
//! offers (a single locked section in memory, a transaction on Postgres).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Created,
    Executing,
    Compensating,
    Completed,
    Failed,
    Compensated,
    CompensationFailed,
    Cancelled,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed
                | SagaState::Failed
                | SagaState::Compensated
                | SagaState::CompensationFailed
                | SagaState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SagaStepState {
    Pending,
    Executing,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaStep {
    pub id: Uuid,
    pub name: String,
    /// Position within the saga; steps execute in ascending order.
    pub order: u32,
    /// Task name invoked to execute this step.
    pub execute_task: String,
    /// Task name invoked to undo this step, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_task: Option<String>,
    pub state: SagaStepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, order: u32, execute_task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            order,
            execute_task: execute_task.into(),
            compensate_task: None,
            state: SagaStepState::Pending,
            execute_task_id: None,
            compensate_task_id: None,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_compensation(mut self, compensate_task: impl Into<String>) -> Self {
        self.compensate_task = Some(compensate_task.into());
        self
    }

    /// True while this step would still need its compensation run if the
    /// saga started compensating.
    fn awaits_compensation(&self) -> bool {
        self.compensate_task.is_some()
            && matches!(
                self.state,
                SagaStepState::Completed | SagaStepState::Compensating
            )
    }
}

/// Fields a step update may carry alongside the new state.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub execute_task_id: Option<String>,
    pub compensate_task_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Saga {
    pub id: Uuid,
    pub name: String,
    pub state: SagaState,
    pub current_step_index: u32,
    pub steps: Vec<SagaStep>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Saga {
    pub fn new(name: impl Into<String>, mut steps: Vec<SagaStep>) -> Self {
        steps.sort_by_key(|s| s.order);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: SagaState::Created,
            current_step_index: 0,
            steps,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn current_step(&self) -> Option<&SagaStep> {
        self.steps.get(self.current_step_index as usize)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Move to `new_state`, stamping `completed_at` on terminal transitions.
    /// No-op when already in `new_state`. Returns the previous state.
    pub fn transition(&mut self, new_state: SagaState, failure_reason: Option<String>) -> SagaState {
        let old = self.state;
        if old == new_state {
            return old;
        }
        self.state = new_state;
        if let Some(reason) = failure_reason {
            self.failure_reason = Some(reason);
        }
        if new_state.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        old
    }

    /// Apply a step-state update and the saga-level auto-transition rule:
    /// a step failing while an earlier completed step has a compensate task
    /// moves the saga to Compensating, otherwise to Failed.
    ///
    /// Returns the saga states (old, new) so callers can maintain their
    /// per-state index.
    pub fn apply_step_update(
        &mut self,
        step_id: Uuid,
        new_step_state: SagaStepState,
        update: StepUpdate,
    ) -> Result<(SagaState, SagaState), SagaTransitionError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(SagaTransitionError::UnknownStep(step_id))?;

        step.state = new_step_state;
        if let Some(task_id) = update.execute_task_id {
            step.execute_task_id = Some(task_id);
        }
        if let Some(task_id) = update.compensate_task_id {
            step.compensate_task_id = Some(task_id);
        }
        if let Some(result) = update.result {
            step.result = Some(result);
        }
        if let Some(error) = update.error.clone() {
            step.error = Some(error);
        }
        match new_step_state {
            SagaStepState::Executing | SagaStepState::Compensating => {
                if step.started_at.is_none() {
                    step.started_at = Some(Utc::now());
                }
            }
            SagaStepState::Completed
            | SagaStepState::Failed
            | SagaStepState::Compensated
            | SagaStepState::CompensationFailed => {
                step.completed_at = Some(Utc::now());
            }
            SagaStepState::Pending => {}
        }

        let failed_order = step.order;
        let old = self.state;
        if new_step_state == SagaStepState::Failed {
            let has_compensatable_predecessor = self.steps.iter().any(|s| {
                s.order < failed_order
                    && s.state == SagaStepState::Completed
                    && s.compensate_task.is_some()
            });
            let target = if has_compensatable_predecessor {
                SagaState::Compensating
            } else {
                SagaState::Failed
            };
            self.transition(target, update.error);
        } else if new_step_state == SagaStepState::Executing && self.state == SagaState::Created {
            self.transition(SagaState::Executing, None);
        }

        Ok((old, self.state))
    }

    /// Advance to the next step; the saga completes when the index reaches
    /// the step count. Returns (old, new) saga states.
    pub fn advance_step(&mut self) -> (SagaState, SagaState) {
        let old = self.state;
        self.current_step_index += 1;
        if self.current_step_index as usize >= self.steps.len() {
            self.transition(SagaState::Completed, None);
        }
        (old, self.state)
    }

    /// Record the outcome of one compensation and, when nothing is left to
    /// compensate, settle the saga terminal state. Steps whose execution
    /// failed are excluded: they have nothing external to undo.
    pub fn apply_compensation(
        &mut self,
        step_id: Uuid,
        success: bool,
        compensate_task_id: Option<String>,
        error: Option<String>,
    ) -> Result<(SagaState, SagaState), SagaTransitionError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(SagaTransitionError::UnknownStep(step_id))?;

        step.state = if success {
            SagaStepState::Compensated
        } else {
            SagaStepState::CompensationFailed
        };
        if let Some(task_id) = compensate_task_id {
            step.compensate_task_id = Some(task_id);
        }
        if let Some(error) = error {
            step.error = Some(error);
        }
        step.completed_at = Some(Utc::now());

        let old = self.state;
        let remaining = self.steps.iter().filter(|s| s.awaits_compensation()).count();
        if remaining == 0 {
            let any_failed = self
                .steps
                .iter()
                .any(|s| s.state == SagaStepState::CompensationFailed);
            let target = if any_failed {
                SagaState::CompensationFailed
            } else {
                SagaState::Compensated
            };
            self.transition(target, None);
        }
        Ok((old, self.state))
    }

    /// All task IDs (execute and compensate) referenced by this saga's
    /// steps; stores index these back to the saga ID.
    pub fn referenced_task_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| {
                s.execute_task_id
                    .iter()
                    .chain(s.compensate_task_id.iter())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SagaTransitionError {
    #[error("saga has no step with id {0}")]
    UnknownStep(Uuid),
}
