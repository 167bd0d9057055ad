//! Contracts between the worker pipeline and its pluggable collaborators.
//!
//! Implementations: `conveyor-memory` (in-process, used by tests and
//! single-node deployments) and `conveyor-db` (PostgreSQL). The worker and
//! executor only ever see these traits.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{StoreError, WaitError};
use crate::models::batch::{Batch, BatchState};
use crate::models::message::{BrokerDelivery, TaskMessage};
use crate::models::rate_limit::{RateLimitLease, RateLimitPolicy};
use crate::models::result::{TaskResult, TaskState};
use crate::models::revocation::{RevocationEvent, RevocationOptions};
use crate::models::saga::{Saga, SagaState, SagaStepState, StepUpdate};
use crate::models::signal::SignalMessage;

/// Message transport. Ordering within a queue is the broker's own; across
/// queues it is undefined.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, message: TaskMessage) -> Result<(), StoreError>;

    /// Start consuming the given queues. Deliveries arrive on the returned
    /// channel until the broker shuts down or the receiver is dropped.
    async fn consume(
        &self,
        queues: &[String],
    ) -> Result<mpsc::Receiver<BrokerDelivery>, StoreError>;

    /// Acknowledge a delivery. Each delivery must be acked or rejected
    /// exactly once.
    async fn ack(&self, delivery: &BrokerDelivery) -> Result<(), StoreError>;

    async fn reject(&self, delivery: &BrokerDelivery, requeue: bool) -> Result<(), StoreError>;

    async fn is_healthy(&self) -> bool;
}

/// Durable store of task outcomes with blocking wait.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn store_result(
        &self,
        result: &TaskResult,
        expiry: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// `None` until a terminal result exists for the task; intermediate
    /// states are visible through [`ResultBackend::get_state`].
    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError>;

    /// Block until a result is stored for `task_id`, the timeout elapses, or
    /// `token` fires. Combines push notification with a polling fallback;
    /// the first signal wins.
    async fn wait_for_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) -> Result<TaskResult, WaitError>;

    async fn update_state(
        &self,
        task_id: &str,
        state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StoreError>;

    async fn get_state(&self, task_id: &str) -> Result<Option<TaskState>, StoreError>;
}

/// Time-ordered set of messages due in the future.
#[async_trait]
pub trait DelayedMessageStore: Send + Sync {
    /// Schedule a message; an existing entry for the same task ID is
    /// replaced (the new time wins).
    async fn add(
        &self,
        message: TaskMessage,
        delivery_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove and return every message due at or before `now`. Atomic:
    /// concurrent callers never observe the same message twice.
    async fn get_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>, StoreError>;

    /// Cancel a scheduled message. Returns true when an entry was removed.
    async fn remove(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn pending_count(&self) -> Result<usize, StoreError>;

    /// Smallest delivery time currently scheduled.
    async fn next_delivery_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Shared revoked-task-ID set with real-time notifications.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn revoke(&self, task_id: &str, options: RevocationOptions) -> Result<(), StoreError>;

    /// True iff an entry exists and has not expired. Expired entries are
    /// lazily purged.
    async fn is_revoked(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn revoked_task_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Remove entries older than `max_age`; returns the count removed.
    async fn cleanup(&self, max_age: Duration) -> Result<u64, StoreError>;

    /// Stream of revocation events. Each subscription gets its own listener;
    /// slow consumers never back-pressure publishers.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RevocationEvent>, StoreError>;
}

/// A terminally-failed message parked in the dead-letter store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub reason: String,
    pub stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bounded archive of terminally-failed messages.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert; evicts the oldest entries beyond capacity.
    async fn store(&self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Remove the entry and republish its original message. On broker
    /// failure the entry is re-inserted and the error surfaces. Returns
    /// false when no entry exists for the task ID.
    async fn requeue(&self, task_id: &str, broker: &dyn Broker) -> Result<bool, StoreError>;

    /// Page through entries, newest first.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    async fn cleanup_expired(&self) -> Result<u64, StoreError>;

    async fn purge(&self) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// Batches of task IDs with aggregated completion state.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create(&self, batch: Batch) -> Result<(), StoreError>;

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError>;

    /// Record a completion for the batch owning `task_id`. Returns the
    /// updated batch, or `None` when the task belongs to no batch.
    async fn mark_task_completed(&self, task_id: &str) -> Result<Option<Batch>, StoreError>;

    async fn mark_task_failed(&self, task_id: &str) -> Result<Option<Batch>, StoreError>;

    async fn update_state(&self, batch_id: Uuid, state: BatchState) -> Result<(), StoreError>;

    async fn delete(&self, batch_id: Uuid) -> Result<(), StoreError>;

    async fn batch_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError>;
}

/// Saga persistence. Every mutation is atomic with respect to readers
/// across process boundaries; concurrent workers may update different steps
/// of the same saga.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn create(&self, saga: Saga) -> Result<(), StoreError>;

    async fn get(&self, saga_id: Uuid) -> Result<Option<Saga>, StoreError>;

    async fn update_state(
        &self,
        saga_id: Uuid,
        new_state: SagaState,
        failure_reason: Option<String>,
    ) -> Result<(), StoreError>;

    async fn update_step_state(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        new_state: SagaStepState,
        update: StepUpdate,
    ) -> Result<(), StoreError>;

    /// `current_step_index += 1`; completing the saga when the index
    /// reaches the step count.
    async fn advance_step(&self, saga_id: Uuid) -> Result<(), StoreError>;

    async fn mark_step_compensated(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        success: bool,
        compensate_task_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, saga_id: Uuid) -> Result<(), StoreError>;

    async fn get_saga_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError>;

    /// Saga IDs in `state`, ordered by creation time, up to `limit`.
    async fn get_by_state(&self, state: SagaState, limit: usize)
        -> Result<Vec<Saga>, StoreError>;
}

/// Sliding-window admission control per resource key.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitLease, StoreError>;

    /// Current admission count within the window. Read-only.
    async fn usage(&self, key: &str, policy: &RateLimitPolicy) -> Result<u32, StoreError>;

    /// How long until the next admission would succeed; `None` when one
    /// would succeed now. Read-only.
    async fn retry_after(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<Duration>, StoreError>;
}

/// Store behind the queued signal-dispatch mode.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn enqueue(&self, message: SignalMessage) -> Result<(), StoreError>;

    /// Claim up to `limit` messages. Claimed messages are invisible to other
    /// consumers until acknowledged or rejected.
    async fn dequeue(&self, limit: usize) -> Result<Vec<SignalMessage>, StoreError>;

    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError>;

    async fn reject(&self, id: Uuid, requeue: bool) -> Result<(), StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;
}
