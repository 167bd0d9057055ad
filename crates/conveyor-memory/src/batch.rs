//! In-memory batch store.
//!
//! Mark operations run under one lock, so concurrent marks on the same
//! batch serialize instead of losing updates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::models::batch::{Batch, BatchState};
use conveyor_core::{BatchStore, StoreError};

#[derive(Default)]
struct BatchStateMap {
    batches: HashMap<Uuid, Batch>,
    task_index: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct InMemoryBatchStore {
    state: Mutex<BatchStateMap>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mark(&self, task_id: &str, completed: bool) -> Result<Option<Batch>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(batch_id) = state.task_index.get(task_id).copied() else {
            return Ok(None);
        };
        let Some(batch) = state.batches.get_mut(&batch_id) else {
            return Ok(None);
        };
        if completed {
            batch.record_completed(task_id);
        } else {
            batch.record_failed(task_id);
        }
        if batch.state.is_terminal() {
            tracing::info!(
                batch_id = %batch.id,
                state = ?batch.state,
                completed = batch.completed_count(),
                failed = batch.failed_count(),
                "Batch reached terminal state"
            );
        }
        Ok(Some(batch.clone()))
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create(&self, batch: Batch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        for task_id in &batch.task_ids {
            state.task_index.insert(task_id.clone(), batch.id);
        }
        state.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }

    async fn mark_task_completed(&self, task_id: &str) -> Result<Option<Batch>, StoreError> {
        self.mark(task_id, true).await
    }

    async fn mark_task_failed(&self, task_id: &str) -> Result<Option<Batch>, StoreError> {
        self.mark(task_id, false).await
    }

    async fn update_state(&self, batch_id: Uuid, new_state: BatchState) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", batch_id)))?;
        batch.state = new_state;
        if new_state.is_terminal() && batch.completed_at.is_none() {
            batch.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(batch) = state.batches.remove(&batch_id) {
            for task_id in &batch.task_ids {
                state.task_index.remove(task_id);
            }
        }
        Ok(())
    }

    async fn batch_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.state.lock().await.task_index.get(task_id).copied())
    }
}
