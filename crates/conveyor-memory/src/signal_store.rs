//! In-memory signal store for the queued-dispatch mode.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::models::signal::SignalMessage;
use conveyor_core::{SignalStore, StoreError};

#[derive(Default)]
struct SignalQueue {
    pending: VecDeque<SignalMessage>,
    claimed: HashMap<Uuid, SignalMessage>,
}

#[derive(Default)]
pub struct InMemorySignalStore {
    state: Mutex<SignalQueue>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn enqueue(&self, message: SignalMessage) -> Result<(), StoreError> {
        self.state.lock().await.pending.push_back(message);
        Ok(())
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<SignalMessage>, StoreError> {
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(mut message) = state.pending.pop_front() else {
                break;
            };
            message.attempts += 1;
            state.claimed.insert(message.id, message.clone());
            claimed.push(message);
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .claimed
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("signal message {}", id)))
    }

    async fn reject(&self, id: Uuid, requeue: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let message = state
            .claimed
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("signal message {}", id)))?;
        if requeue {
            state.pending.push_back(message);
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.pending.len() as u64)
    }
}
