//! In-memory delayed-message store.
//!
//! An ordered map keyed by (delivery time, sequence) plus a reverse index
//! from task ID to its key. Invariant: `by_task[id] = k` iff the message
//! with that ID sits in `by_time` under `k`. All mutations happen under one
//! lock, so concurrent drains never observe the same message twice.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use conveyor_core::models::message::TaskMessage;
use conveyor_core::{DelayedMessageStore, StoreError};

type TimeKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct DelayedState {
    by_time: BTreeMap<TimeKey, TaskMessage>,
    by_task: HashMap<String, TimeKey>,
    seq: u64,
}

#[derive(Default)]
pub struct InMemoryDelayedStore {
    state: Mutex<DelayedState>,
}

impl InMemoryDelayedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelayedMessageStore for InMemoryDelayedStore {
    #[tracing::instrument(skip(self, message), fields(task.id = %message.id))]
    async fn add(
        &self,
        message: TaskMessage,
        delivery_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(old_key) = state.by_task.remove(&message.id) {
            state.by_time.remove(&old_key);
        }
        let key = (delivery_time, state.seq);
        state.seq += 1;
        state.by_task.insert(message.id.clone(), key);
        state.by_time.insert(key, message);
        Ok(())
    }

    async fn get_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<TaskMessage>, StoreError> {
        let mut state = self.state.lock().await;
        let due_keys: Vec<TimeKey> = state
            .by_time
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(message) = state.by_time.remove(&key) {
                state.by_task.remove(&message.id);
                due.push(message);
            }
        }
        Ok(due)
    }

    async fn remove(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.by_task.remove(task_id) {
            Some(key) => {
                state.by_time.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.by_time.len())
    }

    async fn next_delivery_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.by_time.keys().next().map(|(t, _)| *t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(id: &str) -> TaskMessage {
        TaskMessage::builder("t").id(id).build()
    }

    #[tokio::test]
    async fn due_messages_are_drained_atomically() {
        let store = InMemoryDelayedStore::new();
        let now = Utc::now();
        store.add(message("a"), now - Duration::seconds(5)).await.unwrap();
        store.add(message("b"), now - Duration::seconds(1)).await.unwrap();
        store.add(message("c"), now + Duration::seconds(60)).await.unwrap();

        let due = store.get_due_messages(now).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, "a");
        assert_eq!(due[1].id, "b");

        // Drained entries are gone for subsequent callers.
        assert!(store.get_due_messages(now).await.unwrap().is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn re_adding_a_task_id_moves_its_delivery_time() {
        let store = InMemoryDelayedStore::new();
        let now = Utc::now();
        store.add(message("a"), now + Duration::seconds(60)).await.unwrap();
        store.add(message("a"), now + Duration::seconds(5)).await.unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 1);
        let next = store.next_delivery_time().await.unwrap().unwrap();
        assert!(next < now + Duration::seconds(10));
    }

    #[tokio::test]
    async fn remove_cancels_a_scheduled_message() {
        let store = InMemoryDelayedStore::new();
        let now = Utc::now();
        store.add(message("a"), now + Duration::seconds(60)).await.unwrap();
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(store.next_delivery_time().await.unwrap(), None);
    }

    #[tokio::test]
    async fn next_delivery_time_is_the_smallest_key() {
        let store = InMemoryDelayedStore::new();
        let now = Utc::now();
        store.add(message("a"), now + Duration::seconds(30)).await.unwrap();
        store.add(message("b"), now + Duration::seconds(10)).await.unwrap();
        let next = store.next_delivery_time().await.unwrap().unwrap();
        assert_eq!(next, now + Duration::seconds(10));
    }

    #[tokio::test]
    async fn same_timestamp_preserves_insertion_order() {
        let store = InMemoryDelayedStore::new();
        let when = Utc::now() - Duration::seconds(1);
        store.add(message("first"), when).await.unwrap();
        store.add(message("second"), when).await.unwrap();
        let due = store.get_due_messages(Utc::now()).await.unwrap();
        assert_eq!(due[0].id, "first");
        assert_eq!(due[1].id, "second");
    }
}
