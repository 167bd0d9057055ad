//! In-memory dead-letter store.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use conveyor_core::config::DeadLetterConfig;
use conveyor_core::{Broker, DeadLetter, DeadLetterStore, StoreError};

/// Bounded archive ordered by storage time; the oldest entries are evicted
/// past `max_messages`.
pub struct InMemoryDeadLetterStore {
    config: DeadLetterConfig,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    #[tracing::instrument(skip(self, letter), fields(task.id = %letter.message.id))]
    async fn store(&self, mut letter: DeadLetter) -> Result<(), StoreError> {
        if letter.expires_at.is_none() {
            letter.expires_at = self
                .config
                .retention
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| letter.stored_at + d);
        }
        let mut entries = self.entries.lock().await;
        tracing::warn!(
            task_name = %letter.message.task_name,
            reason = %letter.reason,
            "Message dead-lettered"
        );
        entries.push_back(letter);
        while entries.len() > self.config.max_messages {
            if let Some(evicted) = entries.pop_front() {
                tracing::warn!(
                    task_id = %evicted.message.id,
                    "Dead-letter store over capacity, evicted oldest entry"
                );
            }
        }
        Ok(())
    }

    async fn requeue(&self, task_id: &str, broker: &dyn Broker) -> Result<bool, StoreError> {
        let letter = {
            let mut entries = self.entries.lock().await;
            let position = entries.iter().position(|l| l.message.id == task_id);
            match position {
                Some(idx) => entries.remove(idx).expect("position just found"),
                None => return Ok(false),
            }
        };

        match broker.publish(letter.message.clone()).await {
            Ok(()) => {
                tracing::info!(task_id = %task_id, "Dead-lettered message requeued");
                Ok(true)
            }
            Err(e) => {
                // Put the entry back so the message is not lost.
                self.entries.lock().await.push_back(letter);
                Err(e)
            }
        }
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|l| l.expires_at.map(|e| e > now).unwrap_or(true));
        Ok((before - entries.len()) as u64)
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use conveyor_core::models::message::TaskMessage;

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            message: TaskMessage::builder("t").id(id).queue("q").build(),
            reason: "max retries exceeded".to_string(),
            stored_at: Utc::now(),
            expires_at: None,
        }
    }

    fn store_with_capacity(max: usize) -> InMemoryDeadLetterStore {
        InMemoryDeadLetterStore::new(DeadLetterConfig {
            max_messages: max,
            retention: None,
        })
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = store_with_capacity(2);
        store.store(letter("a")).await.unwrap();
        store.store(letter("b")).await.unwrap();
        store.store(letter("c")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 2);
        let listed = store.list(0, 10).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|l| l.message.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn requeue_republishes_and_removes() {
        let store = store_with_capacity(10);
        let broker = InMemoryBroker::new();
        store.store(letter("a")).await.unwrap();

        assert!(store.requeue("a", &broker).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(broker.pending_count("q").await, 1);

        assert!(!store.requeue("a", &broker).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_restores_entry_on_broker_failure() {
        let store = store_with_capacity(10);
        let broker = InMemoryBroker::new();
        broker.close().await;
        store.store(letter("a")).await.unwrap();

        let err = store.requeue("a", &broker).await;
        assert!(err.is_err());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_entries() {
        let store = store_with_capacity(10);
        let mut expired = letter("a");
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.store(expired).await.unwrap();
        store.store(letter("b")).await.unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let store = store_with_capacity(10);
        for id in ["a", "b", "c", "d"] {
            store.store(letter(id)).await.unwrap();
        }
        let page = store.list(1, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|l| l.message.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn purge_truncates() {
        let store = store_with_capacity(10);
        store.store(letter("a")).await.unwrap();
        store.purge().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
