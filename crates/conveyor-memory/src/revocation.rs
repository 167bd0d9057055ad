//! In-memory revocation store.
//!
//! Entries live in a map; subscribers each get their own unbounded channel
//! so a slow consumer never back-pressures a publisher. Expired entries are
//! purged lazily on read.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use conveyor_core::models::revocation::{RevocationEntry, RevocationEvent, RevocationOptions};
use conveyor_core::{RevocationStore, StoreError};

#[derive(Default)]
pub struct InMemoryRevocationStore {
    entries: Mutex<HashMap<String, RevocationEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RevocationEvent>>>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    #[tracing::instrument(skip(self, options))]
    async fn revoke(&self, task_id: &str, options: RevocationOptions) -> Result<(), StoreError> {
        let entry = RevocationEntry::new(task_id, options);
        let event = RevocationEvent::from(&entry);
        self.entries
            .lock()
            .await
            .insert(task_id.to_string(), entry);

        // Publish after the entry is visible; drop subscribers whose
        // receiver is gone.
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::debug!(task_id = %task_id, subscribers = subscribers.len(), "Task revoked");
        Ok(())
    }

    async fn is_revoked(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(task_id) {
            Some(entry) if entry.is_expired(Utc::now()) => {
                entries.remove(task_id);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn revoked_task_ids(&self) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries.keys().cloned().collect())
    }

    async fn cleanup(&self, max_age: std::time::Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.revoked_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RevocationEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::models::revocation::RevocationSignal;
    use std::time::Duration;

    #[tokio::test]
    async fn revoke_then_is_revoked() {
        let store = InMemoryRevocationStore::new();
        assert!(!store.is_revoked("T1").await.unwrap());
        store.revoke("T1", RevocationOptions::default()).await.unwrap();
        assert!(store.is_revoked("T1").await.unwrap());
        assert_eq!(store.revoked_task_ids().await.unwrap(), vec!["T1".to_string()]);
    }

    #[tokio::test]
    async fn expired_entries_are_lazily_purged() {
        let store = InMemoryRevocationStore::new();
        store
            .revoke(
                "T1",
                RevocationOptions {
                    expiry: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.is_revoked("T1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.is_revoked("T1").await.unwrap());
        assert!(store.revoked_task_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let store = InMemoryRevocationStore::new();
        let mut rx = store.subscribe().await.unwrap();
        store
            .revoke(
                "T1",
                RevocationOptions {
                    terminate: true,
                    signal: RevocationSignal::Immediate,
                    expiry: None,
                },
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, "T1");
        assert!(event.options.terminate);
        assert_eq!(event.options.signal, RevocationSignal::Immediate);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_publish() {
        let store = InMemoryRevocationStore::new();
        let rx = store.subscribe().await.unwrap();
        drop(rx);
        store.revoke("T1", RevocationOptions::default()).await.unwrap();
        assert!(store.is_revoked("T1").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_old_entries() {
        let store = InMemoryRevocationStore::new();
        store.revoke("T1", RevocationOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.revoke("T2", RevocationOptions::default()).await.unwrap();

        let removed = store.cleanup(Duration::from_millis(20)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.is_revoked("T1").await.unwrap());
        assert!(store.is_revoked("T2").await.unwrap());
    }
}
