//! In-memory result backend.
//!
//! Implements the full wait-for-result protocol: get before registering a
//! waiter, get again to close the race, then race the waiter against a
//! polling fallback, the timeout and the caller's cancellation token.
//! Waiters complete only on terminal results; intermediate states are
//! visible through `get_state`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use conveyor_core::models::result::{TaskResult, TaskState};
use conveyor_core::{ResultBackend, StoreError, WaitError};

struct StoredResult {
    result: TaskResult,
    expires_at: Option<DateTime<Utc>>,
}

pub struct InMemoryResultBackend {
    results: Mutex<HashMap<String, StoredResult>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<TaskResult>>>>,
    polling_interval: Duration,
}

impl Default for InMemoryResultBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self::with_polling_interval(Duration::from_millis(100))
    }

    pub fn with_polling_interval(polling_interval: Duration) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            polling_interval,
        }
    }

    /// Drop expired rows; returns the count removed. The cleanup loop in
    /// the worker runtime calls this periodically.
    pub async fn cleanup_expired(&self) -> u64 {
        let now = Utc::now();
        let mut results = self.results.lock().await;
        let before = results.len();
        results.retain(|_, stored| stored.expires_at.map(|e| e > now).unwrap_or(true));
        (before - results.len()) as u64
    }

    async fn get_terminal(&self, task_id: &str) -> Option<TaskResult> {
        let now = Utc::now();
        let mut results = self.results.lock().await;
        match results.get(task_id) {
            Some(stored) if stored.expires_at.map(|e| e <= now).unwrap_or(false) => {
                results.remove(task_id);
                None
            }
            Some(stored) if stored.result.state.is_terminal() => Some(stored.result.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    #[tracing::instrument(skip(self, result), fields(task.id = %result.task_id, state = %result.state))]
    async fn store_result(
        &self,
        result: &TaskResult,
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = expiry
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        self.results.lock().await.insert(
            result.task_id.clone(),
            StoredResult {
                result: result.clone(),
                expires_at,
            },
        );

        // Notify local waiters after the write is visible.
        if result.state.is_terminal() {
            let senders = self
                .waiters
                .lock()
                .await
                .remove(&result.task_id)
                .unwrap_or_default();
            for tx in senders {
                let _ = tx.send(result.clone());
            }
        }
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.get_terminal(task_id).await)
    }

    async fn wait_for_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) -> Result<TaskResult, WaitError> {
        // Local short-circuit.
        if let Some(result) = self.get_terminal(task_id).await {
            return Ok(result);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(tx);

        // Close the race between the first get and waiter registration.
        if let Some(result) = self.get_terminal(task_id).await {
            return Ok(result);
        }

        let poll = async {
            loop {
                tokio::time::sleep(self.polling_interval).await;
                if let Some(result) = self.get_terminal(task_id).await {
                    return result;
                }
            }
        };

        let timeout_sleep = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            notified = rx => match notified {
                Ok(result) => Ok(result),
                // The backend dropped the sender; fall back to one last get.
                Err(_) => self
                    .get_terminal(task_id)
                    .await
                    .ok_or_else(|| WaitError::Cancelled(task_id.to_string())),
            },
            result = poll => Ok(result),
            _ = timeout_sleep => Err(WaitError::Timeout(task_id.to_string())),
            _ = token.cancelled() => Err(WaitError::Cancelled(task_id.to_string())),
        }
    }

    async fn update_state(
        &self,
        task_id: &str,
        state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        let mut results = self.results.lock().await;
        let stored = results
            .entry(task_id.to_string())
            .or_insert_with(|| StoredResult {
                result: TaskResult::pending(task_id),
                expires_at: None,
            });
        stored.result.state = state;
        if let Some(metadata) = metadata {
            stored.result.metadata.extend(metadata);
        }
        Ok(())
    }

    async fn get_state(&self, task_id: &str) -> Result<Option<TaskState>, StoreError> {
        let now = Utc::now();
        let mut results = self.results.lock().await;
        match results.get(task_id) {
            Some(stored) if stored.expires_at.map(|e| e <= now).unwrap_or(false) => {
                results.remove(task_id);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.result.state)),
            None => Ok(None),
        }
    }
}
