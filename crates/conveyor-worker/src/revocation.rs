//! In-worker revocation manager.
//!
//! Keeps a map from running task IDs to linked cancellation tokens. A
//! background listener consumes the revocation store's event stream and
//! cancels the token of any locally-running task whose revocation asks for
//! termination (`terminate = true`) or an immediate signal.
//!
//! Races are tolerated by design: the executor checks `is_revoked` before
//! starting and holds a linked token while running, so a revocation landing
//! on either side of the start is honoured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

use conveyor_core::models::revocation::{RevocationEvent, RevocationOptions, RevocationSignal};
use conveyor_core::{RevocationStore, StoreError};

pub struct RevocationManager {
    store: Arc<dyn RevocationStore>,
    active: Mutex<HashMap<String, CancellationToken>>,
    self_ref: Mutex<Weak<RevocationManager>>,
}

impl RevocationManager {
    pub fn new(store: Arc<dyn RevocationStore>) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            active: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(Weak::new()),
        });
        *manager.self_ref.lock().unwrap() = Arc::downgrade(&manager);
        manager
    }

    /// Subscribe to the store's event stream and start cancelling local
    /// tokens on matching events. The listener stops when the manager is
    /// dropped or the subscription ends.
    pub async fn start(&self) -> Result<(), StoreError> {
        let mut events = self.store.subscribe().await?;
        let weak = self.self_ref.lock().unwrap().clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.handle_event(event);
            }
            tracing::debug!("Revocation event stream ended");
        });
        Ok(())
    }

    /// Pre-execution check against the shared store.
    pub async fn is_revoked(&self, task_id: &str) -> Result<bool, StoreError> {
        self.store.is_revoked(task_id).await
    }

    /// Revoke a task cluster-wide.
    pub async fn revoke(
        &self,
        task_id: &str,
        options: RevocationOptions,
    ) -> Result<(), StoreError> {
        self.store.revoke(task_id, options).await
    }

    /// Register a starting task; the returned token is a child of
    /// `parent` and is the one the handler must observe.
    pub fn register(&self, task_id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.active
            .lock()
            .unwrap()
            .insert(task_id.to_string(), token.clone());
        token
    }

    /// Scoped release; the executor calls this on every exit path.
    pub fn unregister(&self, task_id: &str) {
        self.active.lock().unwrap().remove(task_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn handle_event(&self, event: RevocationEvent) {
        let should_cancel =
            event.options.terminate || event.options.signal == RevocationSignal::Immediate;
        if !should_cancel {
            return;
        }
        let token = self.active.lock().unwrap().get(&event.task_id).cloned();
        if let Some(token) = token {
            tracing::info!(
                task_id = %event.task_id,
                terminate = event.options.terminate,
                "Cancelling locally-running revoked task"
            );
            // Cancel outside the map lock.
            token.cancel();
        }
    }
}
