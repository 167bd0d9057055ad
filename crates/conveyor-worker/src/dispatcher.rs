//! Delayed-message dispatcher.
//!
//! Periodically drains the delayed store and republishes due messages to
//! the broker. Between ticks it sleeps until the nearest delivery time; a
//! `Notify` wakes it early whenever something nearer is scheduled, so there
//! is never a busy loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

use conveyor_core::models::message::TaskMessage;
use conveyor_core::{Broker, DelayedMessageStore, StoreError};

pub struct DelayedDispatcher {
    store: Arc<dyn DelayedMessageStore>,
    broker: Arc<dyn Broker>,
    tick: Duration,
    wake: Arc<Notify>,
}

impl DelayedDispatcher {
    pub fn new(
        store: Arc<dyn DelayedMessageStore>,
        broker: Arc<dyn Broker>,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            tick,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Schedule a message, waking the dispatch loop early when the new
    /// entry is nearer than anything already pending.
    pub async fn schedule(
        &self,
        message: TaskMessage,
        delivery_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let previous_next = self.store.next_delivery_time().await?;
        self.store.add(message, delivery_time).await?;
        let moved_nearer = previous_next.map(|t| delivery_time < t).unwrap_or(true);
        if moved_nearer {
            self.wake.notify_waiters();
        }
        Ok(())
    }

    /// Cancel a scheduled message.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, StoreError> {
        self.store.remove(task_id).await
    }

    pub fn spawn(self: &Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run(shutdown_rx).await;
        });
        DispatcherHandle { shutdown_tx }
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "Delayed dispatcher started");
        loop {
            // Register wake interest before draining so a schedule() racing
            // the drain is not lost.
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if let Err(e) = self.drain_due().await {
                tracing::error!(error = %e, "Failed to drain due messages");
            }

            let sleep_for = match self.store.next_delivery_time().await {
                Ok(Some(next)) => {
                    let until = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    until.min(self.tick)
                }
                Ok(None) => self.tick,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read next delivery time");
                    self.tick
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = &mut wake => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!("Delayed dispatcher shutting down");
                    break;
                }
            }
        }
    }

    async fn drain_due(&self) -> Result<(), StoreError> {
        let due = self.store.get_due_messages(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = due.len(), "Republishing due messages");
        for message in due {
            let delivery_time = message.eta.unwrap_or_else(Utc::now);
            if let Err(e) = self.broker.publish(message.clone()).await {
                tracing::error!(
                    task_id = %message.id,
                    error = %e,
                    "Failed to republish due message, rescheduling"
                );
                // Keep the message; it becomes due again immediately.
                self.store.add(message, delivery_time).await?;
            }
        }
        Ok(())
    }
}

pub struct DispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl DispatcherHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
