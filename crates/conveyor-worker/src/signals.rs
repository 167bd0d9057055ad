//! Signal bus: lifecycle notifications around task execution.
//!
//! Immediate mode dispatches to in-process subscribers as signals are
//! published. Queued mode writes them to a [`SignalStore`] instead; a
//! background processor claims batches, dispatches them to the same
//! subscribers and acknowledges. Subscriber errors are logged and never
//! propagate back into the execution pipeline.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use conveyor_core::models::signal::{SignalMessage, TaskSignal};
use conveyor_core::SignalStore;

pub type SignalHandler = Arc<dyn Fn(&TaskSignal) -> Result<(), anyhow::Error> + Send + Sync>;

#[derive(Default)]
pub struct SignalBus {
    handlers: RwLock<Vec<SignalHandler>>,
    store: Option<Arc<dyn SignalStore>>,
}

impl SignalBus {
    /// Immediate dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued dispatch: signals go to `store` and are processed by the
    /// background processor (see [`SignalBus::spawn_processor`]).
    pub fn queued(store: Arc<dyn SignalStore>) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            store: Some(store),
        }
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&TaskSignal) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    ) {
        self.handlers.write().unwrap().push(Arc::new(handler));
    }

    pub async fn publish(&self, signal: TaskSignal) {
        match &self.store {
            Some(store) => {
                if let Err(e) = store.enqueue(SignalMessage::new(signal)).await {
                    tracing::warn!(error = %e, "Failed to enqueue signal, dropping");
                }
            }
            None => self.dispatch(&signal),
        }
    }

    fn dispatch(&self, signal: &TaskSignal) {
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            if let Err(e) = handler(signal) {
                tracing::warn!(
                    kind = ?signal.kind,
                    task_id = %signal.task_id,
                    error = %e,
                    "Signal handler failed; continuing"
                );
            }
        }
    }

    /// Start the queued-mode processor. No-op handle in immediate mode.
    pub fn spawn_processor(
        self: &Arc<Self>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> SignalProcessorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let Some(store) = self.store.clone() else {
            return SignalProcessorHandle { shutdown_tx };
        };
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                poll_interval_ms = poll_interval.as_millis() as u64,
                batch_size = batch_size,
                "Signal processor started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let claimed = match store.dequeue(batch_size).await {
                            Ok(claimed) => claimed,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to dequeue signals");
                                continue;
                            }
                        };
                        for message in claimed {
                            bus.dispatch(&message.signal);
                            if let Err(e) = store.acknowledge(message.id).await {
                                tracing::warn!(error = %e, signal_id = %message.id, "Failed to acknowledge signal");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Signal processor shutting down");
                        break;
                    }
                }
            }
        });

        SignalProcessorHandle { shutdown_tx }
    }
}

pub struct SignalProcessorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SignalProcessorHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::models::signal::SignalKind;
    use conveyor_memory::InMemorySignalStore;
    use std::sync::Mutex;

    fn signal(kind: SignalKind) -> TaskSignal {
        TaskSignal::new(kind, "T1", "emails.send", "worker-1")
    }

    #[tokio::test]
    async fn immediate_mode_dispatches_to_all_subscribers() {
        let bus = SignalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            bus.subscribe(move |s| {
                seen.lock().unwrap().push(s.kind);
                Ok(())
            });
        }
        bus.publish(signal(SignalKind::TaskSuccess)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_others() {
        let bus = SignalBus::new();
        let seen = Arc::new(Mutex::new(0));
        bus.subscribe(|_| Err(anyhow::anyhow!("observer bug")));
        let seen_clone = seen.clone();
        bus.subscribe(move |_| {
            *seen_clone.lock().unwrap() += 1;
            Ok(())
        });
        bus.publish(signal(SignalKind::TaskFailure)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn queued_mode_processes_via_store() {
        let store = Arc::new(InMemorySignalStore::new());
        let bus = Arc::new(SignalBus::queued(store.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(move |s| {
            seen_clone.lock().unwrap().push(s.kind);
            Ok(())
        });

        bus.publish(signal(SignalKind::TaskRetry)).await;
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert!(seen.lock().unwrap().is_empty());

        let handle = bus.spawn_processor(Duration::from_millis(10), 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[SignalKind::TaskRetry]);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        handle.shutdown().await;
    }
}
