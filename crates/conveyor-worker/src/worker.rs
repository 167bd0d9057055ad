//! Worker loop: pulls deliveries, gates them through the kill switch and
//! per-queue circuit breakers, and hands them to the executor under a
//! bounded concurrency limit.
//!
//! Outcome handling: terminal outcomes (and persisted retries) ack the
//! delivery; requeue outcomes go back through the broker or the delayed
//! store; internal errors before an outcome negative-ack with requeue.
//! Retry outcomes are republished through the delayed store with the retry
//! counter advanced unless the result says otherwise; a retry past the
//! message's budget dead-letters instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use conveyor_core::config::WorkerConfig;
use conveyor_core::models::message::BrokerDelivery;
use conveyor_core::models::result::{TaskResult, TaskState};
use conveyor_core::{Broker, DeadLetter, DeadLetterStore, DelayedMessageStore};
use conveyor_infra::{CircuitBreakerRegistry, KillSwitch};

use crate::executor::{ExecuteError, TaskExecutor};

/// Fallback delay for retry outcomes that carry no explicit countdown;
/// exponential in the retry count with a cap.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

pub(crate) fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(retry_count).min(MAX_RETRY_BACKOFF_SECS))
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    executor: Arc<TaskExecutor>,
    delayed: Arc<dyn DelayedMessageStore>,
    dead_letter: Option<Arc<dyn DeadLetterStore>>,
    kill_switch: Option<Arc<KillSwitch>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    config: WorkerConfig,
    cancellation: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        executor: Arc<TaskExecutor>,
        delayed: Arc<dyn DelayedMessageStore>,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
        kill_switch: Option<Arc<KillSwitch>>,
        breakers: Option<Arc<CircuitBreakerRegistry>>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            executor,
            delayed,
            dead_letter,
            kill_switch,
            breakers,
            config,
            cancellation: CancellationToken::new(),
        })
    }

    /// Start the loop; the returned handle stops it.
    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Arc::clone(self);
        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown_rx).await {
                tracing::error!(error = %e, "Worker loop exited with error");
            }
        });
        WorkerHandle {
            shutdown_tx,
            cancellation,
        }
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), anyhow::Error> {
        self.config.validate()?;
        let mut deliveries = self
            .broker
            .consume(&self.config.queues)
            .await
            .map_err(|e| anyhow::anyhow!("failed to start consuming: {}", e))?;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        tracing::info!(
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Worker shutting down");
                    self.cancellation.cancel();
                    break;
                }
                delivery = deliveries.recv() => {
                    match delivery {
                        Some(delivery) => self.gate_and_dispatch(delivery, &semaphore, &mut shutdown_rx).await,
                        None => {
                            tracing::warn!("Broker delivery stream ended");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
        Ok(())
    }

    async fn gate_and_dispatch(
        &self,
        delivery: BrokerDelivery,
        semaphore: &Arc<Semaphore>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) {
        // Process-wide back-pressure first.
        if let Some(kill_switch) = &self.kill_switch {
            tokio::select! {
                _ = kill_switch.wait_until_ready() => {}
                _ = shutdown_rx.recv() => {
                    self.cancellation.cancel();
                    let _ = self.broker.reject(&delivery, true).await;
                    return;
                }
            }
        }

        // Per-queue breaker: while open, push the message back and yield
        // for the breaker's estimated recovery time.
        if let Some(breakers) = &self.breakers {
            let breaker = breakers.for_queue(&delivery.queue);
            if !breaker.is_allowed() {
                tracing::debug!(queue = %delivery.queue, "Circuit open, requeueing delivery");
                if let Err(e) = self.broker.reject(&delivery, true).await {
                    tracing::error!(error = %e, "Failed to requeue while circuit open");
                }
                let pause = breaker
                    .estimated_retry_after()
                    .unwrap_or(Duration::from_millis(100))
                    .min(Duration::from_secs(1));
                tokio::time::sleep(pause).await;
                return;
            }
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let broker = self.broker.clone();
        let executor = self.executor.clone();
        let delayed = self.delayed.clone();
        let dead_letter = self.dead_letter.clone();
        let kill_switch = self.kill_switch.clone();
        let breaker = self.breakers.as_ref().map(|b| b.for_queue(&delivery.queue));
        let token = self.cancellation.child_token();

        tokio::spawn(async move {
            let _permit = permit;
            Self::process(
                broker,
                executor,
                delayed,
                dead_letter,
                kill_switch,
                breaker,
                delivery,
                token,
            )
            .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn process(
        broker: Arc<dyn Broker>,
        executor: Arc<TaskExecutor>,
        delayed: Arc<dyn DelayedMessageStore>,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
        kill_switch: Option<Arc<KillSwitch>>,
        breaker: Option<Arc<conveyor_infra::CircuitBreaker>>,
        delivery: BrokerDelivery,
        token: CancellationToken,
    ) {
        let message = &delivery.message;
        let now = Utc::now();

        // Expired messages are not executed.
        if message.is_expired(now) {
            tracing::info!(task_id = %message.id, "Message expired, dead-lettering");
            let _ = broker.reject(&delivery, false).await;
            if let Some(dead_letter) = &dead_letter {
                let _ = dead_letter
                    .store(DeadLetter {
                        message: message.clone(),
                        reason: "message expired".to_string(),
                        stored_at: now,
                        expires_at: None,
                    })
                    .await;
            }
            return;
        }

        // Future ETA: park in the delayed store and settle the delivery.
        if let Some(eta) = message.eta {
            if eta > now {
                match delayed.add(message.clone(), eta).await {
                    Ok(()) => {
                        let _ = broker.ack(&delivery).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, task_id = %message.id, "Failed to park ETA message");
                        let _ = broker.reject(&delivery, true).await;
                    }
                }
                return;
            }
        }

        let outcome = executor.execute(message, token).await;

        match outcome {
            Ok(result) => {
                Self::record_health(&kill_switch, &breaker, &result);
                Self::settle(broker, delayed, dead_letter, delivery, result).await;
            }
            Err(ExecuteError::UnknownTask(name)) => {
                tracing::error!(task_id = %message.id, task_name = %name, "Unknown task, dead-lettering");
                let _ = broker.reject(&delivery, false).await;
                if let Some(dead_letter) = &dead_letter {
                    let _ = dead_letter
                        .store(DeadLetter {
                            message: message.clone(),
                            reason: format!("no handler registered for task \"{}\"", name),
                            stored_at: Utc::now(),
                            expires_at: None,
                        })
                        .await;
                }
            }
            Err(ExecuteError::Cancelled(_)) => {
                // Shutdown while executing: give the message back.
                let _ = broker.reject(&delivery, true).await;
            }
            Err(ExecuteError::Store(e)) => {
                tracing::error!(task_id = %message.id, error = %e, "Store failure during execution, requeueing");
                let _ = broker.reject(&delivery, true).await;
            }
        }
    }

    fn record_health(
        kill_switch: &Option<Arc<KillSwitch>>,
        breaker: &Option<Arc<conveyor_infra::CircuitBreaker>>,
        result: &TaskResult,
    ) {
        let failed = result.state == TaskState::Failure;
        if let Some(kill_switch) = kill_switch {
            if failed {
                kill_switch.record_failure();
            } else {
                kill_switch.record_success();
            }
        }
        if let Some(breaker) = breaker {
            if failed {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
    }

    async fn settle(
        broker: Arc<dyn Broker>,
        delayed: Arc<dyn DelayedMessageStore>,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
        delivery: BrokerDelivery,
        result: TaskResult,
    ) {
        match result.state {
            TaskState::Requeued => {
                match result.requeue_delay {
                    Some(delay) => {
                        let when = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        if let Err(e) = delayed.add(delivery.message.clone(), when).await {
                            tracing::error!(error = %e, "Failed to schedule requeue, rejecting with requeue");
                            let _ = broker.reject(&delivery, true).await;
                            return;
                        }
                        let _ = broker.ack(&delivery).await;
                    }
                    None => {
                        let _ = broker.reject(&delivery, true).await;
                    }
                }
            }
            TaskState::Retry => {
                // The retry result is settled; redelivery happens through
                // the delayed store.
                let next = if result.do_not_increment_retries {
                    delivery.message.clone()
                } else {
                    delivery.message.with_incremented_retries()
                };

                if !result.do_not_increment_retries && next.retries_exhausted() {
                    tracing::warn!(
                        task_id = %next.id,
                        retry_count = next.retry_count,
                        "Retry budget exhausted, dead-lettering"
                    );
                    let _ = broker.ack(&delivery).await;
                    if let Some(dead_letter) = &dead_letter {
                        let _ = dead_letter
                            .store(DeadLetter {
                                message: next,
                                reason: "max retries exceeded".to_string(),
                                stored_at: Utc::now(),
                                expires_at: None,
                            })
                            .await;
                    }
                    return;
                }

                let delay = result
                    .retry_after
                    .unwrap_or_else(|| retry_backoff(delivery.message.retry_count));
                let when = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                match delayed.add(next, when).await {
                    Ok(()) => {
                        let _ = broker.ack(&delivery).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to schedule retry, rejecting with requeue");
                        let _ = broker.reject(&delivery, true).await;
                    }
                }
            }
            // Success, Failure, Revoked, Rejected and anything else already
            // persisted: the delivery is done.
            _ => {
                if let Err(e) = broker.ack(&delivery).await {
                    tracing::error!(error = %e, "Failed to ack delivery");
                }
            }
        }
    }
}

pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    cancellation: CancellationToken,
}

impl WorkerHandle {
    /// Signal the loop to stop claiming new deliveries and cancel in-flight
    /// executions cooperatively. Returns immediately; in-flight handlers
    /// finish at their next suspension point.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        self.cancellation.cancel();
    }
}
