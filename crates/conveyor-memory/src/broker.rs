//! In-process broker.
//!
//! Each queue is a priority-ordered buffer (priority 9 first, FIFO within a
//! priority). A dispatch task per consumer pops messages and pushes them
//! through a capacity-1 channel, so priority ordering holds right up to the
//! moment the consumer takes a message. Unacked deliveries are tracked by
//! delivery tag; rejecting with requeue puts the message back at the end of
//! its priority class.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use conveyor_core::models::message::{BrokerDelivery, TaskMessage};
use conveyor_core::{Broker, StoreError};

/// Ordering key: lower sorts first, so priority is stored inverted.
type ReadyKey = (u8, u64);

fn ready_key(priority: u8, seq: u64) -> ReadyKey {
    (9u8.saturating_sub(priority.min(9)), seq)
}

struct BrokerState {
    queues: HashMap<String, BTreeMap<ReadyKey, TaskMessage>>,
    unacked: HashMap<String, (TaskMessage, String)>,
    seq: u64,
    closed: bool,
}

pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                unacked: HashMap::new(),
                seq: 0,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Messages currently buffered (not yet delivered) on a queue.
    pub async fn pending_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Deliveries pulled but not yet acked or rejected.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Stop delivering; consumers see their channels close.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    async fn enqueue(&self, message: TaskMessage) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let seq = state.seq;
        state.seq += 1;
        let key = ready_key(message.priority, seq);
        state
            .queues
            .entry(message.queue.clone())
            .or_default()
            .insert(key, message);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    fn pop_ready(state: &mut BrokerState, queues: &[String]) -> Option<BrokerDelivery> {
        for queue in queues {
            if let Some(buffer) = state.queues.get_mut(queue) {
                if let Some((&key, _)) = buffer.iter().next() {
                    let message = buffer.remove(&key).expect("key just observed");
                    let delivery_tag = Uuid::new_v4().to_string();
                    state
                        .unacked
                        .insert(delivery_tag.clone(), (message.clone(), queue.clone()));
                    return Some(BrokerDelivery {
                        message,
                        delivery_tag,
                        queue: queue.clone(),
                    });
                }
            }
        }
        None
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    #[tracing::instrument(skip(self, message), fields(task.id = %message.id, queue = %message.queue))]
    async fn publish(&self, message: TaskMessage) -> Result<(), StoreError> {
        tracing::debug!(task_name = %message.task_name, priority = message.priority, "Message published");
        self.enqueue(message).await
    }

    async fn consume(
        &self,
        queues: &[String],
    ) -> Result<mpsc::Receiver<BrokerDelivery>, StoreError> {
        if self.state.lock().await.closed {
            return Err(StoreError::Closed);
        }

        // Capacity 1: the dispatch task holds at most one message in flight
        // so the priority order is decided as late as possible.
        let (tx, rx) = mpsc::channel(1);
        let state = self.state.clone();
        let notify = self.notify.clone();
        let queues: Vec<String> = queues.to_vec();

        tokio::spawn(async move {
            loop {
                let delivery = loop {
                    // Interest must be registered before the ready check so
                    // a notify between check and await is not lost.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let mut guard = state.lock().await;
                        if guard.closed {
                            return;
                        }
                        if let Some(delivery) = InMemoryBroker::pop_ready(&mut guard, &queues) {
                            break delivery;
                        }
                    }
                    notified.await;
                };

                let tag = delivery.delivery_tag.clone();
                if tx.send(delivery).await.is_err() {
                    // Consumer dropped; put the in-flight message back.
                    let mut guard = state.lock().await;
                    if let Some((message, _queue)) = guard.unacked.remove(&tag) {
                        let seq = guard.seq;
                        guard.seq += 1;
                        let key = ready_key(message.priority, seq);
                        guard
                            .queues
                            .entry(message.queue.clone())
                            .or_default()
                            .insert(key, message);
                    }
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery: &BrokerDelivery) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.unacked.remove(&delivery.delivery_tag).is_none() {
            return Err(StoreError::NotFound(format!(
                "delivery tag {} already settled",
                delivery.delivery_tag
            )));
        }
        Ok(())
    }

    async fn reject(&self, delivery: &BrokerDelivery, requeue: bool) -> Result<(), StoreError> {
        let message = {
            let mut state = self.state.lock().await;
            match state.unacked.remove(&delivery.delivery_tag) {
                Some((message, _queue)) => message,
                None => {
                    return Err(StoreError::NotFound(format!(
                        "delivery tag {} already settled",
                        delivery.delivery_tag
                    )))
                }
            }
        };
        if requeue {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(name: &str, queue: &str, priority: u8) -> TaskMessage {
        TaskMessage::builder(name)
            .queue(queue)
            .priority(priority)
            .build()
    }

    #[tokio::test]
    async fn delivers_in_priority_order() {
        let broker = InMemoryBroker::new();
        broker.publish(message("low", "q", 1)).await.unwrap();
        broker.publish(message("high", "q", 9)).await.unwrap();
        broker.publish(message("mid", "q", 5)).await.unwrap();

        let mut rx = broker.consume(&["q".to_string()]).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.message.task_name, "high");
        assert_eq!(second.message.task_name, "mid");
        assert_eq!(third.message.task_name, "low");
    }

    #[tokio::test]
    async fn fifo_within_a_priority() {
        let broker = InMemoryBroker::new();
        broker.publish(message("a", "q", 5)).await.unwrap();
        broker.publish(message("b", "q", 5)).await.unwrap();

        let mut rx = broker.consume(&["q".to_string()]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message.task_name, "a");
        assert_eq!(rx.recv().await.unwrap().message.task_name, "b");
    }

    #[tokio::test]
    async fn ack_settles_exactly_once() {
        let broker = InMemoryBroker::new();
        broker.publish(message("t", "q", 5)).await.unwrap();
        let mut rx = broker.consume(&["q".to_string()]).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(broker.unacked_count().await, 1);
        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
        assert!(broker.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.publish(message("t", "q", 5)).await.unwrap();
        let mut rx = broker.consume(&["q".to_string()]).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        broker.reject(&delivery, true).await.unwrap();

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.message.id, delivery.message.id);
        broker.reject(&redelivered, false).await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
        assert_eq!(broker.pending_count("q").await, 0);
    }

    #[tokio::test]
    async fn consumer_receives_messages_published_later() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut rx = broker.consume(&["q".to_string()]).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(message("late", "q", 5)).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, "late");
    }

    #[tokio::test]
    async fn consumes_multiple_queues() {
        let broker = InMemoryBroker::new();
        broker.publish(message("a", "q1", 5)).await.unwrap();
        broker.publish(message("b", "q2", 5)).await.unwrap();

        let mut rx = broker
            .consume(&["q1".to_string(), "q2".to_string()])
            .await
            .unwrap();
        let mut names = vec![
            rx.recv().await.unwrap().message.task_name,
            rx.recv().await.unwrap().message.task_name,
        ];
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn closed_broker_reports_unhealthy() {
        let broker = InMemoryBroker::new();
        assert!(broker.is_healthy().await);
        broker.close().await;
        assert!(!broker.is_healthy().await);
        assert!(broker.publish(message("t", "q", 5)).await.is_err());
    }
}
