//! End-to-end worker-loop behaviour: broker in, terminal outcome out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conveyor_core::config::{DeadLetterConfig, WorkerConfig};
use conveyor_core::{
    Broker, DeadLetterStore, DelayedMessageStore, ResultBackend, TaskError, TaskMessage,
    TaskState,
};
use conveyor_infra::{
    CircuitBreakerOptions, CircuitBreakerRegistry, KillSwitch, KillSwitchOptions, RetryPolicy,
};
use conveyor_memory::{
    InMemoryBroker, InMemoryDeadLetterStore, InMemoryDelayedStore, InMemoryResultBackend,
};
use conveyor_worker::{
    DelayedDispatcher, ExecutorOptions, RegistrationOptions, ServiceScope, SignalBus,
    TaskContext, TaskExecutor, TaskHandler, TaskRegistry, Worker,
};

#[derive(Serialize, Deserialize)]
struct Empty {}

struct Flaky {
    invocations: Arc<AtomicUsize>,
    succeed_after: usize,
}

#[async_trait]
impl TaskHandler for Flaky {
    const NAME: &'static str = "tests.flaky";
    type Input = Empty;
    type Output = Empty;

    async fn execute(
        &self,
        _input: Self::Input,
        ctx: &TaskContext,
        _token: CancellationToken,
    ) -> Result<Self::Output, TaskError> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.succeed_after {
            Err(ctx.retry(Some(Duration::from_millis(50)), None))
        } else {
            Ok(Empty {})
        }
    }
}

struct Noop;

#[async_trait]
impl TaskHandler for Noop {
    const NAME: &'static str = "tests.ok";
    type Input = Empty;
    type Output = Empty;

    async fn execute(
        &self,
        _input: Self::Input,
        _ctx: &TaskContext,
        _token: CancellationToken,
    ) -> Result<Self::Output, TaskError> {
        Ok(Empty {})
    }
}

struct Rig {
    broker: Arc<InMemoryBroker>,
    backend: Arc<InMemoryResultBackend>,
    delayed: Arc<InMemoryDelayedStore>,
    dead_letter: Arc<InMemoryDeadLetterStore>,
    registry: Arc<TaskRegistry>,
}

impl Rig {
    fn new() -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::new()),
            backend: Arc::new(InMemoryResultBackend::new()),
            delayed: Arc::new(InMemoryDelayedStore::new()),
            dead_letter: Arc::new(InMemoryDeadLetterStore::new(DeadLetterConfig {
                max_messages: 100,
                retention: None,
            })),
            registry: Arc::new(TaskRegistry::new(false)),
        }
    }

    fn start(&self) -> (conveyor_worker::WorkerHandle, conveyor_worker::DispatcherHandle) {
        let executor = Arc::new(TaskExecutor::new(
            self.registry.clone(),
            self.backend.clone(),
            None,
            None,
            Arc::new(SignalBus::new()),
            Vec::new(),
            Arc::new(ServiceScope::new()),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
            ExecutorOptions::default(),
        ));

        let worker = Worker::new(
            self.broker.clone(),
            executor,
            self.delayed.clone(),
            Some(self.dead_letter.clone()),
            Some(KillSwitch::new(KillSwitchOptions::default())),
            Some(Arc::new(CircuitBreakerRegistry::new(
                CircuitBreakerOptions::default(),
            ))),
            WorkerConfig {
                queues: vec!["default".to_string()],
                concurrency: 4,
                dispatcher_tick: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let worker_handle = worker.spawn();

        let dispatcher = DelayedDispatcher::new(
            self.delayed.clone(),
            self.broker.clone(),
            Duration::from_millis(20),
        );
        let dispatcher_handle = dispatcher.spawn();
        (worker_handle, dispatcher_handle)
    }
}

#[tokio::test]
async fn published_message_reaches_a_terminal_result() {
    let rig = Rig::new();
    rig.registry
        .register(Noop, RegistrationOptions::default())
        .unwrap();
    let (worker, dispatcher) = rig.start();

    let message = TaskMessage::builder("tests.ok")
        .args_json(&Empty {})
        .unwrap()
        .build();
    let task_id = message.id.clone();
    rig.broker.publish(message).await.unwrap();

    let result = rig
        .backend
        .wait_for_result(&task_id, Some(Duration::from_secs(5)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, TaskState::Success);

    worker.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn retry_flows_through_the_delayed_store_until_success() {
    let rig = Rig::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    rig.registry
        .register(
            Flaky {
                invocations: invocations.clone(),
                succeed_after: 3,
            },
            RegistrationOptions::default(),
        )
        .unwrap();
    let (worker, dispatcher) = rig.start();

    let message = TaskMessage::builder("tests.flaky")
        .args_json(&Empty {})
        .unwrap()
        .max_retries(5)
        .build();
    let task_id = message.id.clone();
    rig.broker.publish(message).await.unwrap();

    let result = rig
        .backend
        .wait_for_result(&task_id, Some(Duration::from_secs(10)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, TaskState::Success);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    worker.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn unknown_task_is_dead_lettered() {
    let rig = Rig::new();
    let (worker, dispatcher) = rig.start();

    let message = TaskMessage::builder("tests.unregistered").build();
    let task_id = message.id.clone();
    rig.broker.publish(message).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.dead_letter.len().await.unwrap(), 1);
    let letters = rig.dead_letter.list(0, 10).await.unwrap();
    assert_eq!(letters[0].message.id, task_id);
    assert!(letters[0].reason.contains("no handler"));
    assert_eq!(rig.broker.unacked_count().await, 0);

    worker.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn future_eta_is_parked_then_executed() {
    let rig = Rig::new();
    rig.registry
        .register(Noop, RegistrationOptions::default())
        .unwrap();
    let (worker, dispatcher) = rig.start();

    let message = TaskMessage::builder("tests.ok")
        .args_json(&Empty {})
        .unwrap()
        .eta(chrono::Utc::now() + chrono::Duration::milliseconds(150))
        .build();
    let task_id = message.id.clone();
    rig.broker.publish(message).await.unwrap();

    // Not yet executed while parked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rig.backend.get_result(&task_id).await.unwrap().is_none());
    assert_eq!(rig.delayed.pending_count().await.unwrap(), 1);

    let result = rig
        .backend
        .wait_for_result(&task_id, Some(Duration::from_secs(5)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, TaskState::Success);

    worker.shutdown().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn expired_message_is_dead_lettered_without_execution() {
    let rig = Rig::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    rig.registry
        .register(
            Flaky {
                invocations: invocations.clone(),
                succeed_after: 1,
            },
            RegistrationOptions::default(),
        )
        .unwrap();
    let (worker, dispatcher) = rig.start();

    let message = TaskMessage::builder("tests.flaky")
        .args_json(&Empty {})
        .unwrap()
        .expires(chrono::Utc::now() - chrono::Duration::seconds(1))
        .build();
    rig.broker.publish(message).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(rig.dead_letter.len().await.unwrap(), 1);
    let letters = rig.dead_letter.list(0, 10).await.unwrap();
    assert!(letters[0].reason.contains("expired"));

    worker.shutdown().await;
    dispatcher.shutdown().await;
}
