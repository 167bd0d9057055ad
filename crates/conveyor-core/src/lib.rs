//! Conveyor Core Library
//!
//! This crate provides the domain models, error types, configuration,
//! store/broker contracts and cron evaluation shared across all Conveyor
//! components. It contains no I/O; concrete brokers and stores live in
//! `conveyor-memory` and `conveyor-db`, the execution pipeline in
//! `conveyor-worker`.

pub mod config;
pub mod contract;
pub mod cron;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use contract::{
    BatchStore, Broker, DeadLetter, DeadLetterStore, DelayedMessageStore, RateLimiter,
    ResultBackend, RevocationStore, SagaStore, SignalStore,
};
pub use cron::{CronFormatError, CronSchedule};
pub use error::{StoreError, TaskError, WaitError};
pub use models::message::{BrokerDelivery, TaskMessage, TaskMessageBuilder};
pub use models::result::{ExceptionInfo, TaskResult, TaskState};
