//! Conveyor Worker Library
//!
//! The execution pipeline: task handlers are registered in a
//! [`registry::TaskRegistry`], the [`executor::TaskExecutor`] turns one
//! delivered message into one terminal outcome (through the filter pipeline,
//! time-limit enforcer and revocation manager), and the
//! [`worker::Worker`] loop pulls deliveries from a broker behind the kill
//! switch and per-queue circuit breakers. The
//! [`dispatcher::DelayedDispatcher`] re-injects delayed messages when due.

pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod filter;
pub mod handler;
pub mod registry;
pub mod revocation;
pub mod signals;
pub mod time_limit;
pub mod worker;

pub use context::{ScopedServices, ServiceScope, TaskContext};
pub use dispatcher::{DelayedDispatcher, DispatcherHandle};
pub use executor::{ExecuteError, ExecutorOptions, TaskExecutor};
pub use filter::{FilterContext, FilterPipeline, PipelineOutcome, TaskFilter};
pub use handler::TaskHandler;
pub use registry::{RegistrationOptions, RegistryError, TaskRegistration, TaskRegistry};
pub use revocation::RevocationManager;
pub use signals::{SignalBus, SignalProcessorHandle};
pub use time_limit::TimeLimitPolicy;
pub use worker::{Worker, WorkerHandle};
