pub mod batch;
pub mod message;
pub mod rate_limit;
pub mod result;
pub mod revocation;
pub mod saga;
pub mod signal;

pub use batch::{Batch, BatchState};
pub use message::{BrokerDelivery, TaskMessage, TaskMessageBuilder};
pub use rate_limit::{RateLimitLease, RateLimitPolicy};
pub use result::{ExceptionInfo, TaskResult, TaskState};
pub use revocation::{RevocationEntry, RevocationEvent, RevocationOptions, RevocationSignal};
pub use saga::{Saga, SagaState, SagaStep, SagaStepState};
pub use signal::{SignalKind, SignalMessage, TaskSignal};
