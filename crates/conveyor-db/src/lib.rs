//! PostgreSQL implementations of the Conveyor store contracts.
//!
//! Every store bootstraps its own schema idempotently
//! (`CREATE TABLE IF NOT EXISTS`, guarded by an init mutex) when
//! auto-creation is enabled. Pooled connections are shared across
//! operations; long-lived subscriptions (result waits, revocation events)
//! each take a dedicated `PgListener` connection because LISTEN binds to
//! connection lifetime.

pub mod backend;
pub mod batch;
pub mod channel;
pub mod dead_letter;
pub mod delayed;
pub mod rate_limit;
pub mod revocation;
pub mod saga;
pub mod signal_store;

mod sql;

pub use backend::{CleanupHandle, PgResultBackend};
pub use batch::PgBatchStore;
pub use channel::{channel_for, is_valid_channel, sanitize_task_id};
pub use dead_letter::PgDeadLetterStore;
pub use delayed::PgDelayedStore;
pub use rate_limit::PgRateLimiter;
pub use revocation::PgRevocationStore;
pub use saga::PgSagaStore;
pub use signal_store::PgSignalStore;
