//! Conveyor Infrastructure Library
//!
//! Cross-cutting concerns shared by workers and producers:
//!
//! - Circuit breaker (per-queue failure-rate gate)
//! - Kill switch (process-wide failure-rate gate)
//! - In-process sliding-window rate limiter
//! - Resilience retry policy for transient store errors
//! - Telemetry initialization
//!
//! Everything here is in-process; distributed counterparts (the Postgres
//! rate limiter, for instance) live in `conveyor-db`.

pub mod circuit_breaker;
pub mod kill_switch;
pub mod rate_limit;
pub mod resilience;
pub mod telemetry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerOpenError, CircuitBreakerOptions, CircuitBreakerRegistry,
    CircuitState,
};
pub use kill_switch::{KillSwitch, KillSwitchOptions, KillSwitchState};
pub use rate_limit::SlidingWindowRateLimiter;
pub use resilience::RetryPolicy;
pub use telemetry::{init_telemetry, shutdown_telemetry};
