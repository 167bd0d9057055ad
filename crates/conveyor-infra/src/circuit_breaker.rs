//! Per-queue circuit breaker.
//!
//! Closed counts failures within a rolling window; reaching the threshold
//! opens the circuit. Open rejects everything until `open_duration` elapses,
//! then a half-open probe phase lets traffic through; enough successes close
//! the circuit again, any failure re-opens it.
//!
//! Lock discipline: the internal mutex is held only across state
//! transitions. Observers are invoked after the lock is released (deferred
//! raise), never under it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use conveyor_core::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Raised by [`CircuitBreaker::execute`] while the circuit is open. Callers
/// treat it as transient.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker \"{circuit_name}\" is open")]
pub struct CircuitBreakerOpenError {
    pub circuit_name: String,
    pub estimated_retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerOptions {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Half-open probe successes required to close.
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub failure_window: Duration,
    /// When non-empty, only these error kinds count as failures.
    pub trip_on_kinds: Vec<String>,
    /// Error kinds that never affect breaker state.
    pub ignore_kinds: Vec<String>,
    /// Give every queue its own breaker instead of one shared circuit.
    pub per_queue: bool,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            trip_on_kinds: Vec::new(),
            ignore_kinds: Vec::new(),
            per_queue: true,
        }
    }
}

type StateObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    probe_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    /// Bumped on every transition so that a stale half-open timer cannot
    /// re-fire against a newer state.
    generation: u64,
}

pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    inner: Mutex<Inner>,
    observer: Mutex<Option<StateObserver>>,
    /// Self-reference for the half-open timer task.
    self_ref: Mutex<Weak<CircuitBreaker>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Arc<Self> {
        let breaker = Arc::new(Self {
            name: name.into(),
            options,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                probe_successes: 0,
                opened_at: None,
                last_failure_at: None,
                generation: 0,
            }),
            observer: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *breaker.self_ref.lock().unwrap() = Arc::downgrade(&breaker);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_on_state_change(
        &self,
        observer: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) {
        *self.observer.lock().unwrap() = Some(Arc::new(observer));
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        let change = Self::check_open_elapsed(&mut inner, &self.options);
        let state = inner.state;
        drop(inner);
        self.raise(change);
        state
    }

    /// Whether a call may proceed right now.
    pub fn is_allowed(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Remaining time until the circuit leaves Open, when it is open.
    pub fn estimated_retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(self.options.open_duration.saturating_sub(opened.elapsed()))
            }
            _ => None,
        }
    }

    /// Failures currently inside the rolling window.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failures.len() as u32
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().last_failure_at
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        let change = match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
                None
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.options.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        };
        drop(inner);
        self.raise(change);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.last_failure_at = Some(now);
        let change = match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                if let Some(cutoff) = now.checked_sub(self.options.failure_window) {
                    while inner.failures.front().map(|t| *t < cutoff).unwrap_or(false) {
                        inner.failures.pop_front();
                    }
                }
                if inner.failures.len() as u32 >= self.options.failure_threshold {
                    let change = Self::transition(&mut inner, CircuitState::Open);
                    self.arm_half_open_timer(inner.generation);
                    change
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                let change = Self::transition(&mut inner, CircuitState::Open);
                self.arm_half_open_timer(inner.generation);
                change
            }
            CircuitState::Open => None,
        };
        drop(inner);
        self.raise(change);
    }

    /// Record an error respecting the trip/ignore kind filters.
    pub fn record_error(&self, error: &TaskError) {
        let kind = error.kind();
        if self.options.ignore_kinds.iter().any(|k| k == kind) {
            return;
        }
        if !self.options.trip_on_kinds.is_empty()
            && !self.options.trip_on_kinds.iter().any(|k| k == kind)
        {
            return;
        }
        self.record_failure();
    }

    /// Run `op` through the breaker: fast-fail while open, record the
    /// outcome otherwise.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<Result<T, TaskError>, CircuitBreakerOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, TaskError>>,
    {
        if !self.is_allowed() {
            return Err(CircuitBreakerOpenError {
                circuit_name: self.name.clone(),
                estimated_retry_after: self.estimated_retry_after(),
            });
        }
        let outcome = op().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(e) => self.record_error(e),
        }
        Ok(outcome)
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.clear();
        inner.probe_successes = 0;
        let change = Self::transition(&mut inner, CircuitState::Closed);
        drop(inner);
        self.raise(change);
    }

    fn transition(inner: &mut Inner, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.generation += 1;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.probe_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_successes = 0;
            }
            CircuitState::Closed => {
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_successes = 0;
            }
        }
        Some((from, to))
    }

    /// Open for longer than `open_duration` lazily becomes HalfOpen; the
    /// armed timer is belt and braces for idle breakers.
    fn check_open_elapsed(
        inner: &mut Inner,
        options: &CircuitBreakerOptions,
    ) -> Option<(CircuitState, CircuitState)> {
        if inner.state == CircuitState::Open {
            if let Some(opened) = inner.opened_at {
                if opened.elapsed() >= options.open_duration {
                    return Self::transition(inner, CircuitState::HalfOpen);
                }
            }
        }
        None
    }

    /// Schedule the Open → HalfOpen transition. The generation check
    /// neutralizes a timer armed for an earlier open phase. Outside a tokio
    /// runtime the lazy elapsed check in [`CircuitBreaker::state`] takes
    /// over.
    fn arm_half_open_timer(&self, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(breaker) = self.self_ref.lock().unwrap().upgrade() else {
            return;
        };
        let open_duration = self.options.open_duration;
        handle.spawn(async move {
            tokio::time::sleep(open_duration).await;
            let mut inner = breaker.inner.lock().unwrap();
            let change = if inner.state == CircuitState::Open && inner.generation == generation {
                CircuitBreaker::transition(&mut inner, CircuitState::HalfOpen)
            } else {
                None
            };
            drop(inner);
            breaker.raise(change);
        });
    }

    fn raise(&self, change: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = change {
            tracing::info!(
                circuit = %self.name,
                from = ?from,
                to = ?to,
                "Circuit breaker state changed"
            );
            let observer = self.observer.lock().unwrap().clone();
            if let Some(observer) = observer {
                observer(&self.name, from, to);
            }
        }
    }
}

/// Set of breakers, one per queue (or a single shared one when
/// `per_queue = false`).
pub struct CircuitBreakerRegistry {
    options: CircuitBreakerOptions,
    breakers: Mutex<std::collections::HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            breakers: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn for_queue(&self, queue: &str) -> Arc<CircuitBreaker> {
        let key = if self.options.per_queue { queue } else { "*" };
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.options.clone()))
            .clone()
    }
}
