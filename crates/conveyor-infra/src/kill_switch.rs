//! Process-wide failure-rate gate.
//!
//! The kill switch watches a sliding window of execution outcomes. Once it
//! has seen enough samples (Ready → Tracking) it trips when the failure rate
//! crosses the threshold, pausing consumption via an internal gate; after
//! `restart_timeout` the window is cleared and the gate reopens
//! (Tripped → Restarting → Ready).
//!
//! Observers are raised after the internal lock is released; the gate is a
//! watch channel acquired outside the lock, and releasing it is idempotent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use conveyor_core::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// Warming up; fewer than `activation_threshold` samples seen.
    Ready,
    /// Enough samples; watching the failure rate.
    Tracking,
    /// Failure rate crossed the threshold; consumption paused.
    Tripped,
    /// Transient state while the window clears after a restart.
    Restarting,
}

#[derive(Debug, Clone)]
pub struct KillSwitchOptions {
    /// Samples required before the failure rate is considered meaningful.
    pub activation_threshold: usize,
    /// Failure rate (0–1) that trips the switch.
    pub trip_threshold: f64,
    pub tracking_window: Duration,
    /// How long consumption stays paused before the automatic restart.
    pub restart_timeout: Duration,
    pub trip_on_kinds: Vec<String>,
    pub ignore_kinds: Vec<String>,
}

impl Default for KillSwitchOptions {
    fn default() -> Self {
        Self {
            activation_threshold: 10,
            trip_threshold: 0.9,
            tracking_window: Duration::from_secs(60),
            restart_timeout: Duration::from_secs(30),
            trip_on_kinds: Vec::new(),
            ignore_kinds: Vec::new(),
        }
    }
}

type StateObserver = Arc<dyn Fn(KillSwitchState, KillSwitchState) + Send + Sync>;

struct Inner {
    state: KillSwitchState,
    samples: VecDeque<(Instant, bool)>,
    generation: u64,
}

pub struct KillSwitch {
    options: KillSwitchOptions,
    inner: Mutex<Inner>,
    gate_tx: tokio::sync::watch::Sender<bool>,
    gate_rx: tokio::sync::watch::Receiver<bool>,
    observer: Mutex<Option<StateObserver>>,
    self_ref: Mutex<Weak<KillSwitch>>,
}

impl KillSwitch {
    pub fn new(options: KillSwitchOptions) -> Arc<Self> {
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(true);
        let switch = Arc::new(Self {
            options,
            inner: Mutex::new(Inner {
                state: KillSwitchState::Ready,
                samples: VecDeque::new(),
                generation: 0,
            }),
            gate_tx,
            gate_rx,
            observer: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *switch.self_ref.lock().unwrap() = Arc::downgrade(&switch);
        switch
    }

    pub fn state(&self) -> KillSwitchState {
        self.inner.lock().unwrap().state
    }

    pub fn set_on_state_change(
        &self,
        observer: impl Fn(KillSwitchState, KillSwitchState) + Send + Sync + 'static,
    ) {
        *self.observer.lock().unwrap() = Some(Arc::new(observer));
    }

    /// Resolve once consumption may proceed. Returns immediately while the
    /// gate is open.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.gate_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_open(&self) -> bool {
        *self.gate_rx.borrow()
    }

    pub fn record_success(&self) {
        self.record(true);
    }

    pub fn record_failure(&self) {
        self.record(false);
    }

    /// Record a handler error respecting the trip/ignore kind filters;
    /// filtered-out errors count as successes so they keep the window
    /// moving without inflating the failure rate.
    pub fn record_error(&self, error: &TaskError) {
        let kind = error.kind();
        if self.options.ignore_kinds.iter().any(|k| k == kind) {
            return;
        }
        if !self.options.trip_on_kinds.is_empty()
            && !self.options.trip_on_kinds.iter().any(|k| k == kind)
        {
            self.record(true);
            return;
        }
        self.record(false);
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == KillSwitchState::Tripped || inner.state == KillSwitchState::Restarting {
            return;
        }

        let now = Instant::now();
        inner.samples.push_back((now, success));
        if let Some(cutoff) = now.checked_sub(self.options.tracking_window) {
            while inner
                .samples
                .front()
                .map(|(t, _)| *t < cutoff)
                .unwrap_or(false)
            {
                inner.samples.pop_front();
            }
        }

        let total = inner.samples.len();
        let mut changes = Vec::new();
        if inner.state == KillSwitchState::Ready && total >= self.options.activation_threshold {
            changes.push(Self::transition(&mut inner, KillSwitchState::Tracking));
        }

        if inner.state == KillSwitchState::Tracking && total >= self.options.activation_threshold {
            let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
            let rate = failures as f64 / total as f64;
            if rate >= self.options.trip_threshold {
                changes.push(Self::transition(&mut inner, KillSwitchState::Tripped));
                let generation = inner.generation;
                drop(inner);
                // Gate and timer are handled outside the lock.
                let _ = self.gate_tx.send(false);
                tracing::warn!(
                    failure_rate = rate,
                    window_samples = total,
                    "Kill switch tripped, pausing consumption"
                );
                self.arm_restart_timer(generation);
                self.raise(changes);
                return;
            }
        }
        drop(inner);
        self.raise(changes);
    }

    /// Force the switch back to Ready, clearing the window and reopening
    /// the gate.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.clear();
        let change = Self::transition(&mut inner, KillSwitchState::Ready);
        drop(inner);
        let _ = self.gate_tx.send(true);
        self.raise(vec![change]);
    }

    fn transition(
        inner: &mut Inner,
        to: KillSwitchState,
    ) -> Option<(KillSwitchState, KillSwitchState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.generation += 1;
        Some((from, to))
    }

    fn arm_restart_timer(&self, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(switch) = self.self_ref.lock().unwrap().upgrade() else {
            return;
        };
        let restart_timeout = self.options.restart_timeout;
        handle.spawn(async move {
            tokio::time::sleep(restart_timeout).await;
            let mut inner = switch.inner.lock().unwrap();
            if inner.state != KillSwitchState::Tripped || inner.generation != generation {
                return;
            }
            let mut changes = vec![Self::transition(&mut inner, KillSwitchState::Restarting)];
            inner.samples.clear();
            changes.push(Self::transition(&mut inner, KillSwitchState::Ready));
            drop(inner);
            let _ = switch.gate_tx.send(true);
            tracing::info!("Kill switch restarted, consumption resumed");
            switch.raise(changes);
        });
    }

    fn raise(&self, changes: Vec<Option<(KillSwitchState, KillSwitchState)>>) {
        let observer = self.observer.lock().unwrap().clone();
        for (from, to) in changes.into_iter().flatten() {
            tracing::info!(from = ?from, to = ?to, "Kill switch state changed");
            if let Some(observer) = &observer {
                observer(from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> KillSwitchOptions {
        KillSwitchOptions {
            activation_threshold: 4,
            trip_threshold: 0.5,
            tracking_window: Duration::from_secs(10),
            restart_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stays_ready_below_activation_threshold() {
        let switch = KillSwitch::new(options());
        switch.record_failure();
        switch.record_failure();
        switch.record_failure();
        assert_eq!(switch.state(), KillSwitchState::Ready);
        assert!(switch.is_open());
    }

    #[tokio::test]
    async fn trips_on_failure_rate_and_auto_restarts() {
        let switch = KillSwitch::new(options());
        switch.record_success();
        switch.record_failure();
        switch.record_failure();
        switch.record_failure();
        assert_eq!(switch.state(), KillSwitchState::Tripped);
        assert!(!switch.is_open());

        // wait_until_ready blocks while tripped, resolves after restart.
        let waited = tokio::time::timeout(Duration::from_millis(50), switch.wait_until_ready())
            .await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(switch.state(), KillSwitchState::Ready);
        assert!(switch.is_open());
        tokio::time::timeout(Duration::from_millis(50), switch.wait_until_ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn healthy_traffic_keeps_tracking() {
        let switch = KillSwitch::new(options());
        for _ in 0..4 {
            switch.record_success();
        }
        assert_eq!(switch.state(), KillSwitchState::Tracking);
        switch.record_failure();
        assert_eq!(switch.state(), KillSwitchState::Tracking);
        assert!(switch.is_open());
    }

    #[tokio::test]
    async fn reset_reopens_gate() {
        let switch = KillSwitch::new(options());
        for _ in 0..4 {
            switch.record_failure();
        }
        assert_eq!(switch.state(), KillSwitchState::Tripped);
        switch.reset();
        assert_eq!(switch.state(), KillSwitchState::Ready);
        assert!(switch.is_open());
    }

    #[tokio::test]
    async fn ignored_kinds_do_not_count() {
        let mut opts = options();
        opts.ignore_kinds = vec!["reject".to_string()];
        let switch = KillSwitch::new(opts);
        for _ in 0..8 {
            switch.record_error(&TaskError::reject("no"));
        }
        assert_eq!(switch.state(), KillSwitchState::Ready);
    }

    #[tokio::test]
    async fn observer_runs_outside_lock() {
        let switch = KillSwitch::new(options());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let switch_clone = switch.clone();
        switch.set_on_state_change(move |from, to| {
            // Re-entering the switch from the observer must not deadlock.
            let _ = switch_clone.state();
            seen_clone.lock().unwrap().push((from, to));
        });
        for _ in 0..4 {
            switch.record_failure();
        }
        let events = seen.lock().unwrap();
        assert!(events.contains(&(KillSwitchState::Ready, KillSwitchState::Tracking)));
        assert!(events.contains(&(KillSwitchState::Tracking, KillSwitchState::Tripped)));
    }
}
