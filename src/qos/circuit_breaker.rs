use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{DnsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half-open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

pub type StateChangeFn = dyn Fn(CircuitState, CircuitState) + Send + Sync;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            reset_timeout: Duration::from_secs(60),
            half_open_attempts: 3,
        }
    }
}

impl BreakerConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_failures == 0 {
            self.max_failures = defaults.max_failures;
        }
        if self.reset_timeout.is_zero() {
            self.reset_timeout = defaults.reset_timeout;
        }
        if self.half_open_attempts == 0 {
            self.half_open_attempts = defaults.half_open_attempts;
        }
        self
    }
}

/// Three-state circuit breaker guarding one upstream connection.
///
/// Closed counts failures and opens at `max_failures`; Open rejects
/// everything until `reset_timeout` has elapsed, then a half-open probe
/// admits calls until `half_open_attempts` consecutive successes close the
/// circuit again. Any half-open failure reopens it.
pub struct CircuitBreaker {
    config: BreakerConfig,

    state: RwLock<CircuitState>,
    failures: AtomicU64,
    successes: AtomicU64,
    half_open_success: AtomicU64,
    last_failure: RwLock<Option<Instant>>,

    on_state_change: RwLock<Option<Arc<StateChangeFn>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: config.sanitized(),
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            half_open_success: AtomicU64::new(0),
            last_failure: RwLock::new(None),
            on_state_change: RwLock::new(None),
        }
    }

    /// Run `f` through the breaker, recording its outcome.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.before_execute() {
            return Err(DnsError::CircuitBreakerOpen);
        }

        let result = f().await;
        self.after_execute(result.is_err());
        result
    }

    /// Admission check. Returns `true` when the call must be rejected.
    /// An open breaker past its reset timeout transitions to half-open
    /// and admits the probe.
    pub fn before_execute(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }

        if self.should_attempt_reset() {
            let mut state = self.state.write();
            // Another caller may have probed first.
            if *state == CircuitState::Open {
                self.transition_to(&mut state, CircuitState::HalfOpen);
            }
            return false;
        }

        true
    }

    /// Record the outcome of an admitted call.
    pub fn after_execute(&self, failed: bool) {
        let mut state = self.state.write();

        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.record_failure(&mut state);
        } else {
            self.successes.fetch_add(1, Ordering::Relaxed);

            if *state == CircuitState::HalfOpen {
                let ok = self.half_open_success.fetch_add(1, Ordering::Relaxed) + 1;
                if ok >= u64::from(self.config.half_open_attempts) {
                    self.transition_to(&mut state, CircuitState::Closed);
                }
            } else {
                self.failures.store(0, Ordering::Relaxed);
            }
        }
    }

    fn record_failure(&self, state: &mut CircuitState) {
        *self.last_failure.write() = Some(Instant::now());

        match *state {
            CircuitState::Closed => {
                if self.failures.load(Ordering::Relaxed) >= u64::from(self.config.max_failures) {
                    self.transition_to(state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn should_attempt_reset(&self) -> bool {
        match *self.last_failure.read() {
            Some(last) => last.elapsed() >= self.config.reset_timeout,
            None => false,
        }
    }

    fn transition_to(&self, state: &mut CircuitState, new_state: CircuitState) {
        let old_state = *state;
        if old_state == new_state {
            return;
        }
        *state = new_state;

        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.half_open_success.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                self.half_open_success.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {}
        }

        let callback = self.on_state_change.read().clone();
        if let Some(cb) = callback {
            cb(old_state, new_state);
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn set_state_change_callback<F>(&self, f: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.on_state_change.write() = Some(Arc::new(f));
    }

    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = CircuitState::Closed;
        self.failures.store(0, Ordering::Relaxed);
        self.half_open_success.store(0, Ordering::Relaxed);
    }

    /// `(state, failures, successes)`
    pub fn stats(&self) -> (CircuitState, u64, u64) {
        (
            self.state(),
            self.failures.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
        )
    }
}
