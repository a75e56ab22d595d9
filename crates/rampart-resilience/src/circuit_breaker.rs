//! Circuit breaker with a count-based sliding window.
//!
//! Stops calling a failing dependency once the failure rate over the last
//! `sliding_window_size` calls reaches a threshold, then probes it again with
//! a limited number of trial calls after a wait period.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rampart_core::{Action, AsyncAction, AsyncPolicy, Pending, Policy, Scheduler};
use rampart_error::{classify, CallNotPermitted, CompositionError, ErrorClass, Outcome};
use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed - calls flow normally
    Closed = 0,
    /// Circuit is open - calls are rejected
    Open = 1,
    /// Circuit is half-open - a limited number of trial calls are let through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Failure rate in percent at which the circuit opens
    pub failure_rate_threshold: f32,
    /// Number of most recent calls the failure rate is computed over
    pub sliding_window_size: usize,
    /// Calls that must be recorded before the failure rate is evaluated
    pub minimum_number_of_calls: usize,
    /// Time to stay open before letting trial calls through
    pub wait_duration_in_open_state: Duration,
    /// Trial calls permitted while half-open
    pub permitted_number_of_calls_in_half_open_state: usize,
    /// Calls slower than this are counted as slow
    pub slow_call_duration_threshold: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_rate_threshold: 50.0,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            slow_call_duration_threshold: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Small window that reacts after a handful of calls
    pub fn sensitive(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_sliding_window_size(10)
            .with_minimum_number_of_calls(5)
            .with_wait_duration_in_open_state(Duration::from_secs(10))
            .with_permitted_number_of_calls_in_half_open_state(3)
    }

    /// Set failure rate threshold (percent)
    pub fn with_failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Set sliding window size
    pub fn with_sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    /// Set minimum number of calls before evaluating the failure rate
    pub fn with_minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.minimum_number_of_calls = calls;
        self
    }

    /// Set wait duration in open state
    pub fn with_wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    /// Set trial calls permitted in half-open state
    pub fn with_permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Set slow call threshold
    pub fn with_slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_duration_threshold = threshold;
        self
    }

    /// Checks the threshold and the window sizes.
    pub fn validate(&self) -> Result<(), CompositionError> {
        let invalid = |reason: String| CompositionError::InvalidConfig {
            policy: format!("CircuitBreaker '{}'", self.name),
            reason,
        };
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(invalid(format!(
                "failure_rate_threshold must be in (0, 100], got {}",
                self.failure_rate_threshold
            )));
        }
        if self.sliding_window_size == 0 {
            return Err(invalid("sliding_window_size must be at least 1".to_string()));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(invalid("minimum_number_of_calls must be at least 1".to_string()));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(invalid(
                "permitted_number_of_calls_in_half_open_state must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn clamped(mut self) -> Self {
        let threshold = self.failure_rate_threshold;
        self.failure_rate_threshold = if threshold.is_nan() {
            50.0
        } else {
            threshold.clamp(f32::MIN_POSITIVE, 100.0)
        };
        self.sliding_window_size = self.sliding_window_size.max(1);
        self.minimum_number_of_calls = self.minimum_number_of_calls.max(1);
        self.permitted_number_of_calls_in_half_open_state =
            self.permitted_number_of_calls_in_half_open_state.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Call {
    failed: bool,
    slow: bool,
}

#[derive(Debug, Default)]
struct Window {
    calls: VecDeque<Call>,
    failed: usize,
    slow: usize,
    opened_at: Option<Instant>,
    half_open_issued: usize,
}

impl Window {
    fn push(&mut self, call: Call, capacity: usize) {
        if self.calls.len() >= capacity {
            if let Some(evicted) = self.calls.pop_front() {
                self.failed -= evicted.failed as usize;
                self.slow -= evicted.slow as usize;
            }
        }
        self.failed += call.failed as usize;
        self.slow += call.slow as usize;
        self.calls.push_back(call);
    }

    fn reset(&mut self) {
        self.calls.clear();
        self.failed = 0;
        self.slow = 0;
        self.half_open_issued = 0;
    }

    fn failure_rate(&self) -> f32 {
        if self.calls.is_empty() {
            return 0.0;
        }
        self.failed as f32 * 100.0 / self.calls.len() as f32
    }
}

struct Shared {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    window: Mutex<Window>,
    not_permitted: AtomicU64,
}

/// Circuit breaker for preventing cascading failures
///
/// Cloning yields another handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with config.
    ///
    /// Out-of-range values are clamped with a warning; use
    /// [`CircuitBreaker::try_new`] to reject them instead.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        match config.validate() {
            Ok(()) => Self::build(config),
            Err(err) => {
                tracing::warn!(circuit = %config.name, error = %err, "Clamping circuit breaker config");
                Self::build(config.clamped())
            }
        }
    }

    /// Create a new circuit breaker, rejecting an invalid config
    pub fn try_new(config: CircuitBreakerConfig) -> Result<Self, CompositionError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                state: AtomicU8::new(CircuitState::Closed as u8),
                window: Mutex::new(Window::default()),
                not_permitted: AtomicU64::new(0),
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.inner.state.load(Ordering::SeqCst))
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.inner
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reject(&self, state: CircuitState) -> CallNotPermitted {
        self.inner.not_permitted.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(circuit = %self.name(), %state, "Call not permitted");
        CallNotPermitted::new(self.name(), state.to_string())
    }

    /// Asks for permission to run one call.
    ///
    /// Every granted permission must be followed by [`on_success`],
    /// [`on_error`] or [`release_permission`].
    ///
    /// [`on_success`]: CircuitBreaker::on_success
    /// [`on_error`]: CircuitBreaker::on_error
    /// [`release_permission`]: CircuitBreaker::release_permission
    pub fn try_acquire_permission(&self) -> Result<(), CallNotPermitted> {
        let mut window = self.window();
        let mut state = self.state();

        if state == CircuitState::Open {
            let waited = window
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.inner.config.wait_duration_in_open_state);
            if !waited {
                drop(window);
                return Err(self.reject(state));
            }
            self.enter(&mut window, CircuitState::HalfOpen);
            state = CircuitState::HalfOpen;
        }

        if state == CircuitState::HalfOpen {
            let permitted = self.inner.config.permitted_number_of_calls_in_half_open_state;
            if window.half_open_issued >= permitted {
                drop(window);
                return Err(self.reject(state));
            }
            window.half_open_issued += 1;
        }
        Ok(())
    }

    /// Gives back a permission whose call never completed (it was cancelled).
    pub fn release_permission(&self) {
        if self.state() == CircuitState::HalfOpen {
            let mut window = self.window();
            window.half_open_issued = window.half_open_issued.saturating_sub(1);
        }
    }

    /// Records a successful call
    pub fn on_success(&self, duration: Duration) {
        self.record(false, duration);
    }

    /// Records a failed call
    pub fn on_error(&self, duration: Duration) {
        self.record(true, duration);
    }

    /// Records the outcome of a permitted call.
    ///
    /// Cancelled calls release their permission without being counted.
    pub fn on_result<T>(&self, outcome: &Outcome<T>, duration: Duration) {
        match outcome {
            Ok(_) => self.on_success(duration),
            Err(err) if classify(err.as_ref()) == ErrorClass::Cancelled => {
                self.release_permission()
            }
            Err(_) => self.on_error(duration),
        }
    }

    fn record(&self, failed: bool, duration: Duration) {
        let config = &self.inner.config;
        let call = Call {
            failed,
            slow: duration >= config.slow_call_duration_threshold,
        };

        let mut window = self.window();
        match self.state() {
            CircuitState::Closed => {
                window.push(call, config.sliding_window_size);
                if window.calls.len() >= config.minimum_number_of_calls
                    && window.failure_rate() >= config.failure_rate_threshold
                {
                    tracing::warn!(
                        circuit = %config.name,
                        failure_rate = window.failure_rate(),
                        buffered = window.calls.len(),
                        "Circuit opened due to failures"
                    );
                    self.enter(&mut window, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                let permitted = config.permitted_number_of_calls_in_half_open_state;
                window.push(call, permitted);
                if window.calls.len() >= permitted {
                    if window.failure_rate() >= config.failure_rate_threshold {
                        tracing::warn!(
                            circuit = %config.name,
                            failure_rate = window.failure_rate(),
                            "Circuit reopened after half-open trial calls"
                        );
                        self.enter(&mut window, CircuitState::Open);
                    } else {
                        tracing::info!(
                            circuit = %config.name,
                            "Circuit closed after successful recovery"
                        );
                        self.enter(&mut window, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {
                // A call permitted before the circuit opened finished late.
                window.push(call, config.sliding_window_size);
            }
        }
    }

    fn enter(&self, window: &mut Window, state: CircuitState) {
        let previous = self.state();
        self.inner.state.store(state as u8, Ordering::SeqCst);
        match state {
            CircuitState::Open => {
                window.opened_at = Some(Instant::now());
                window.half_open_issued = 0;
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                window.reset();
                window.opened_at = None;
                self.inner.not_permitted.store(0, Ordering::SeqCst);
            }
        }
        if previous != state {
            tracing::debug!(circuit = %self.name(), from = %previous, to = %state, "Circuit state transition");
        }
    }

    /// Forces the circuit open, starting a new wait period
    pub fn transition_to_open_state(&self) {
        let mut window = self.window();
        self.enter(&mut window, CircuitState::Open);
    }

    /// Forces the circuit closed and clears its window
    pub fn transition_to_closed_state(&self) {
        let mut window = self.window();
        self.enter(&mut window, CircuitState::Closed);
    }

    /// Forces the circuit half-open and clears its window
    pub fn transition_to_half_open_state(&self) {
        let mut window = self.window();
        self.enter(&mut window, CircuitState::HalfOpen);
    }

    /// Runs `f` under the breaker
    pub fn execute<T, F>(&self, f: F) -> Outcome<T>
    where
        F: FnOnce() -> Outcome<T>,
    {
        self.try_acquire_permission()?;
        let start = Instant::now();
        let outcome = f();
        self.on_result(&outcome, start.elapsed());
        outcome
    }

    /// Wraps asynchronous work. Permission is asked when the work is
    /// invoked; the outcome is recorded when the work settles.
    ///
    /// Work already running on a scheduler is recorded even if the handle
    /// is dropped. Lazy work that is dropped before it settles gives its
    /// permission back without being counted.
    pub fn decorate_pending<I, T>(&self, unit: AsyncAction<I, T>) -> AsyncAction<I, T>
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let breaker = self.clone();
        AsyncAction::new(move |input| {
            if let Err(rejected) = breaker.try_acquire_permission() {
                return Pending::failed(rejected);
            }
            let permission = CallPermission::new(&breaker);
            unit.invoke(input).inspect(move |outcome| permission.record(outcome))
        })
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let window = self.window();
        let buffered = window.calls.len();
        let failure_rate = if buffered < self.inner.config.minimum_number_of_calls {
            -1.0
        } else {
            window.failure_rate()
        };
        CircuitBreakerMetrics {
            state: self.state(),
            number_of_buffered_calls: buffered,
            number_of_failed_calls: window.failed,
            number_of_successful_calls: buffered - window.failed,
            number_of_slow_calls: window.slow,
            number_of_not_permitted_calls: self.inner.not_permitted.load(Ordering::SeqCst),
            failure_rate,
        }
    }
}

/// A granted permission that is released unless an outcome is recorded.
struct CallPermission {
    breaker: CircuitBreaker,
    start: Instant,
    recorded: bool,
}

impl CallPermission {
    fn new(breaker: &CircuitBreaker) -> Self {
        Self {
            breaker: breaker.clone(),
            start: Instant::now(),
            recorded: false,
        }
    }

    fn record<T>(mut self, outcome: &Outcome<T>) {
        self.recorded = true;
        self.breaker.on_result(outcome, self.start.elapsed());
    }
}

impl Drop for CallPermission {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release_permission();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Policy for CircuitBreaker {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn decorate<I, T>(&self, unit: Action<I, T>) -> Action<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let breaker = self.clone();
        Action::new(move |input| breaker.execute(|| unit.invoke(input)))
    }
}

impl AsyncPolicy for CircuitBreaker {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn decorate_async<I, T>(
        &self,
        unit: AsyncAction<I, T>,
        _scheduler: Option<&Scheduler>,
    ) -> Result<AsyncAction<I, T>, CompositionError>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.decorate_pending(unit))
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Calls currently held in the sliding window
    pub number_of_buffered_calls: usize,
    /// Failed calls in the window
    pub number_of_failed_calls: usize,
    /// Successful calls in the window
    pub number_of_successful_calls: usize,
    /// Calls in the window slower than the slow call threshold
    pub number_of_slow_calls: usize,
    /// Calls rejected since the last transition to closed or half-open
    pub number_of_not_permitted_calls: u64,
    /// Failure rate in percent, or -1 while fewer than the minimum calls
    /// were recorded
    pub failure_rate: f32,
}
