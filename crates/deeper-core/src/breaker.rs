//! Circuit breaker for shedding load toward failing plugins.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures in window]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                                   |
//!                                                 <--[failure]--                    |
//!                                                                                   |
//! CLOSED <------------------------------[first success]----------------------------+
//! ```
//!
//! Breakers are keyed by plugin name and live in a [`BreakerRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - calls flow normally.
    Closed,
    /// Circuit is open - calls are rejected immediately.
    Open,
    /// Circuit is half-open - a bounded number of trial calls are allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_size` before the circuit opens.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub recovery_timeout: Duration,

    /// Maximum concurrent trial calls admitted while Half-Open.
    pub half_open_max_calls: u32,

    /// Length of the rolling failure window.
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            window_size: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    /// Failure timestamps within the rolling window.
    failures: VecDeque<Instant>,
    last_failure_time: Option<Instant>,
    half_open_in_flight: u32,
    trip_count: u64,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_failure_time: None,
            half_open_in_flight: 0,
            trip_count: 0,
        }
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    #[serde(serialize_with = "serialize_state")]
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub half_open_in_flight: u32,
    pub trip_count: u64,
    pub time_until_half_open_ms: Option<u64>,
}

fn serialize_state<S: serde::Serializer>(
    state: &CircuitState,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&state.to_string())
}

/// Thread-safe circuit breaker for one key.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now. A `true` answer while
    /// Half-Open occupies one of the bounded trial slots; the caller must
    /// follow up with [`record_result`](Self::record_result).
    pub fn allow(&self) -> bool {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`allow`](Self::allow).
    pub fn record_result(&self, success: bool) {
        let mut inner = self.lock_inner();
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if success {
                    tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.half_open_in_flight = 0;
                } else {
                    tracing::warn!(circuit = %self.name, "Circuit breaker probe failed, returning to open state");
                    inner.state = CircuitState::Open;
                    inner.last_failure_time = Some(now);
                    inner.trip_count += 1;
                }
            }
            CircuitState::Closed => {
                if success {
                    inner.failures.clear();
                } else {
                    inner.failures.push_back(now);
                    inner.last_failure_time = Some(now);
                    let window = self.config.window_size;
                    while inner
                        .failures
                        .front()
                        .is_some_and(|t| now.duration_since(*t) > window)
                    {
                        inner.failures.pop_front();
                    }
                    if inner.failures.len() as u32 >= self.config.failure_threshold {
                        tracing::warn!(
                            circuit = %self.name,
                            failures = inner.failures.len(),
                            "Circuit breaker opening"
                        );
                        inner.state = CircuitState::Open;
                        inner.trip_count += 1;
                    }
                }
            }
            CircuitState::Open => {
                if !success {
                    inner.last_failure_time = Some(now);
                }
            }
        }
    }

    /// Release a half-open trial slot without judging the probe. For calls
    /// that ended for reasons unrelated to the service (cancellation,
    /// local errors).
    pub fn record_unjudged(&self) {
        let mut inner = self.lock_inner();
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }

    /// Remaining time before an Open circuit starts probing.
    pub fn retry_after(&self) -> Duration {
        let inner = self.lock_inner();
        inner
            .last_failure_time
            .map(|t| {
                let elapsed = t.elapsed();
                if elapsed < self.config.recovery_timeout {
                    self.config.recovery_timeout - elapsed
                } else {
                    Duration::ZERO
                }
            })
            .unwrap_or(self.config.recovery_timeout)
    }

    /// Convenience combining `allow`, invocation, and `record_result`.
    /// Errors that do not trip the circuit are passed through unrecorded.
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.allow() {
            return Err(AppError::BreakerOpen {
                key: self.name.clone(),
                retry_after: self.retry_after(),
            });
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_result(true),
            Err(e) if e.should_trip_circuit() => self.record_result(false),
            Err(_) => self.record_unjudged(),
        }

        result
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open_ms = if inner.state == CircuitState::Open {
            inner.last_failure_time.map(|t| {
                let elapsed = t.elapsed();
                if elapsed < self.config.recovery_timeout {
                    (self.config.recovery_timeout - elapsed).as_millis() as u64
                } else {
                    0
                }
            })
        } else {
            None
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures_in_window: inner.failures.len() as u32,
            half_open_in_flight: inner.half_open_in_flight,
            trip_count: inner.trip_count,
            time_until_half_open_ms,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.last_failure_time = None;
        inner.half_open_in_flight = 0;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
        }
    }
}

/// Keyed breaker table with one shared configuration. Lookups take a read
/// lock; first insertion of a key takes the write lock with a double check.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> CircuitBreaker {
        if let Some(cb) = self.breakers.read().unwrap().get(key) {
            return cb.clone();
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.config.clone()))
            .clone()
    }

    pub fn record_result(&self, key: &str, success: bool) {
        self.get_or_create(key).record_result(success);
    }

    /// Snapshot of every breaker, sorted by key.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .read()
            .unwrap()
            .values()
            .map(CircuitBreaker::stats)
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            ..Default::default()
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            cb.record_result(false);
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("test", config(5, Duration::from_secs(60)));

        for _ in 0..4 {
            cb.record_result(false);
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_clears_failure_window() {
        let cb = CircuitBreaker::new("test", config(5, Duration::from_secs(60)));

        for _ in 0..4 {
            cb.record_result(false);
        }
        cb.record_result(true);
        for _ in 0..4 {
            cb.record_result(false);
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                window_size: Duration::from_millis(30),
                ..Default::default()
            },
        );

        cb.record_result(false);
        cb.record_result(false);
        std::thread::sleep(Duration::from_millis(50));
        cb.record_result(false);

        // Only one failure is inside the window.
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures_in_window, 1);
    }

    #[test]
    fn test_circuit_transitions_to_half_open() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_millis(10)));

        cb.record_result(false);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_on_first_success() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_millis(1)));

        cb.record_result(false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow());
        cb.record_result(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_millis(1)));

        cb.record_result(false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow());
        cb.record_result(false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_caps_concurrent_trials() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(1),
                half_open_max_calls: 2,
                ..Default::default()
            },
        );

        cb.record_result(false);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.allow());
        assert!(cb.allow());
        // Third trial is rejected like Open.
        assert!(!cb.allow());

        // A slot frees up when a trial reports.
        cb.record_result(false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_secs(300)));

        cb.record_result(false);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_rejects_when_open() {
        let cb = CircuitBreaker::new("test", config(1, Duration::from_secs(60)));
        cb.record_result(false);

        let result = cb
            .execute(|| async { Ok::<_, AppError>("should not execute".to_string()) })
            .await;

        assert!(matches!(result, Err(AppError::BreakerOpen { .. })));
    }

    #[tokio::test]
    async fn test_execute_records_tripping_failures_only() {
        let cb = CircuitBreaker::new("test", config(2, Duration::from_secs(60)));

        let _ = cb
            .execute(|| async { Err::<(), _>(AppError::NetworkError("fail".into())) })
            .await;
        assert_eq!(cb.stats().failures_in_window, 1);

        // Cancellation is not a service failure and leaves the window alone.
        let _ = cb
            .execute(|| async { Err::<(), _>(AppError::Cancelled) })
            .await;
        assert_eq!(cb.stats().failures_in_window, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_shares_breaker_per_key() {
        let registry = BreakerRegistry::new(config(2, Duration::from_secs(60)));

        registry.record_result("whois", false);
        registry.record_result("whois", false);

        assert_eq!(registry.get_or_create("whois").state(), CircuitState::Open);
        assert_eq!(
            registry.get_or_create("other").state(),
            CircuitState::Closed
        );

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "other");
        assert_eq!(stats[1].name, "whois");
    }
}
