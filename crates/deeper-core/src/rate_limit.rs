//! Per-domain token-bucket rate limiting with linear backoff.
//!
//! Each configured domain gets its own bucket (`rate_per_sec` tokens/sec,
//! capacity `burst`); every unconfigured domain shares the distinguished
//! `"default"` bucket. Backoff state is tracked per observed domain: after
//! `k` consecutive failures the domain is held for `min(base × k, max)`
//! before the next token is handed out, and one success resets it.
//!
//! Waiters on the same domain are served in FIFO order: a waiter reserves
//! its token under the bucket's fair mutex (driving the balance negative)
//! and then sleeps until its slot, so grants follow lock-acquisition order.
//! Across domains there is no ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{DEFAULT_DOMAIN, is_valid_domain};
use crate::error::AppError;

/// Rate limiting configuration for one domain.
#[derive(Debug, Clone)]
pub struct DomainRateConfig {
    pub domain: String,
    pub rate_per_sec: f64,
    pub burst: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_retries: u32,
}

impl Default for DomainRateConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            rate_per_sec: 10.0,
            burst: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl DomainRateConfig {
    /// Validate at configuration time. Runtime extraction never fails, so
    /// this is the only place bad domains are rejected.
    pub fn validate(&self) -> Result<(), AppError> {
        if !is_valid_domain(&self.domain) {
            return Err(AppError::ConfigError(format!(
                "invalid domain: {}",
                self.domain
            )));
        }
        if !(self.rate_per_sec.is_finite() && self.rate_per_sec > 0.0) {
            return Err(AppError::ConfigError(format!(
                "rate for {} must be positive, got {}",
                self.domain, self.rate_per_sec
            )));
        }
        if self.burst == 0 {
            return Err(AppError::ConfigError(format!(
                "burst for {} must be at least 1",
                self.domain
            )));
        }
        Ok(())
    }
}

/// Token bucket. `tokens` may go negative: each unit below zero is a
/// reservation already promised to a queued waiter.
struct Bucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token if available right now.
    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Reserve one token; returns when the reservation becomes ready.
    fn reserve(&mut self, now: Instant) -> Option<Instant> {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(now + Duration::from_secs_f64(-self.tokens / self.rate_per_sec))
        }
    }

    fn release(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.burst);
    }
}

#[derive(Default)]
struct BackoffState {
    failures: u32,
    current: Duration,
    last_failure: Option<Instant>,
}

impl BackoffState {
    fn remaining(&self) -> Option<Duration> {
        if self.failures == 0 {
            return None;
        }
        let last = self.last_failure?;
        let elapsed = last.elapsed();
        if elapsed < self.current {
            Some(self.current - elapsed)
        } else {
            None
        }
    }
}

/// Per-domain metrics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DomainRateMetrics {
    pub domain: String,
    pub rate_per_sec: f64,
    pub burst: u32,
    pub failure_count: u32,
    pub current_backoff_ms: u64,
    pub in_backoff: bool,
}

/// Manages token buckets and backoff trackers for all domains.
pub struct DomainRateLimiter {
    default_config: DomainRateConfig,
    configs: RwLock<HashMap<String, DomainRateConfig>>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    backoffs: RwLock<HashMap<String, Arc<StdMutex<BackoffState>>>>,
    waits: AtomicU64,
}

impl DomainRateLimiter {
    pub fn new(default_config: DomainRateConfig) -> Result<Self, AppError> {
        default_config.validate()?;

        let mut buckets = HashMap::new();
        buckets.insert(
            DEFAULT_DOMAIN.to_string(),
            Arc::new(Mutex::new(Bucket::new(
                default_config.rate_per_sec,
                default_config.burst,
            ))),
        );

        Ok(Self {
            default_config,
            configs: RwLock::new(HashMap::new()),
            buckets: RwLock::new(buckets),
            backoffs: RwLock::new(HashMap::new()),
            waits: AtomicU64::new(0),
        })
    }

    /// Add or replace rate limiting configuration for a domain.
    /// Intended for startup; the new bucket starts full.
    pub fn add_domain_config(&self, config: DomainRateConfig) -> Result<(), AppError> {
        config.validate()?;

        let bucket = Arc::new(Mutex::new(Bucket::new(config.rate_per_sec, config.burst)));
        let domain = config.domain.clone();

        self.buckets.write().unwrap().insert(domain.clone(), bucket);
        self.configs.write().unwrap().insert(domain.clone(), config);

        tracing::info!(domain = %domain, "Added domain rate limiting configuration");
        Ok(())
    }

    /// Effective configuration for a domain (the default when unconfigured).
    pub fn config_for(&self, domain: &str) -> DomainRateConfig {
        self.configs
            .read()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn bucket_for(&self, domain: &str) -> Arc<Mutex<Bucket>> {
        let buckets = self.buckets.read().unwrap();
        buckets
            .get(domain)
            .or_else(|| buckets.get(DEFAULT_DOMAIN))
            .cloned()
            .expect("default bucket always present")
    }

    fn backoff_for(&self, domain: &str) -> Arc<StdMutex<BackoffState>> {
        if let Some(state) = self.backoffs.read().unwrap().get(domain) {
            return state.clone();
        }
        let mut backoffs = self.backoffs.write().unwrap();
        backoffs
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(StdMutex::new(BackoffState::default())))
            .clone()
    }

    /// Non-blocking token check. Consumes a token when one is available.
    pub async fn allow(&self, domain: &str) -> bool {
        let bucket = self.bucket_for(domain);
        let mut bucket = bucket.lock().await;
        bucket.try_take(Instant::now())
    }

    /// Block until the domain's backoff has elapsed and a token is
    /// available, or the token is cancelled.
    ///
    /// Returns `Ok(true)` if the call had to wait for either, `Ok(false)`
    /// if a token was free immediately, and `Err(Cancelled)` if the wait
    /// was interrupted — in which case the reservation is returned to the
    /// bucket and the job must not run.
    pub async fn wait(&self, domain: &str, cancel: &CancellationToken) -> Result<bool, AppError> {
        let mut waited = false;

        let remaining = self.backoff_for(domain).lock().unwrap().remaining();
        if let Some(delay) = remaining {
            tracing::debug!(domain = %domain, backoff_ms = delay.as_millis() as u64, "Domain in backoff period");
            waited = true;
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }

        let bucket = self.bucket_for(domain);
        let ready_at = {
            let mut bucket = bucket.lock().await;
            bucket.reserve(Instant::now())
        };

        if let Some(ready_at) = ready_at {
            waited = true;
            self.waits.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                () = tokio::time::sleep_until(ready_at) => {}
                () = cancel.cancelled() => {
                    bucket.lock().await.release();
                    return Err(AppError::Cancelled);
                }
            }
        }

        Ok(waited)
    }

    /// Record a failure for a domain: failures increment and the backoff
    /// window grows linearly (`base × failures`) up to the configured cap.
    pub fn record_failure(&self, domain: &str) {
        let config = self.config_for(domain);
        let state = self.backoff_for(domain);
        let mut state = state.lock().unwrap();

        state.failures += 1;
        let backoff = config
            .backoff_base
            .saturating_mul(state.failures)
            .min(config.backoff_max);
        state.current = backoff;
        state.last_failure = Some(Instant::now());
    }

    /// Record a success for a domain, resetting its backoff.
    pub fn record_success(&self, domain: &str) {
        let state = self.backoff_for(domain);
        let mut state = state.lock().unwrap();
        state.failures = 0;
        state.current = Duration::ZERO;
    }

    /// Current backoff window for a domain.
    pub fn current_backoff(&self, domain: &str) -> Duration {
        self.backoff_for(domain).lock().unwrap().current
    }

    /// Total number of waits that actually blocked on a token.
    pub fn wait_count(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Metrics for the default domain plus every domain with observed
    /// backoff state or explicit configuration.
    pub fn metrics(&self) -> HashMap<String, DomainRateMetrics> {
        let mut out = HashMap::new();

        let mut domains: Vec<String> = vec![DEFAULT_DOMAIN.to_string()];
        domains.extend(self.configs.read().unwrap().keys().cloned());
        domains.extend(self.backoffs.read().unwrap().keys().cloned());
        domains.sort();
        domains.dedup();

        for domain in domains {
            let config = self.config_for(&domain);
            let state = self.backoff_for(&domain);
            let state = state.lock().unwrap();
            out.insert(
                domain.clone(),
                DomainRateMetrics {
                    domain,
                    rate_per_sec: config.rate_per_sec,
                    burst: config.burst,
                    failure_count: state.failures,
                    current_backoff_ms: state.current.as_millis() as u64,
                    in_backoff: state.remaining().is_some(),
                },
            );
        }

        out
    }
}
