//! The expansion scheduler.
//!
//! Drives the recursive crawl: classify the seed, expand the frontier in
//! batches through the worker pool, filter emitted traces against the
//! seen-set, and repeat until no unseen traces remain (or a budget or
//! cancellation stops the run early — partial results are always returned).
//!
//! Expansion is batched rather than fully pipelined: the seen-set is
//! consulted at submission and again on result arrival, and each batch is a
//! deterministic merge point for newly discovered traces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::dedup::{Claim, DedupCache, NullDedupStore, PersistentDedup};
use crate::error::AppError;
use crate::job::Job;
use crate::plugin::Registry;
use crate::pool::WorkerPool;
use crate::rate_limit::DomainRateLimiter;
use crate::trace::{MAX_VALUE_LEN, Trace};

/// Scheduler knobs. `batch_size` is deliberately separate from the worker
/// count: one bounds discovery granularity, the other I/O concurrency.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Traces taken from the frontier per batch.
    pub batch_size: usize,
    /// Stop once this many unique traces have been discovered.
    pub max_traces: Option<usize>,
    /// Stop once the run has lasted this long.
    pub max_duration: Option<Duration>,
    /// Traces at this depth are reported but not expanded.
    pub max_depth: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_traces: None,
            max_duration: None,
            max_depth: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Frontier drained; every reachable trace was expanded.
    Completed,
    /// The run context was cancelled; results are partial.
    Cancelled,
    /// A time or trace budget stopped the run; results are partial.
    BudgetExhausted,
}

/// Scheduler-level counters for one run.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RunStats {
    pub batches: u64,
    pub submitted: u64,
    pub succeeded: u64,
    pub plugin_errors: u64,
    pub skipped_no_plugins: u64,
    pub skipped_depth: u64,
    pub dropped_duplicate: u64,
    pub dropped_breaker_open: u64,
    pub dropped_cancelled: u64,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct ExpansionReport {
    pub seed: Trace,
    /// Unique traces in discovery order, seed first.
    pub traces: Vec<Trace>,
    pub outcome: RunOutcome,
    pub stats: RunStats,
    pub duration: Duration,
}

/// The expansion engine. Wires the registry, pool, limiter, breakers, and
/// dedup cache together; all shared state arrives explicitly at
/// construction.
pub struct ExpansionEngine<P: PersistentDedup = NullDedupStore> {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    limiter: Arc<DomainRateLimiter>,
    breakers: Arc<BreakerRegistry>,
    dedup: Option<Arc<DedupCache<P>>>,
    config: EngineConfig,
}

impl<P: PersistentDedup> ExpansionEngine<P> {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        limiter: Arc<DomainRateLimiter>,
        breakers: Arc<BreakerRegistry>,
        dedup: Option<Arc<DedupCache<P>>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            limiter,
            breakers,
            dedup,
            config,
        }
    }

    /// Run one expansion from a raw seed string.
    ///
    /// Per-job errors are downgraded to metrics and debug logs; only
    /// classification and construction errors surface as `Err`.
    /// Cancellation and budget exhaustion return `Ok` with partial results
    /// and the corresponding [`RunOutcome`].
    pub async fn run(
        &self,
        seed: &str,
        cancel: CancellationToken,
    ) -> Result<ExpansionReport, AppError> {
        let seed_trace = Trace::classify(seed)?;
        tracing::info!(seed = %seed_trace, "Starting expansion run");

        let start = Instant::now();
        let mut stats = RunStats::default();
        let mut outcome = RunOutcome::Completed;

        // Frontier entries carry their discovery depth. A trace enters the
        // seen-set when it is enqueued, which is what breaks cycles.
        let mut seen: HashSet<Trace> = HashSet::new();
        let mut discovered: Vec<Trace> = Vec::new();
        let mut frontier: VecDeque<(Trace, u32)> = VecDeque::new();

        seen.insert(seed_trace.clone());
        discovered.push(seed_trace.clone());
        frontier.push_back((seed_trace.clone(), 0));

        'run: while !frontier.is_empty() {
            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            if let Some(budget) = self.config.max_duration
                && start.elapsed() >= budget
            {
                tracing::info!("Time budget exhausted, stopping expansion");
                outcome = RunOutcome::BudgetExhausted;
                break;
            }
            if let Some(budget) = self.config.max_traces
                && seen.len() >= budget
            {
                tracing::info!("Trace budget exhausted, stopping expansion");
                outcome = RunOutcome::BudgetExhausted;
                break;
            }

            stats.batches += 1;
            let mut batch = Vec::with_capacity(self.config.batch_size);
            while batch.len() < self.config.batch_size {
                match frontier.pop_front() {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }

            let mut submitted = 0u64;
            let mut depths: HashMap<Uuid, u32> = HashMap::new();

            'submit: for (trace, depth) in &batch {
                let plugins = self.registry.lookup(trace.kind);
                if plugins.is_empty() {
                    tracing::debug!(trace = %trace, "No plugins for trace kind");
                    stats.skipped_no_plugins += 1;
                    continue;
                }
                if let Some(max_depth) = self.config.max_depth
                    && *depth >= max_depth
                {
                    stats.skipped_depth += 1;
                    continue;
                }

                for plugin in plugins {
                    let job = Job::new(trace.clone(), plugin.clone())?;

                    // Pre-flight, in order: dedup → breaker → rate limit.
                    if let Some(dedup) = &self.dedup
                        && dedup.try_claim(job.fingerprint).await == Claim::Duplicate
                    {
                        tracing::debug!(job = ?job, "Duplicate job suppressed");
                        self.pool.metrics().dedup_hits.fetch_add(1, Ordering::Relaxed);
                        stats.dropped_duplicate += 1;
                        continue;
                    }

                    let breaker = self.breakers.get_or_create(&job.plugin_name);
                    if !breaker.allow() {
                        tracing::debug!(plugin = %job.plugin_name, "Circuit open, dropping job");
                        self.pool.metrics().breaker_trips.fetch_add(1, Ordering::Relaxed);
                        stats.dropped_breaker_open += 1;
                        continue;
                    }

                    match self.limiter.wait(&job.domain, &cancel).await {
                        Ok(waited) => {
                            if waited {
                                self.pool.metrics().rate_limit_waits.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(AppError::Cancelled) => {
                            breaker.record_unjudged();
                            stats.dropped_cancelled += 1;
                            outcome = RunOutcome::Cancelled;
                            break 'submit;
                        }
                        Err(e) => return Err(e),
                    }

                    let job_id = job.id;
                    match self.pool.submit(job).await {
                        Ok(()) => {
                            submitted += 1;
                            depths.insert(job_id, *depth);
                        }
                        Err(AppError::Cancelled | AppError::PoolShuttingDown) => {
                            breaker.record_unjudged();
                            stats.dropped_cancelled += 1;
                            outcome = RunOutcome::Cancelled;
                            break 'submit;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            stats.submitted += submitted;

            // Read exactly as many results as this batch submitted.
            for _ in 0..submitted {
                let result = match self.pool.get_result().await {
                    Ok(result) => result,
                    Err(AppError::Cancelled | AppError::PoolShuttingDown) => {
                        outcome = RunOutcome::Cancelled;
                        break 'run;
                    }
                    Err(e) => return Err(e),
                };

                match &result.error {
                    None => {
                        stats.succeeded += 1;
                        self.limiter.record_success(&result.domain);
                    }
                    Some(e) if e.should_trip_circuit() => {
                        stats.plugin_errors += 1;
                        self.limiter.record_failure(&result.domain);
                        tracing::debug!(
                            plugin = %result.plugin_name,
                            error = %e,
                            "Plugin call failed"
                        );
                    }
                    Some(_) => {
                        stats.dropped_cancelled += 1;
                    }
                }

                let depth = depths.get(&result.job_id).copied().unwrap_or(0);
                for trace in result.emitted {
                    if trace.value.is_empty() || trace.value.len() > MAX_VALUE_LEN {
                        continue;
                    }
                    if seen.insert(trace.clone()) {
                        discovered.push(trace.clone());
                        frontier.push_back((trace, depth + 1));
                    }
                }
            }
        }

        let duration = start.elapsed();
        tracing::info!(
            traces = discovered.len(),
            batches = stats.batches,
            outcome = ?outcome,
            elapsed_ms = duration.as_millis() as u64,
            "Expansion run finished"
        );

        Ok(ExpansionReport {
            seed: seed_trace,
            traces: discovered,
            outcome,
            stats,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::dedup::DedupConfig;
    use crate::pool::PoolConfig;
    use crate::rate_limit::DomainRateConfig;
    use crate::testutil::{FailingPlugin, MockPlugin};
    use crate::trace::TraceKind;

    struct Harness {
        registry: Registry,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
            }
        }

        fn add(&mut self, plugin: Arc<dyn crate::plugin::Plugin>) -> &mut Self {
            self.registry.register(plugin).unwrap();
            self
        }

        fn engine(self, config: EngineConfig) -> (ExpansionEngine, CancellationToken) {
            let cancel = CancellationToken::new();
            let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
            let pool = Arc::new(WorkerPool::new(
                PoolConfig {
                    workers: 4,
                    queue_size: 64,
                    task_timeout: Duration::from_secs(5),
                },
                breakers.clone(),
                cancel.clone(),
            ));
            let limiter =
                Arc::new(DomainRateLimiter::new(DomainRateConfig {
                    rate_per_sec: 10_000.0,
                    burst: 1_000,
                    ..Default::default()
                })
                .unwrap());
            let dedup = Some(Arc::new(DedupCache::new(DedupConfig::default())));
            let engine = ExpansionEngine::new(
                Arc::new(self.registry),
                pool,
                limiter,
                breakers,
                dedup,
                config,
            );
            (engine, cancel)
        }
    }

    #[tokio::test]
    async fn test_email_seed_expands_to_username_and_domain() {
        // S1: no domain plugin registered, so the run terminates after the
        // second batch discovers nothing expandable.
        let mut harness = Harness::new();
        harness
            .add(Arc::new(MockPlugin::emitting(
                "username-extractor",
                TraceKind::Email,
                vec![Trace::new("test", TraceKind::Username)],
            )))
            .add(Arc::new(MockPlugin::emitting(
                "mail-host",
                TraceKind::Email,
                vec![Trace::new("example.com", TraceKind::Domain)],
            )));

        let (engine, cancel) = harness.engine(EngineConfig::default());
        let report = engine.run("test@example.com", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let expected: HashSet<Trace> = [
            Trace::new("test@example.com", TraceKind::Email),
            Trace::new("test", TraceKind::Username),
            Trace::new("example.com", TraceKind::Domain),
        ]
        .into_iter()
        .collect();
        let seen: HashSet<Trace> = report.traces.iter().cloned().collect();
        assert_eq!(seen, expected);
        assert_eq!(report.traces[0].kind, TraceKind::Email);
    }

    #[tokio::test]
    async fn test_dedup_suppresses_repeat_invocations() {
        // S2: the plugin would emit the same subdomains forever; dedup and
        // the seen-set hold invocations to one.
        let plugin = Arc::new(MockPlugin::emitting(
            "fake-subdomains",
            TraceKind::Domain,
            vec![
                Trace::new("a.example.com", TraceKind::Subdomain),
                Trace::new("b.example.com", TraceKind::Subdomain),
            ],
        ));
        let mut harness = Harness::new();
        harness.add(plugin.clone());

        let (engine, cancel) = harness.engine(EngineConfig::default());
        let report = engine.run("example.com", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.traces.len(), 3);
        assert_eq!(plugin.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ip_seed_geolocation_terminates() {
        // S6: nothing is registered for geolocation, so one batch suffices.
        let mut harness = Harness::new();
        harness.add(Arc::new(MockPlugin::emitting(
            "fake-geo",
            TraceKind::Ip,
            vec![Trace::new("Helsinki, FI", TraceKind::Geolocation)],
        )));

        let (engine, cancel) = harness.engine(EngineConfig::default());
        let report = engine.run("192.0.2.1", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.traces.len(), 2);
        assert_eq!(report.seed.kind, TraceKind::Ip);
        assert_eq!(report.stats.skipped_no_plugins, 1);
    }

    #[tokio::test]
    async fn test_cyclic_plugin_graph_terminates() {
        // domain → url → domain: the seen-set breaks the cycle without any
        // depth limit.
        let mut harness = Harness::new();
        harness
            .add(Arc::new(MockPlugin::emitting(
                "url-builder",
                TraceKind::Domain,
                vec![Trace::new("https://example.com", TraceKind::Url)],
            )))
            .add(Arc::new(MockPlugin::emitting(
                "url-host",
                TraceKind::Url,
                vec![Trace::new("example.com", TraceKind::Domain)],
            )));

        let (engine, cancel) = harness.engine(EngineConfig::default());
        let report = engine.run("example.com", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.traces.len(), 2);
    }

    #[tokio::test]
    async fn test_identical_runs_discover_identical_sets() {
        let build = || {
            let mut harness = Harness::new();
            harness
                .add(Arc::new(MockPlugin::emitting(
                    "username-extractor",
                    TraceKind::Email,
                    vec![Trace::new("test", TraceKind::Username)],
                )))
                .add(Arc::new(MockPlugin::emitting(
                    "mail-host",
                    TraceKind::Email,
                    vec![Trace::new("example.com", TraceKind::Domain)],
                )));
            harness.engine(EngineConfig::default())
        };

        let (engine_a, cancel_a) = build();
        let (engine_b, cancel_b) = build();
        let a = engine_a.run("test@example.com", cancel_a).await.unwrap();
        let b = engine_b.run("test@example.com", cancel_b).await.unwrap();

        let seen_a: HashSet<Trace> = a.traces.into_iter().collect();
        let seen_b: HashSet<Trace> = b.traces.into_iter().collect();
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn test_plugin_failures_do_not_abort_run() {
        let mut harness = Harness::new();
        harness
            .add(Arc::new(FailingPlugin::new("broken", TraceKind::Email)))
            .add(Arc::new(MockPlugin::emitting(
                "mail-host",
                TraceKind::Email,
                vec![Trace::new("example.com", TraceKind::Domain)],
            )));

        let (engine, cancel) = harness.engine(EngineConfig::default());
        let report = engine.run("test@example.com", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stats.plugin_errors, 1);
        assert_eq!(report.stats.succeeded, 1);
        assert_eq!(report.traces.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_seed_surfaces_immediately() {
        let (engine, cancel) = Harness::new().engine(EngineConfig::default());
        let err = engine.run("", cancel).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_trace_budget_stops_run() {
        // An endless chain of fresh usernames; the budget must stop it.
        struct Counter;
        #[async_trait::async_trait]
        impl crate::plugin::Plugin for Counter {
            fn name(&self) -> &str {
                "counter"
            }
            fn input_kind(&self) -> TraceKind {
                TraceKind::Username
            }
            async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError> {
                Ok(vec![Trace::new(
                    format!("{}x", trace.value),
                    TraceKind::Username,
                )])
            }
        }

        let mut harness = Harness::new();
        harness.add(Arc::new(Counter));

        let (engine, cancel) = harness.engine(EngineConfig {
            max_traces: Some(5),
            ..Default::default()
        });
        let report = engine.run("seed", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
        assert!(report.traces.len() <= 6);
    }

    #[tokio::test]
    async fn test_depth_cap_reports_but_does_not_expand() {
        let mut harness = Harness::new();
        harness
            .add(Arc::new(MockPlugin::emitting(
                "mail-host",
                TraceKind::Email,
                vec![Trace::new("example.com", TraceKind::Domain)],
            )))
            .add(Arc::new(MockPlugin::emitting(
                "fake-subdomains",
                TraceKind::Domain,
                vec![Trace::new("a.example.com", TraceKind::Subdomain)],
            )));

        let (engine, cancel) = harness.engine(EngineConfig {
            max_depth: Some(1),
            ..Default::default()
        });
        let report = engine.run("test@example.com", cancel).await.unwrap();

        // The domain is discovered at depth 1 and reported, but not fed to
        // the subdomain plugin.
        assert_eq!(report.traces.len(), 2);
        assert_eq!(report.stats.skipped_depth, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_returns_empty_partial() {
        let mut harness = Harness::new();
        harness.add(Arc::new(MockPlugin::emitting(
            "mail-host",
            TraceKind::Email,
            vec![Trace::new("example.com", TraceKind::Domain)],
        )));

        let (engine, cancel) = harness.engine(EngineConfig::default());
        cancel.cancel();
        let report = engine.run("test@example.com", cancel).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.traces.len(), 1);
        assert_eq!(report.stats.submitted, 0);
    }
}
