//! Cross-module scenarios for the flow-control machinery: dedup + breaker
//! + rate limiter + pool wired the way the scheduler wires them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use deeper_core::breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitState};
use deeper_core::dedup::{Claim, DedupCache, DedupConfig};
use deeper_core::engine::{EngineConfig, ExpansionEngine, RunOutcome};
use deeper_core::plugin::Registry;
use deeper_core::pool::{PoolConfig, WorkerPool};
use deeper_core::rate_limit::{DomainRateConfig, DomainRateLimiter};
use deeper_core::testutil::{FailingPlugin, MockPlugin, make_job};
use deeper_core::trace::{Trace, TraceKind};

fn fast_limiter() -> Arc<DomainRateLimiter> {
    Arc::new(
        DomainRateLimiter::new(DomainRateConfig {
            rate_per_sec: 10_000.0,
            burst: 1_000,
            ..Default::default()
        })
        .unwrap(),
    )
}

/// S3: a single failing plugin with `failure_threshold=2`. Two jobs run and
/// fail; the third is rejected at pre-flight with the breaker open. Total
/// plugin invocations: exactly two.
#[tokio::test]
async fn breaker_sheds_third_job_after_two_failures() {
    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_millis(100),
        ..Default::default()
    }));
    let cancel = CancellationToken::new();
    let pool = WorkerPool::new(
        PoolConfig {
            workers: 2,
            queue_size: 8,
            task_timeout: Duration::from_secs(5),
        },
        breakers.clone(),
        cancel.clone(),
    );

    let plugin = Arc::new(FailingPlugin::new("always-fails", TraceKind::Email));
    let mut rejected = 0;

    for i in 0..3 {
        let job = make_job(&format!("user{i}@x.com"), TraceKind::Email, plugin.clone());
        let breaker = breakers.get_or_create(&job.plugin_name);
        if !breaker.allow() {
            rejected += 1;
            continue;
        }
        pool.submit(job).await.unwrap();
        let result = pool.get_result().await.unwrap();
        assert!(!result.is_success());
    }

    assert_eq!(plugin.call_count(), 2);
    assert_eq!(rejected, 1);
    assert_eq!(
        breakers.get_or_create("always-fails").state(),
        CircuitState::Open
    );
    assert!(breakers.get_or_create("always-fails").stats().trip_count >= 1);
}

/// Breaker liveness: after the recovery timeout with no further failures,
/// at least one call is admitted again.
#[tokio::test]
async fn breaker_admits_probe_after_recovery_timeout() {
    let breakers = BreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_millis(30),
        ..Default::default()
    });

    let breaker = breakers.get_or_create("flaky");
    breaker.record_result(false);
    assert!(!breaker.allow());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(breaker.allow());
}

/// Dedup soundness: over a multiset of jobs, dispatches equal distinct
/// fingerprints while the cache holds them.
#[tokio::test]
async fn dedup_dispatches_once_per_distinct_fingerprint() {
    let dedup = DedupCache::new(DedupConfig::default());
    let plugin: Arc<MockPlugin> = Arc::new(MockPlugin::empty("noop", TraceKind::Username));

    let values = ["a", "b", "a", "c", "b", "a", "c", "c", "c"];
    let mut dispatched = 0;
    for value in values {
        let job = make_job(value, TraceKind::Username, plugin.clone());
        if dedup.try_claim(job.fingerprint).await == Claim::Claimed {
            dispatched += 1;
        }
    }

    assert_eq!(dispatched, 3);
    let metrics = dedup.metrics();
    assert_eq!(metrics.misses, 3);
    assert_eq!(metrics.hits, 6);
}

/// Cancellation promptness: once the run token fires, no new plugin
/// invocation starts and every wait returns quickly.
#[tokio::test]
async fn cancellation_stops_engine_promptly() {
    // Each username spawns another after a short sleep: an endless chain
    // that only cancellation can stop.
    struct ChainPlugin;

    #[async_trait::async_trait]
    impl deeper_core::plugin::Plugin for ChainPlugin {
        fn name(&self) -> &str {
            "slow-chain"
        }
        fn input_kind(&self) -> TraceKind {
            TraceKind::Username
        }
        async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, deeper_core::AppError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec![Trace::new(
                format!("{}x", trace.value),
                TraceKind::Username,
            )])
        }
    }

    let mut registry = Registry::new();
    registry.register(Arc::new(ChainPlugin)).unwrap();

    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
    let cancel = CancellationToken::new();
    let pool = Arc::new(WorkerPool::new(
        PoolConfig {
            workers: 2,
            queue_size: 8,
            task_timeout: Duration::from_secs(5),
        },
        breakers.clone(),
        cancel.clone(),
    ));
    let engine = ExpansionEngine::new(
        Arc::new(registry),
        pool,
        fast_limiter(),
        breakers,
        Some(Arc::new(DedupCache::new(DedupConfig::default()))),
        EngineConfig::default(),
    );

    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run("testuser", cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();

    let report = run.await.unwrap().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    // Partial results are preserved: at least the seed.
    assert!(!report.traces.is_empty());
}

/// A plugin emitting empty-valued traces never grows the frontier.
#[tokio::test]
async fn empty_trace_values_are_filtered() {
    let mut registry = Registry::new();
    registry
        .register(Arc::new(MockPlugin::emitting(
            "empty-emitter",
            TraceKind::Username,
            vec![
                Trace::new("", TraceKind::Domain),
                Trace::new("real.example.com", TraceKind::Domain),
            ],
        )))
        .unwrap();

    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
    let cancel = CancellationToken::new();
    let pool = Arc::new(WorkerPool::new(
        PoolConfig::default(),
        breakers.clone(),
        cancel.clone(),
    ));
    let engine = ExpansionEngine::new(
        Arc::new(registry),
        pool,
        fast_limiter(),
        breakers,
        Some(Arc::new(DedupCache::new(DedupConfig::default()))),
        EngineConfig::default(),
    );

    let report = engine.run("testuser", cancel).await.unwrap();
    assert_eq!(report.traces.len(), 2);
    assert!(report.traces.iter().all(|t| !t.value.is_empty()));
}
