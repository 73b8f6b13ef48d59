//! Bounded worker pool.
//!
//! `W` worker tasks consume from a buffered job queue of capacity `Q`.
//! Callers perform pre-flight (dedup → breaker → rate limit) before
//! submitting; the pool's job is to bound concurrency, enforce the per-job
//! timeout, report outcomes to the breaker under the plugin-name key, and
//! post results to an unbounded result channel.
//!
//! `W` is the bound on concurrent plugin invocations: a worker holds its
//! job from dequeue until the result is posted.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::error::AppError;
use crate::job::{Job, JobResult};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers (`W`).
    pub workers: usize,
    /// Job queue capacity (`Q`).
    pub queue_size: usize,
    /// Per-job timeout; expiry is a `Timeout` error and a breaker failure.
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_size: 1000,
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Lock-free pool counters. Pre-flight counters (`dedup_hits`,
/// `rate_limit_waits`, `breaker_trips`) are incremented by the submitting
/// side; the rest by the workers. Queue length is read off the channel
/// itself, so it never over-reports capacity.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub active_workers: AtomicI64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub rate_limit_waits: AtomicU64,
    pub breaker_trips: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub active_workers: i64,
    pub queue_len: i64,
    pub queue_capacity: usize,
    pub processed: u64,
    pub failed: u64,
    pub dedup_hits: u64,
    pub rate_limit_waits: u64,
    pub breaker_trips: u64,
}

impl PoolMetrics {
    fn snapshot(&self, queue_len: i64, queue_capacity: usize) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            queue_len,
            queue_capacity,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
        }
    }
}

/// Bounded set of workers consuming a job queue.
pub struct WorkerPool {
    config: PoolConfig,
    job_tx: mpsc::Sender<Job>,
    results: Mutex<mpsc::UnboundedReceiver<JobResult>>,
    metrics: Arc<PoolMetrics>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `W` workers. The pool shares the caller's breaker registry so
    /// pre-flight checks and worker feedback see the same circuits, and the
    /// caller's cancellation token so one cancel reaches every suspension
    /// point.
    pub fn new(
        config: PoolConfig,
        breakers: Arc<BreakerRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>(config.queue_size.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel::<JobResult>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let metrics = Arc::new(PoolMetrics::default());

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers.max(1) {
            handles.push(spawn_worker(
                worker_id,
                job_rx.clone(),
                result_tx.clone(),
                breakers.clone(),
                metrics.clone(),
                cancel.clone(),
                config.task_timeout,
            ));
        }

        Self {
            config,
            job_tx,
            results: Mutex::new(result_rx),
            metrics,
            cancel,
            shutting_down: AtomicBool::new(false),
            workers: StdMutex::new(handles),
        }
    }

    /// Submit a job, blocking while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), AppError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AppError::PoolShuttingDown);
        }

        tokio::select! {
            sent = self.job_tx.send(job) => sent.map_err(|_| AppError::PoolShuttingDown),
            () = self.cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    /// Non-blocking submit; fails with `QueueFull` on a saturated queue.
    pub fn try_submit(&self, job: Job) -> Result<(), AppError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(AppError::PoolShuttingDown);
        }

        match self.job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AppError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AppError::PoolShuttingDown),
        }
    }

    /// Receive the next job result. Results arrive in completion order.
    /// After cancellation, results already completed are still drained
    /// before the call reports `Cancelled`.
    pub async fn get_result(&self) -> Result<JobResult, AppError> {
        let mut results = self.results.lock().await;
        tokio::select! {
            biased;
            result = results.recv() => result.ok_or(AppError::PoolShuttingDown),
            () = self.cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        let queue_len = self.config.queue_size.saturating_sub(self.job_tx.capacity()) as i64;
        self.metrics.snapshot(queue_len, self.config.queue_size)
    }

    /// Signal all workers and wait for in-flight jobs up to `deadline`.
    /// Workers still running after the deadline are abandoned and their
    /// results dropped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), AppError> {
        self.shutting_down.store(true, Ordering::Release);
        self.cancel.cancel();

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };

        let deadline_at = tokio::time::Instant::now() + deadline;
        for handle in handles {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                tracing::warn!("Worker pool shutdown deadline expired with jobs in flight");
                return Err(AppError::ShutdownTimeout);
            }
        }
        Ok(())
    }
}

fn spawn_worker(
    worker_id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    result_tx: mpsc::UnboundedSender<JobResult>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<PoolMetrics>,
    cancel: CancellationToken,
    task_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(worker_id, "Worker started");

        loop {
            let job = {
                let mut rx = job_rx.lock().await;
                tokio::select! {
                    job = rx.recv() => job,
                    () = cancel.cancelled() => None,
                }
            };

            let Some(job) = job else { break };
            process_job(job, &result_tx, &breakers, &metrics, &cancel, task_timeout).await;
        }

        tracing::debug!(worker_id, "Worker stopped");
    })
}

async fn process_job(
    job: Job,
    result_tx: &mpsc::UnboundedSender<JobResult>,
    breakers: &BreakerRegistry,
    metrics: &PoolMetrics,
    cancel: &CancellationToken,
    task_timeout: Duration,
) {
    metrics.active_workers.fetch_add(1, Ordering::Relaxed);
    let start = std::time::Instant::now();

    let outcome = tokio::select! {
        () = cancel.cancelled() => Err(AppError::Cancelled),
        invoked = tokio::time::timeout(task_timeout, job.plugin.expand(&job.input)) => {
            match invoked {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(task_timeout)),
            }
        }
    };
    let duration = start.elapsed();

    let breaker = breakers.get_or_create(&job.plugin_name);
    match &outcome {
        Ok(_) => breaker.record_result(true),
        Err(e) if e.should_trip_circuit() => breaker.record_result(false),
        Err(_) => breaker.record_unjudged(),
    }

    metrics.processed.fetch_add(1, Ordering::Relaxed);
    let (emitted, error) = match outcome {
        Ok(emitted) => (emitted, None),
        Err(e) => {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                job_id = %job.id,
                plugin = %job.plugin_name,
                error = %e,
                "Job failed"
            );
            (Vec::new(), Some(e))
        }
    };

    let result = JobResult {
        job_id: job.id,
        plugin_name: job.plugin_name,
        domain: job.domain,
        emitted,
        error,
        duration,
    };

    metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
    if result_tx.send(result).is_err() {
        tracing::debug!("Result channel closed, dropping job result");
    }
}
