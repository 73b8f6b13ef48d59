//! deeper-core: the concurrency and flow-control core of the deeper
//! trace-expansion engine.
//!
//! A seed string is classified into a [`Trace`], dispatched to every
//! registered [`Plugin`] for its kind, and the newly emitted traces are fed
//! back into the frontier until nothing unseen remains. This crate holds
//! the machinery that keeps that loop bounded and polite: the worker pool,
//! the dedup cache, the per-domain rate limiter, the circuit breakers, and
//! the batched scheduler itself. Plugins that talk to the network live
//! elsewhere and reach this crate only through the [`Plugin`] trait.

pub mod breaker;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod engine;
pub mod error;
pub mod job;
pub mod plugin;
pub mod pool;
pub mod rate_limit;
pub mod testutil;
pub mod trace;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::AppConfig;
pub use dedup::{Claim, DedupCache, DedupConfig, NullDedupStore, PersistentDedup};
pub use engine::{EngineConfig, ExpansionEngine, ExpansionReport, RunOutcome, RunStats};
pub use error::AppError;
pub use job::{Fingerprint, Job, JobResult};
pub use plugin::{Plugin, Registry};
pub use pool::{PoolConfig, PoolMetricsSnapshot, WorkerPool};
pub use rate_limit::{DomainRateConfig, DomainRateLimiter};
pub use trace::{Trace, TraceKind};
