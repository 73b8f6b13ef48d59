//! Test utilities: mock plugins and a recording dedup backend.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. Mocks use `Arc<Mutex<_>>` interior mutability so tests can
//! assert on recorded calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::dedup::PersistentDedup;
use crate::error::AppError;
use crate::job::Job;
use crate::plugin::Plugin;
use crate::trace::{Trace, TraceKind};

// ---------------------------------------------------------------------------
// MockPlugin
// ---------------------------------------------------------------------------

/// Plugin returning scripted responses. Each call pops the first scripted
/// response; when the script is exhausted the default response is returned.
pub struct MockPlugin {
    name: String,
    kind: TraceKind,
    responses: Mutex<Vec<Result<Vec<Trace>, AppError>>>,
    default_response: Vec<Trace>,
    calls: AtomicU64,
}

impl MockPlugin {
    /// Plugin that always emits nothing.
    pub fn empty(name: &str, kind: TraceKind) -> Self {
        Self::emitting(name, kind, Vec::new())
    }

    /// Plugin that emits the same traces on every call.
    pub fn emitting(name: &str, kind: TraceKind, traces: Vec<Trace>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            responses: Mutex::new(Vec::new()),
            default_response: traces,
            calls: AtomicU64::new(0),
        }
    }

    /// Plugin with a per-call script; emits nothing once exhausted.
    pub fn with_responses(
        name: &str,
        kind: TraceKind,
        responses: Vec<Result<Vec<Trace>, AppError>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            responses: Mutex::new(responses),
            default_response: Vec::new(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> TraceKind {
        self.kind
    }

    async fn expand(&self, _trace: &Trace) -> Result<Vec<Trace>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// FailingPlugin
// ---------------------------------------------------------------------------

/// Plugin that always fails with a `PluginError`.
pub struct FailingPlugin {
    name: String,
    kind: TraceKind,
    calls: AtomicU64,
}

impl FailingPlugin {
    pub fn new(name: &str, kind: TraceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> TraceKind {
        self.kind
    }

    async fn expand(&self, _trace: &Trace) -> Result<Vec<Trace>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::PluginError {
            plugin: self.name.clone(),
            message: "scripted failure".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// SleepPlugin
// ---------------------------------------------------------------------------

/// Plugin that sleeps before emitting nothing. For timeout and
/// concurrency-bound tests.
pub struct SleepPlugin {
    name: String,
    kind: TraceKind,
    delay: Duration,
}

impl SleepPlugin {
    pub fn new(name: &str, kind: TraceKind, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            kind,
            delay,
        }
    }
}

#[async_trait]
impl Plugin for SleepPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> TraceKind {
        self.kind
    }

    async fn expand(&self, _trace: &Trace) -> Result<Vec<Trace>, AppError> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// RecordingDedupStore
// ---------------------------------------------------------------------------

/// In-memory persistent-dedup backend that records written keys, or fails
/// every operation when constructed with [`RecordingDedupStore::failing`].
#[derive(Clone)]
pub struct RecordingDedupStore {
    keys: Arc<Mutex<HashSet<String>>>,
    fail: bool,
}

impl RecordingDedupStore {
    pub fn empty() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
            fail: false,
        }
    }

    pub fn with_key(key: &str) -> Self {
        let store = Self::empty();
        store.keys.lock().unwrap().insert(key.to_string());
        store
    }

    pub fn failing() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
            fail: true,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().unwrap().contains(key)
    }
}

impl PersistentDedup for RecordingDedupStore {
    async fn get(&self, key: &str) -> Result<bool, AppError> {
        if self.fail {
            return Err(AppError::DatabaseError("scripted failure".into()));
        }
        Ok(self.contains(key))
    }

    async fn put(&self, key: &str, _ttl: Option<Duration>) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::DatabaseError("scripted failure".into()));
        }
        self.keys.lock().unwrap().insert(key.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a job for a raw value, kind, and plugin handle.
pub fn make_job(value: &str, kind: TraceKind, plugin: Arc<dyn Plugin>) -> Job {
    Job::new(Trace::new(value, kind), plugin).expect("job construction")
}
