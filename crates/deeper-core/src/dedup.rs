//! Content-addressed deduplication with LRU eviction.
//!
//! The cache answers one question atomically: "has a job with this
//! fingerprint already been submitted?" Exactly one of any set of
//! concurrent callers with the same fingerprint receives [`Claim::Claimed`];
//! the rest receive [`Claim::Duplicate`].
//!
//! An optional persistent backend extends dedup across runs. It is strictly
//! best-effort: lookup errors are logged and treated as a miss, and writes
//! happen in the background so a slow or broken store never blocks the
//! expansion.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::AppError;
use crate::job::Fingerprint;

/// Outcome of [`DedupCache::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The fingerprint was not cached; it is now. Submit the job.
    Claimed,
    /// The fingerprint was already cached. Drop the job.
    Duplicate,
}

/// Optional persistent dedup backend (e.g. a local SQL cache table).
pub trait PersistentDedup: Send + Sync + Clone + 'static {
    /// Whether the key is present (and unexpired) in the backend.
    fn get(&self, key: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Record the key with an optional time-to-live.
    fn put(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// No-op backend for the memory-only configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDedupStore;

impl PersistentDedup for NullDedupStore {
    async fn get(&self, _key: &str) -> Result<bool, AppError> {
        Ok(false)
    }

    async fn put(&self, _key: &str, _ttl: Option<Duration>) -> Result<(), AppError> {
        Ok(())
    }
}

/// Dedup cache configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum number of fingerprints held in memory.
    pub capacity: usize,

    /// Entries older than this are treated as absent on the next claim.
    pub ttl: Option<Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: None,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DedupMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

struct LruEntry {
    stamp: u64,
    inserted_at: Instant,
}

/// Stamped LRU: the order queue may hold stale entries for recently touched
/// fingerprints; eviction skips entries whose stamp no longer matches.
#[derive(Default)]
struct LruInner {
    map: HashMap<Fingerprint, LruEntry>,
    order: VecDeque<(u64, Fingerprint)>,
    next_stamp: u64,
}

impl LruInner {
    fn touch(&mut self, fingerprint: Fingerprint) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        if let Some(entry) = self.map.get_mut(&fingerprint) {
            entry.stamp = stamp;
            self.order.push_back((stamp, fingerprint));
        }
    }

    fn insert(&mut self, fingerprint: Fingerprint) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.map.insert(
            fingerprint,
            LruEntry {
                stamp,
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back((stamp, fingerprint));
    }

    /// Remove least-recently-used entries until the map fits `capacity`.
    /// Returns how many live entries were evicted.
    fn evict_to(&mut self, capacity: usize) -> u64 {
        let mut evicted = 0;
        while self.map.len() > capacity {
            let Some((stamp, fingerprint)) = self.order.pop_front() else {
                break;
            };
            let live = self
                .map
                .get(&fingerprint)
                .is_some_and(|entry| entry.stamp == stamp);
            if live {
                self.map.remove(&fingerprint);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Bounded content-addressable set with LRU eviction and optional TTL.
pub struct DedupCache<P: PersistentDedup = NullDedupStore> {
    config: DedupConfig,
    inner: Mutex<LruInner>,
    store: Option<P>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    size: AtomicU64,
}

impl DedupCache<NullDedupStore> {
    /// Memory-only cache.
    pub fn new(config: DedupConfig) -> Self {
        Self::with_store(config, None)
    }
}

impl<P: PersistentDedup> DedupCache<P> {
    pub fn with_store(config: DedupConfig, store: Option<P>) -> Self {
        Self {
            config,
            inner: Mutex::new(LruInner::default()),
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            size: AtomicU64::new(0),
        }
    }

    /// Atomic test-and-insert.
    ///
    /// The whole check runs under one lock, so concurrent callers with the
    /// same fingerprint serialise and exactly one wins the claim.
    pub async fn try_claim(&self, fingerprint: Fingerprint) -> Claim {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.map.get(&fingerprint) {
            let expired = self
                .config
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl);
            if expired {
                inner.map.remove(&fingerprint);
            } else {
                inner.touch(fingerprint);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Claim::Duplicate;
            }
        }

        if let Some(store) = &self.store {
            match store.get(&fingerprint.to_hex()).await {
                Ok(true) => {
                    inner.insert(fingerprint);
                    let evicted = inner.evict_to(self.config.capacity);
                    self.evictions.fetch_add(evicted, Ordering::Relaxed);
                    self.size.store(inner.map.len() as u64, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Claim::Duplicate;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %e, "Persistent dedup lookup failed");
                }
            }
        }

        inner.insert(fingerprint);
        let evicted = inner.evict_to(self.config.capacity);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.size.store(inner.map.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        drop(inner);

        if let Some(store) = &self.store {
            let store = store.clone();
            let key = fingerprint.to_hex();
            let ttl = self.config.ttl;
            tokio::spawn(async move {
                if let Err(e) = store.put(&key, ttl).await {
                    tracing::warn!(key = %key, error = %e, "Persistent dedup write failed");
                }
            });
        }

        Claim::Claimed
    }

    pub fn metrics(&self) -> DedupMetrics {
        DedupMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }
}
