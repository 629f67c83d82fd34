use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::backend::{Backend, InMemoryBackend};
use crate::config::DEFAULT_CAPACITY;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::singleflight::CallGroup;
use crate::utils::defer;

/// The outcome of one computation: the value, and optionally an explicit
/// time-to-live that takes precedence over the cache's configured windows.
///
/// An explicit duration `t` yields a freshness window of `t` and a hard
/// expiry of `2 * t`; an explicit zero means the result is fanned out to the
/// coalesced callers but never retained.
#[derive(Debug, Clone)]
pub struct Computed<V> {
    pub value: V,
    pub ttl: Option<Duration>,
}

impl<V> Computed<V> {
    pub fn new(value: V) -> Self {
        Computed { value, ttl: None }
    }

    pub fn with_ttl(value: V, ttl: Duration) -> Self {
        Computed {
            value,
            ttl: Some(ttl),
        }
    }
}

impl<V> From<V> for Computed<V> {
    fn from(value: V) -> Self {
        Computed::new(value)
    }
}

struct Inner<K, V> {
    /// The entry table. `None` disables the cache tier entirely, leaving
    /// only call coalescing. Reads take the read half, stores the write
    /// half; computations run outside of either.
    backend: Option<RwLock<Box<dyn Backend<K, V>>>>,

    fresh_for: Duration,
    ttl: Duration,

    /// Deduplicates concurrent computations per key.
    calls: CallGroup<K, Computed<V>>,

    /// Keys with a background refresh currently in flight.
    refreshes: Mutex<HashSet<K>>,
}

/// A process-local cache that shields its compute function from stampedes.
///
/// Concurrent lookups for the same key are coalesced into a single
/// execution whose result is fanned out to every caller, and successful
/// results are kept in a bounded entry table with a two-tier freshness
/// window: *fresh* entries are served as-is, *stale* entries are served
/// immediately while a deduplicated refresh runs in the background, and
/// *expired* entries are recomputed synchronously.
///
/// Each instance owns its entry table and its in-flight call table, so
/// independent caches never interfere; clones share the same state.
pub struct CoalescingCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CoalescingCache<K, V> {
    fn clone(&self) -> Self {
        CoalescingCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for CoalescingCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let refreshes = self
            .inner
            .refreshes
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("fresh_for", &self.inner.fresh_for)
            .field("ttl", &self.inner.ttl)
            .field("cache enabled", &self.inner.backend.is_some())
            .field("running refreshes", &refreshes)
            .finish()
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache over the internal bounded in-memory store.
    ///
    /// Entries are fresh for `fresh_for` and dropped after `ttl`.
    pub fn new(fresh_for: Duration, ttl: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, fresh_for, ttl)
    }

    /// Like [`new`](Self::new), with an explicit entry capacity.
    pub fn with_capacity(capacity: u64, fresh_for: Duration, ttl: Duration) -> Self {
        Self::with_backend(InMemoryBackend::new(capacity), fresh_for, ttl)
    }

    /// Creates a cache over a caller-supplied backend.
    pub fn with_backend<B>(backend: B, fresh_for: Duration, ttl: Duration) -> Self
    where
        B: Backend<K, V> + 'static,
    {
        CoalescingCache {
            inner: Arc::new(Inner {
                backend: Some(RwLock::new(Box::new(backend))),
                fresh_for,
                ttl,
                calls: CallGroup::new(),
                refreshes: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Creates a cache without an entry table: concurrent callers are still
    /// coalesced, but nothing is retained once a result has been fanned out.
    pub fn coalescing_only() -> Self {
        CoalescingCache {
            inner: Arc::new(Inner {
                backend: None,
                fresh_for: Duration::ZERO,
                ttl: Duration::ZERO,
                calls: CallGroup::new(),
                refreshes: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Returns the value for `key`, computing it at most once across all
    /// concurrent callers.
    ///
    /// A fresh entry is returned without running `compute` at all. A stale
    /// entry is returned immediately as well, with a refresh scheduled in
    /// the background; refresh failures are logged and never surfaced here.
    /// A missing or expired entry is computed synchronously.
    pub async fn get<F, Fut>(&self, key: K, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<V>, CacheError>> + Send + 'static,
    {
        self.lookup(key, false, compute).await
    }

    /// Like [`get`](Self::get), but never serves a stale value: anything
    /// short of fresh is recomputed synchronously.
    pub async fn get_fresh<F, Fut>(&self, key: K, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<V>, CacheError>> + Send + 'static,
    {
        self.lookup(key, true, compute).await
    }

    /// Executes `compute` through the coalescing group regardless of any
    /// cached entry, and stores the result.
    ///
    /// The returned flag is `true` when this caller piggy-backed on another
    /// caller's in-flight execution rather than triggering it.
    pub async fn set<F, Fut>(&self, key: K, compute: F) -> Result<(V, bool), CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<V>, CacheError>> + Send + 'static,
    {
        let this = self.clone();
        let store_key = key.clone();
        let computation = async move {
            let computed = compute().await?;
            this.store(store_key, &computed);
            Ok(computed)
        };

        let (result, shared) = self.inner.calls.run(key, computation).await;
        result.map(|computed| (computed.value, shared))
    }

    async fn lookup<F, Fut>(&self, key: K, fresh_only: bool, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<V>, CacheError>> + Send + 'static,
    {
        if let Some(entry) = self.load(&key) {
            if entry.is_fresh() {
                return Ok(entry.into_value());
            }

            // Stale but not yet hard-expired: hand out the old value right
            // away and refresh it out of band.
            if !fresh_only && !entry.is_expired() {
                self.spawn_refresh(key, compute);
                return Ok(entry.into_value());
            }
        }

        let (value, _shared) = self.set(key, compute).await?;
        Ok(value)
    }

    /// Reads the entry table. Backend read failures degrade to a miss.
    fn load(&self, key: &K) -> Option<CacheEntry<V>> {
        let backend = self.inner.backend.as_ref()?;
        let backend = backend.read().unwrap();
        match backend.get(key) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "cache backend read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Writes a freshly computed entry. Write failures leave the entry
    /// absent; the computed value has already been fanned out regardless.
    fn store(&self, key: K, computed: &Computed<V>) {
        let Some(backend) = self.inner.backend.as_ref() else {
            return;
        };

        let (fresh_for, ttl) = match computed.ttl {
            Some(ttl) => (ttl, ttl * 2),
            None => (self.inner.fresh_for, self.inner.ttl),
        };
        if ttl.is_zero() {
            // Coalesced, but not retained past this request.
            return;
        }

        let entry = CacheEntry::new(computed.value.clone(), fresh_for, ttl);

        let mut backend = backend.write().unwrap();
        if let Err(err) = backend.set_with_ttl(key, entry, ttl) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to store cache entry"
            );
        }
    }

    /// Schedules a deduplicated fire-and-forget refresh for `key`.
    ///
    /// The refresh re-enters the coalescing group, so overlapping refreshes
    /// and synchronous recomputations for one key collapse into a single
    /// execution. Errors are logged, never propagated to any caller.
    fn spawn_refresh<F, Fut>(&self, key: K, compute: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Computed<V>, CacheError>> + Send + 'static,
    {
        {
            let mut refreshes = self.inner.refreshes.lock().unwrap();
            if refreshes.contains(&key) {
                return;
            }
            refreshes.insert(key.clone());
        }

        let done_token = {
            let key = key.clone();
            let inner = Arc::clone(&self.inner);
            defer(move || {
                inner.refreshes.lock().unwrap().remove(&key);
            })
        };

        let this = self.clone();
        let task = async move {
            let _done_token = done_token;

            if let Err(err) = this.set(key, compute).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "background cache refresh failed"
                );
            }
        };
        tokio::spawn(task);
    }
}
