use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::entry::CacheEntry;
use crate::error::CacheError;

/// A bounded key/value store for cache entries.
///
/// The engine owns its backend behind a reader/writer lock: lookups happen
/// under the read half, stores under the write half, and the computation of
/// new values strictly outside of either. Implementations therefore do not
/// need any internal locking of their own, though they are free to have it.
///
/// Capacity is bounded and eviction is independent of TTL: an entry may
/// disappear before its expiry, and a miss after eviction must simply lead
/// to recomputation, never to an error.
pub trait Backend<K, V>: Send + Sync {
    /// Looks up the entry for `key`, `None` on a miss.
    fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>, CacheError>;

    /// Stores `entry` under `key`, retaining it for at most `ttl`.
    ///
    /// The duration matches the entry's own expiry; it is passed separately
    /// for backends that track retention out-of-band (e.g. a store with
    /// native per-key TTL support).
    fn set_with_ttl(&mut self, key: K, entry: CacheEntry<V>, ttl: Duration) -> Result<(), CacheError>;
}

/// A `moka::Expiry` that uses the [`CacheEntry`] expiry instant as the
/// explicit expiration time.
struct EntryExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to
/// `current_time`), this will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<K, V> moka::Expiry<K, CacheEntry<V>> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expire_at())
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expire_at())
    }
}

/// The reference [`Backend`]: a bounded in-memory store.
///
/// Entries are dropped when their expiry instant passes, and evicted earlier
/// under capacity pressure.
pub struct InMemoryBackend<K, V> {
    values: moka::sync::Cache<K, CacheEntry<V>>,
}

impl<K, V> InMemoryBackend<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a store holding at most `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let values = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryExpiration)
            .build();
        InMemoryBackend { values }
    }

    /// Forces pending eviction housekeeping to run, so that capacity
    /// overruns become observable deterministically.
    #[cfg(test)]
    pub(crate) fn run_pending_tasks(&self) {
        self.values.run_pending_tasks();
    }
}

impl<K, V> Backend<K, V> for InMemoryBackend<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>, CacheError> {
        Ok(self.values.get(key))
    }

    fn set_with_ttl(
        &mut self,
        key: K,
        entry: CacheEntry<V>,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        self.values.insert(key, entry);
        Ok(())
    }
}
