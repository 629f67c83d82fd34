use std::time::{Duration, Instant};

/// A value stored in the cache together with its freshness window.
///
/// An entry is *fresh* until [`fresh_until`](Self::fresh_until), *stale*
/// between `fresh_until` and [`expire_at`](Self::expire_at), and logically
/// absent once `expire_at` has passed. Entries are created whole on a
/// successful computation and replaced wholesale on refresh, never mutated
/// in place.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    fresh_until: Instant,
    expire_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Creates an entry whose freshness window starts now.
    pub fn new(value: V, fresh_for: Duration, ttl: Duration) -> Self {
        let now = Instant::now();
        CacheEntry {
            value,
            fresh_until: now + fresh_for,
            expire_at: now + ttl,
        }
    }

    /// A fresh entry is served without any side effects.
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.fresh_until
    }

    /// An expired entry must not be served at all; it only remains in the
    /// backend until eviction catches up with it.
    pub fn is_expired(&self) -> bool {
        self.expire_at <= Instant::now()
    }

    /// When to drop this entry from the backend.
    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }
}
