use thiserror::Error;

/// An error produced while looking up or computing a cached value.
///
/// This error is intended for fan-out: when a computation is shared between
/// coalesced callers, every caller receives a clone of the same error, so all
/// variants are cheap to clone and comparable in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache key could not be derived from the request.
    ///
    /// Callers are expected to treat this as fail-open and serve the request
    /// without the benefit of caching.
    #[error("cache key derivation failed: {0}")]
    KeyDerivation(String),

    /// The pluggable backend failed to read or write an entry.
    ///
    /// Read failures are treated as cache misses, write failures leave the
    /// entry absent for future lookups. Neither is surfaced to callers.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// The wrapped computation itself failed.
    ///
    /// Propagated verbatim to every coalesced caller; nothing is written to
    /// the cache for the key.
    #[error("computation failed: {0}")]
    Computation(String),

    /// The in-flight computation went away without producing a result.
    ///
    /// This is what waiters observe when the executing task is dropped or
    /// panics before sending its result.
    #[error("computation dropped before completing")]
    Dropped,
}
