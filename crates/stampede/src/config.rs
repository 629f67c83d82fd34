use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::http::request::Parts;
use serde::Deserialize;

/// Default time-to-live for cache entries. Pass
/// [`with_ttl`](CacheOptions::with_ttl) to set your own, or
/// [`skip_cache`](CacheOptions::skip_cache) to disable caching entirely.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default capacity of the bounded in-memory entry store.
pub const DEFAULT_CAPACITY: u64 = 100 * 1024;

/// Maps a captured response status to the time-to-live used when storing
/// that response. Returning zero keeps the result coalesced for in-flight
/// duplicates without retaining it afterwards.
pub type StatusTtlFn = Arc<dyn Fn(StatusCode) -> Duration + Send + Sync>;

/// An additional caller-supplied cache key contribution, derived from the
/// request head. Combined with the built-in sub-keys, never replacing them.
pub type KeyFn = Arc<dyn Fn(&Parts) -> u64 + Send + Sync>;

/// Configuration of one cache handler instance.
///
/// Resolved once when the handler is built and immutable thereafter. All
/// plain fields deserialize from configuration files; the function hooks are
/// only settable programmatically.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// How long stored responses stay fresh. The hard expiry is twice this.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Disables the cache tier entirely; coalescing alone still applies.
    pub skip_cache: bool,

    /// Include the request body in the cache key. The body is buffered and
    /// replayed so the downstream handler can still read it.
    pub include_request_body: bool,

    /// Header names (case-insensitive) whose values become part of the
    /// cache key. Absent headers are skipped.
    pub vary_headers: Vec<String>,

    /// Allow-list of request paths to cache. Empty means all paths.
    pub paths: Vec<String>,

    /// Capacity of the bounded in-memory entry store.
    pub capacity: u64,

    /// Per-response-status TTL override.
    #[serde(skip)]
    pub status_ttl: Option<StatusTtlFn>,

    /// Additional cache key contribution.
    #[serde(skip)]
    pub key_fn: Option<KeyFn>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            ttl: DEFAULT_TTL,
            skip_cache: false,
            include_request_body: false,
            vary_headers: Vec::new(),
            paths: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            status_ttl: None,
            key_fn: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("skip_cache", &self.skip_cache)
            .field("include_request_body", &self.include_request_body)
            .field("vary_headers", &self.vary_headers)
            .field("paths", &self.paths)
            .field("capacity", &self.capacity)
            .field("status_ttl", &self.status_ttl.as_ref().map(|_| ".."))
            .field("key_fn", &self.key_fn.as_ref().map(|_| ".."))
            .finish()
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub fn with_status_ttl<F>(mut self, f: F) -> Self
    where
        F: Fn(StatusCode) -> Duration + Send + Sync + 'static,
    {
        self.status_ttl = Some(Arc::new(f));
        self
    }

    pub fn include_request_body(mut self, include: bool) -> Self {
        self.include_request_body = include;
        self
    }

    pub fn vary_on_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vary_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> u64 + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }
}
