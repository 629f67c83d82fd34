//! # Stampede prevention for expensive computations and HTTP handlers
//!
//! When many concurrent callers request the same not-yet-cached (or expired)
//! value, each of them redundantly repeats the same expensive work, a
//! [cache stampede](https://en.wikipedia.org/wiki/Cache_stampede). This
//! crate runs the underlying computation exactly once per key and fans the
//! result out to every caller, with a TTL-bounded cache layered on top and
//! an HTTP middleware adapter for wrapping request handlers.
//!
//! ## Layers
//!
//! A lookup through [`CoalescingCache`] goes through the following steps:
//!
//! - First, the entry table is consulted. A *fresh* entry is returned as-is,
//!   with no side effects.
//! - A *stale* entry (past its freshness window but not hard-expired) is
//!   returned immediately as well, and a refresh is scheduled in the
//!   background. Refreshes are deduplicated per key and their failures are
//!   logged, never surfaced to the caller that got the stale value.
//! - A missing or expired entry is computed synchronously. Concurrent
//!   callers for the same key are coalesced: one execution runs, every
//!   caller receives the identical value (or the identical error).
//! - A successful result is written back to the entry table; a failed one
//!   leaves the table untouched.
//!
//! The entry table is pluggable via the [`Backend`] trait and defaults to a
//! bounded in-memory store ([`InMemoryBackend`]). Capacity-based eviction is
//! independent of expiry; a miss after eviction simply recomputes.
//!
//! ## Coalescing
//!
//! Deduplication lives in [`CallGroup`]: per key, the first caller spawns
//! the computation as a detached task and all concurrent callers subscribe
//! to its shared result channel. Dropping a waiter (cancellation, timeout)
//! abandons only that waiter; the computation always runs to completion
//! once started, and all remaining waiters get its result.
//!
//! ## HTTP adapter
//!
//! [`CacheLayer`] turns any `tower` service into a coalesced, cached
//! handler. The cache key is derived from the normalized request path plus
//! optional body, header and caller-supplied contributions (see
//! [`CacheOptions`]). The response of the one downstream execution is
//! captured as a [`ResponseEnvelope`] and replayed to every other caller,
//! minus cross-origin negotiation headers, which never travel from one
//! request to another.
//!
//! Failures degrade, they never escalate: an unreadable request body, a
//! backend error or a broken capture all result in the request being served
//! directly by the downstream handler, just without the benefit of caching.

pub mod backend;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod http;
pub mod key;
pub mod singleflight;
mod utils;


pub use backend::{Backend, InMemoryBackend};
pub use cache::{CoalescingCache, Computed};
pub use config::{CacheOptions, DEFAULT_TTL, KeyFn, StatusTtlFn};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use http::{CACHE_STATUS_HEADER, CacheLayer, CacheService, ResponseEnvelope};
pub use key::{combine_keys, hash_fragments};
pub use singleflight::CallGroup;
