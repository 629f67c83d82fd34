//! HTTP middleware that coalesces and caches downstream responses.
//!
//! [`CacheLayer`] wraps any `tower` service taking an [`axum`] request and
//! returning an [`axum`] response. Parallel requests that map to the same
//! cache key execute the downstream service once; every other request is
//! answered from the captured [`ResponseEnvelope`], first from the in-flight
//! fan-out and afterwards from the cache for as long as the entry lives.
//!
//! The cache key combines the normalized request path with optional
//! contributions from the request body, selected header values, and a
//! caller-supplied key function. Requests outside a configured path
//! allow-list bypass the middleware entirely.
//!
//! No failure in here is allowed to take a request down: key derivation and
//! coalescing failures degrade to serving the request straight from the
//! downstream service, without the benefit of caching.

mod capture;

pub use capture::{CACHE_STATUS_HEADER, ResponseEnvelope};

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, Request, Response, StatusCode};
use futures::future::BoxFuture;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service as TowerService;

use crate::cache::{CoalescingCache, Computed};
use crate::config::{CacheOptions, StatusTtlFn};
use crate::error::CacheError;
use crate::key::{combine_keys, hash_fragments};

/// Wraps a downstream service in a coalescing response cache.
#[derive(Clone)]
pub struct CacheLayer {
    cache: CoalescingCache<u64, ResponseEnvelope>,
    options: Arc<CacheOptions>,
    paths: Arc<HashSet<String>>,
}

impl CacheLayer {
    pub fn new(options: CacheOptions) -> Self {
        let cache = if options.skip_cache {
            CoalescingCache::coalescing_only()
        } else {
            // Stored responses stay fresh for the configured ttl and are
            // dropped for good after twice that.
            CoalescingCache::with_capacity(options.capacity, options.ttl, options.ttl * 2)
        };
        let paths = options
            .paths
            .iter()
            .map(|path| path.to_ascii_lowercase())
            .collect();

        CacheLayer {
            cache,
            options: Arc::new(options),
            paths: Arc::new(paths),
        }
    }

    /// Coalescing without the cache tier: parallel requests for one key
    /// still collapse into a single downstream execution, but nothing is
    /// retained once all of them have been answered.
    pub fn coalescing_only() -> Self {
        Self::new(CacheOptions::new().skip_cache(true))
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CacheService {
            service,
            cache: self.cache.clone(),
            options: Arc::clone(&self.options),
            paths: Arc::clone(&self.paths),
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S> {
    service: S,
    cache: CoalescingCache<u64, ResponseEnvelope>,
    options: Arc<CacheOptions>,
    paths: Arc<HashSet<String>>,
}

impl<S> TowerService<Request<Body>> for CacheService<S>
where
    S: TowerService<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<Body>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh
        // clone behind for the next call.
        let clone = self.service.clone();
        let service = std::mem::replace(&mut self.service, clone);

        // Match against the path allow-list; anything else is none of our
        // business and goes straight downstream.
        let path = request.uri().path().to_ascii_lowercase();
        if !self.paths.is_empty() && !self.paths.contains(&path) {
            return Box::pin(service.oneshot(request));
        }

        let cache = self.cache.clone();
        let options = Arc::clone(&self.options);
        Box::pin(handle(service, cache, options, request))
    }
}

async fn handle<S>(
    service: S,
    cache: CoalescingCache<u64, ResponseEnvelope>,
    options: Arc<CacheOptions>,
    request: Request<Body>,
) -> Result<Response<Body>, S::Error>
where
    S: TowerService<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    let (key, request) = match derive_key(request, &options).await {
        (Ok(key), request) => (key, request),
        (Err(err), request) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to compute cache key, serving request uncached"
            );
            return service.oneshot(request).await;
        }
    };

    // Only the caller that ends up triggering the computation consumes its
    // request; everyone else keeps theirs around for a potential direct
    // dispatch.
    let slot = Arc::new(Mutex::new(Some(request)));

    let compute = {
        let slot = Arc::clone(&slot);
        let service = service.clone();
        let status_ttl = options.status_ttl.clone();
        move || compute_envelope(service, slot, status_ttl)
    };

    let result = cache.get_fresh(key, compute).await;

    let request = slot.lock().unwrap().take();
    match (result, request) {
        // This caller triggered the computation; the captured envelope is
        // its own response, verbatim.
        (Ok(envelope), None) => {
            if envelope.is_valid() {
                Ok(envelope.into_response())
            } else {
                Ok(error_response())
            }
        }
        // Piggy-backed on another caller's execution, or served from cache.
        (Ok(envelope), Some(request)) => {
            if envelope.is_valid() {
                Ok(envelope.replay())
            } else {
                // An incomplete capture is never replayed.
                service.oneshot(request).await
            }
        }
        (Err(err), Some(request)) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "coalesced request failed, serving request uncached"
            );
            service.oneshot(request).await
        }
        (Err(err), None) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "request handler failed"
            );
            Ok(error_response())
        }
    }
}

/// Runs the downstream service once and packages its response.
async fn compute_envelope<S>(
    service: S,
    slot: Arc<Mutex<Option<Request<Body>>>>,
    status_ttl: Option<StatusTtlFn>,
) -> Result<Computed<ResponseEnvelope>, CacheError>
where
    S: TowerService<Request<Body>, Response = Response<Body>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
{
    let Some(request) = slot.lock().unwrap().take() else {
        return Err(CacheError::Computation("request already consumed".into()));
    };

    let response = service
        .oneshot(request)
        .await
        .map_err(|err| CacheError::Computation(err.to_string()))?;

    let envelope = ResponseEnvelope::capture(response).await;

    let ttl = if envelope.is_valid() {
        status_ttl.as_ref().map(|resolve| resolve(envelope.status()))
    } else {
        // An incomplete capture must not outlive the in-flight fan-out.
        Some(Duration::ZERO)
    };

    Ok(Computed {
        value: envelope,
        ttl,
    })
}

/// Derives the cache key for a request, buffering the body when it is part
/// of the key material. Always hands the request back, rebuilt with the
/// buffered body where applicable.
async fn derive_key(
    request: Request<Body>,
    options: &CacheOptions,
) -> (Result<u64, CacheError>, Request<Body>) {
    let (parts, body) = request.into_parts();

    let path_key = hash_fragments(&[parts.uri.path().to_ascii_lowercase()]);

    let (body_key, body) = if options.include_request_body {
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                let body_key = hash_fragments(&[&bytes]);
                // Replay the buffered payload so the downstream handler can
                // still read it.
                (body_key, Body::from(bytes))
            }
            Err(err) => {
                return (
                    Err(CacheError::KeyDerivation(err.to_string())),
                    Request::from_parts(parts, Body::empty()),
                );
            }
        }
    } else {
        (0, body)
    };

    let vary_key = if options.vary_headers.is_empty() {
        0
    } else {
        let mut fragments: Vec<Vec<u8>> = Vec::with_capacity(options.vary_headers.len());
        for name in &options.vary_headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in parts.headers.get_all(&name) {
                fragments.push(value.as_bytes().to_vec());
            }
        }
        hash_fragments(&fragments)
    };

    let custom_key = match &options.key_fn {
        Some(key_fn) => key_fn(&parts),
        None => 0,
    };

    let key = combine_keys(&[path_key, body_key, vary_key, custom_key]);
    (Ok(key), Request::from_parts(parts, body))
}

fn error_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
