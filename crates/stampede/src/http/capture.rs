use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;

/// Marker header set on responses replayed from a coalesced or cached
/// result rather than produced by the downstream handler.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Header-name prefix that is never copied out of a captured response.
///
/// Cross-origin response headers are negotiated per request; replaying the
/// triggering caller's values would leak one origin's grant to another
/// origin sharing the cache key.
const CORS_HEADER_PREFIX: &str = "access-control-";

/// A captured downstream response, the unit stored and fanned out by the
/// HTTP cache handler.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    valid: bool,
}

impl ResponseEnvelope {
    /// Captures a downstream response by buffering it whole.
    ///
    /// If the response body fails mid-stream, no complete response was ever
    /// established and the envelope is marked invalid; invalid envelopes
    /// must never be stored or replayed.
    pub(crate) async fn capture(response: Response<Body>) -> Self {
        let (parts, body) = response.into_parts();
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => ResponseEnvelope {
                status: parts.status,
                headers: parts.headers,
                body,
                valid: true,
            },
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to capture response body"
                );
                ResponseEnvelope {
                    status: parts.status,
                    headers: parts.headers,
                    body: Bytes::new(),
                    valid: false,
                }
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Rebuilds the response for the caller that triggered the capture: its
    /// own status, headers and body, verbatim.
    pub(crate) fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    /// Rebuilds the response for a piggy-backed caller.
    ///
    /// Every captured header is copied except the cross-origin negotiation
    /// headers (see [`CORS_HEADER_PREFIX`]), and the replay is marked with
    /// the [`CACHE_STATUS_HEADER`].
    pub(crate) fn replay(&self) -> Response<Body> {
        let mut headers = HeaderMap::with_capacity(self.headers.len() + 1);
        for (name, value) in &self.headers {
            if name.as_str().starts_with(CORS_HEADER_PREFIX) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("hit"));

        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}
