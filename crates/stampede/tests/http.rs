//! End-to-end tests of the cache middleware against a real HTTP server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, Method, Response, StatusCode};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::future::join_all;
use tokio::time::sleep;
use tower_http::cors::{AllowOrigin, CorsLayer};

use stampede::{CACHE_STATUS_HEADER, CacheLayer, CacheOptions, hash_fragments};

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// A handler that takes a while and counts its executions.
fn slow_handler(hits: &Arc<AtomicUsize>) -> Router {
    let hits = Arc::clone(hits);
    Router::new().route(
        "/slow",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                "slow response"
            }
        }),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stampede_prevention() {
    stampede_test::setup();

    let hits = counter();
    let app = slow_handler(&hits).layer(CacheLayer::new(
        CacheOptions::new().with_ttl(Duration::from_secs(5)),
    ));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    let requests = (0..20).map(|_| {
        let client = client.clone();
        async move {
            let response = client
                .get(format!("http://{addr}/slow"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 200);
            assert_eq!(response.text().await.unwrap(), "slow response");
        }
    });
    join_all(requests).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Without the cache tier, parallel requests still collapse into one
/// execution, but nothing is retained for later requests.
#[tokio::test(flavor = "multi_thread")]
async fn test_coalescing_only() {
    stampede_test::setup();

    let hits = counter();
    let app = slow_handler(&hits).layer(CacheLayer::coalescing_only());
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    let requests = (0..20).map(|_| {
        let client = client.clone();
        async move {
            let response = client
                .get(format!("http://{addr}/slow"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.text().await.unwrap(), "slow response");
        }
    });
    join_all(requests).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    client
        .get(format!("http://{addr}/slow"))
        .send()
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// A 5xx mapped to a zero TTL is coalesced but never retained, so back-to-
/// back requests each invoke the handler.
#[tokio::test]
async fn test_status_ttl_zero_is_not_cached() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/flaky",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, "try again later")
                }
            }),
        )
    };
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(5))
        .with_status_ttl(|status| match status.as_u16() {
            200..=299 => Duration::from_secs(1),
            400..=499 => Duration::from_secs(10),
            _ => Duration::ZERO,
        });
    let app = app.layer(CacheLayer::new(options));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("http://{addr}/flaky"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// Replayed responses must never carry the triggering request's cross-origin
/// headers: every origin gets its own grant while the handler runs once.
#[tokio::test(flavor = "multi_thread")]
async fn test_cors_headers_are_not_replayed() {
    stampede_test::setup();

    let origins = [
        "https://one.example",
        "https://two.example",
        "https://three.example",
        "https://four.example",
        "https://five.example",
    ];

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([("x-another-header", "wakka")], "hi")
                }
            }),
        )
    };

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins.iter().map(|origin| origin.parse::<HeaderValue>().unwrap()),
        ))
        .allow_methods([Method::GET]);
    let app = app
        .layer(CacheLayer::new(
            CacheOptions::new().with_ttl(Duration::from_secs(5)),
        ))
        .layer(cors);
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    for _round in 0..10 {
        let requests = origins.iter().map(|origin| {
            let client = client.clone();
            async move {
                let response = client
                    .get(format!("http://{addr}/"))
                    .header("origin", *origin)
                    .send()
                    .await
                    .unwrap();

                assert_eq!(response.status().as_u16(), 200);
                let allow_origin = response
                    .headers()
                    .get("access-control-allow-origin")
                    .expect("missing allow-origin header");
                assert_eq!(allow_origin.to_str().unwrap(), *origin);
                assert_eq!(
                    response.headers().get("x-another-header").unwrap(),
                    "wakka"
                );
                assert_eq!(response.text().await.unwrap(), "hi");
            }
        });
        join_all(requests).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_cache_hit_marker() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "hello"
                }
            }),
        )
    };
    let app = app.layer(CacheLayer::new(
        CacheOptions::new().with_ttl(Duration::from_secs(5)),
    ));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();

    let first = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert!(first.headers().get(CACHE_STATUS_HEADER).is_none());

    let second = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(second.headers().get(CACHE_STATUS_HEADER).unwrap(), "hit");
    assert_eq!(second.text().await.unwrap(), "hello");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// A handler that writes nothing still produces a cacheable empty 200.
#[tokio::test]
async fn test_empty_handler_response_is_cached() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
    };
    let app = app.layer(CacheLayer::new(
        CacheOptions::new().with_ttl(Duration::from_secs(5)),
    ));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client.get(format!("http://{addr}/")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.text().await.unwrap().is_empty());
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Configured vary headers split the cache per header value.
#[tokio::test]
async fn test_vary_headers_split_the_key() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "tenant data"
                }
            }),
        )
    };
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(5))
        .vary_on_headers(["X-Tenant"]);
    let app = app.layer(CacheLayer::new(options));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    let send = |tenant: &'static str| {
        let client = client.clone();
        async move {
            client
                .get(format!("http://{addr}/"))
                .header("x-tenant", tenant)
                .send()
                .await
                .unwrap()
        }
    };

    send("blue").await;
    send("green").await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let replayed = send("blue").await;
    assert_eq!(replayed.headers().get(CACHE_STATUS_HEADER).unwrap(), "hit");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// With the request body in the key, distinct payloads get distinct entries
/// and the downstream handler can still read the buffered body.
#[tokio::test]
async fn test_request_body_in_key() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/echo",
            post(move |body: String| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    body
                }
            }),
        )
    };
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(5))
        .include_request_body(true);
    let app = app.layer(CacheLayer::new(options));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    let send = |payload: &'static str| {
        let client = client.clone();
        async move {
            client
                .post(format!("http://{addr}/echo"))
                .body(payload)
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        }
    };

    assert_eq!(send("alpha").await, "alpha");
    assert_eq!(send("beta").await, "beta");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    assert_eq!(send("alpha").await, "alpha");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// Paths outside the allow-list bypass coalescing and caching entirely.
#[tokio::test]
async fn test_path_allowlist() {
    stampede_test::setup();

    let cached_hits = counter();
    let other_hits = counter();
    let app = {
        let cached_hits = Arc::clone(&cached_hits);
        let other_hits = Arc::clone(&other_hits);
        Router::new()
            .route(
                "/cached",
                get(move || {
                    let hits = Arc::clone(&cached_hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "cached"
                    }
                }),
            )
            .route(
                "/other",
                get(move || {
                    let hits = Arc::clone(&other_hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "not cached"
                    }
                }),
            )
    };
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(5))
        .allow_paths(["/cached"]);
    let app = app.layer(CacheLayer::new(options));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        client
            .get(format!("http://{addr}/cached"))
            .send()
            .await
            .unwrap();
        client
            .get(format!("http://{addr}/other"))
            .send()
            .await
            .unwrap();
    }

    assert_eq!(cached_hits.load(Ordering::SeqCst), 1);
    assert_eq!(other_hits.load(Ordering::SeqCst), 2);
}

/// A custom key function extends the key material; here it makes the cache
/// sensitive to the query string, which the default key ignores.
#[tokio::test]
async fn test_custom_key_fn() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/item",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "item"
                }
            }),
        )
    };
    let options = CacheOptions::new()
        .with_ttl(Duration::from_secs(5))
        .with_key_fn(|parts| hash_fragments(&[parts.uri.query().unwrap_or_default()]));
    let app = app.layer(CacheLayer::new(options));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    client
        .get(format!("http://{addr}/item?id=1"))
        .send()
        .await
        .unwrap();
    client
        .get(format!("http://{addr}/item?id=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let replayed = client
        .get(format!("http://{addr}/item?id=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(replayed.headers().get(CACHE_STATUS_HEADER).unwrap(), "hit");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// A response whose body dies mid-stream is never cached: each request runs
/// the handler again.
#[tokio::test]
async fn test_broken_response_is_not_cached() {
    stampede_test::setup();

    let hits = counter();
    let app = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/broken",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let stream = futures::stream::iter(vec![
                        Ok(Bytes::from_static(b"partial")),
                        Err(std::io::Error::other("stream died")),
                    ]);
                    Response::new(Body::from_stream(stream))
                }
            }),
        )
    };
    let app = app.layer(CacheLayer::new(
        CacheOptions::new().with_ttl(Duration::from_secs(5)),
    ));
    let addr = stampede_test::server(app).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("http://{addr}/broken"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
