// tests/ratelimit_http.rs
//
// HTTP-level tests for the operator Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use axum::{
    body::{self, Body},
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use market_sentiment_ingest::api::{create_router, AppState};
use market_sentiment_ingest::metrics::NoopSink;
use market_sentiment_ingest::ratelimit::middleware::UserRole;
use market_sentiment_ingest::ratelimit::{AdaptiveRateLimiter, RateLimitConfig, Role};
use serde_json::Value as Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt as _; // for `oneshot`

const BODY_LIMIT: usize = 1024 * 1024;

fn test_router() -> Router {
    let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitConfig::default()));
    create_router(AppState::new(limiter, None), Arc::new(NoopSink))
}

fn peer(ip: &str) -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::new(ip.parse().expect("peer ip"), 40_000))
}

/// A request as axum's `into_make_service_with_connect_info` would deliver it.
fn get(uri: &str, from: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    req.extensions_mut().insert(peer(from));
    req
}

fn forwarded_get(uri: &str, from: &str, forwarded_for: &str) -> Request<Body> {
    let mut req = get(uri, from);
    req.headers_mut()
        .insert("x-forwarded-for", forwarded_for.parse().expect("header value"));
    req
}

async fn json_body(resp: axum::response::Response) -> Json {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn header<'a>(resp: &'a axum::response::Response, name: &str) -> &'a str {
    resp.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

#[tokio::test]
async fn health_carries_rate_limit_headers() {
    let app = test_router();
    let resp = app.oneshot(get("/health", "203.0.113.50")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "x-ratelimit-limit"), "30");
    assert_eq!(header(&resp, "x-ratelimit-remaining"), "29");
    assert!(header(&resp, "x-ratelimit-reset").parse::<i64>().unwrap() > 0);
    assert_eq!(json_body(resp).await["status"], "ok");
}

#[tokio::test]
async fn anonymous_budget_runs_out_with_429() {
    let app = test_router();
    for i in 0..30 {
        let resp = app.clone().oneshot(get("/health", "203.0.113.51")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {i}");
    }
    let resp = app.clone().oneshot(get("/health", "203.0.113.51")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&resp, "retry-after"), "60");
    let body = json_body(resp).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retry_after"], 60);
    assert_eq!(body["reason"], "over_budget");

    // A different client is unaffected.
    let resp = app.oneshot(get("/health", "203.0.113.52")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn role_extension_raises_budget_to_endpoint_cap() {
    let app = test_router();
    let mut req = get("/health", "203.0.113.53");
    req.extensions_mut().insert(UserRole(Role::Premium));
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // premium allows 1000/min but system.health_check caps at 120
    assert_eq!(header(&resp, "x-ratelimit-limit"), "120");
    assert_eq!(header(&resp, "x-ratelimit-remaining"), "119");
}

#[tokio::test]
async fn status_reports_counts_and_rejects_bad_ip() {
    let app = test_router();
    for _ in 0..3 {
        app.clone().oneshot(get("/health", "203.0.113.54")).await.unwrap();
    }
    let resp = app
        .clone()
        .oneshot(get("/api/rate-limit/status?ip=203.0.113.54", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["ip"], "203.0.113.54");
    assert_eq!(body["requests_last_minute"], 3);
    assert_eq!(body["is_whitelisted"], false);
    assert_eq!(body["is_temporarily_blocked"], false);
    assert!(body["block_until"].is_null());

    // Without ?ip= the caller's own address is reported.
    let resp = app.clone().oneshot(get("/api/rate-limit/status", "203.0.113.55")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["ip"], "203.0.113.55");
    assert_eq!(body["requests_last_minute"], 1);

    let resp = app
        .oneshot(get("/api/rate-limit/status?ip=not-an-ip", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

fn block_req(from: &str, body: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri("/api/admin/rate-limit/block")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request");
    req.extensions_mut().insert(peer(from));
    req
}

#[tokio::test]
async fn admin_block_requires_allowlisted_caller() {
    let app = test_router();

    let resp = app
        .clone()
        .oneshot(block_req("203.0.113.60", r#"{"ip":"203.0.113.61","minutes":5}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .clone()
        .oneshot(block_req("127.0.0.1", r#"{"ip":"203.0.113.61","minutes":5}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["ip"], "203.0.113.61");
    assert_eq!(body["minutes"], 5);
    assert!(body["block_until"].is_string());

    let resp = app.clone().oneshot(get("/health", "203.0.113.61")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(resp).await["reason"], "blocked");

    let resp = app
        .oneshot(block_req("127.0.0.1", r#"{"ip":"203.0.113.62","minutes":0}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn denylisted_client_gets_429() {
    let mut cfg = RateLimitConfig::default();
    cfg.denylist = vec!["198.51.100.0/24".parse().unwrap()];
    let app = create_router(
        AppState::new(Arc::new(AdaptiveRateLimiter::new(cfg)), None),
        Arc::new(NoopSink),
    );
    let resp = app.oneshot(get("/metrics", "198.51.100.77")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(resp).await["reason"], "denylisted");
}

#[tokio::test]
async fn metrics_route_renders_without_exporter() {
    let app = test_router();
    let resp = app.oneshot(get("/metrics", "203.0.113.70")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn forwarded_header_from_public_peer_is_ignored() {
    let app = test_router();
    for i in 0..30 {
        let resp = app
            .clone()
            .oneshot(forwarded_get("/health", "203.0.113.66", "127.0.0.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {i}");
    }
    let resp = app
        .clone()
        .oneshot(forwarded_get("/health", "203.0.113.66", "127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let mut req = block_req("203.0.113.67", r#"{"ip":"203.0.113.68","minutes":5}"#);
    req.headers_mut()
        .insert("x-forwarded-for", "127.0.0.1".parse().unwrap());
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app.oneshot(get("/health", "203.0.113.68")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn trusted_proxy_forwards_the_client_address() {
    let mut cfg = RateLimitConfig::default();
    cfg.allowlist = vec!["127.0.0.1".parse().unwrap()];
    cfg.trusted_proxies = vec!["10.0.0.5".parse().unwrap()];
    let app = create_router(
        AppState::new(Arc::new(AdaptiveRateLimiter::new(cfg)), None),
        Arc::new(NoopSink),
    );

    let resp = app
        .clone()
        .oneshot(forwarded_get("/api/rate-limit/status", "10.0.0.5", "203.0.113.80, 10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["ip"], "203.0.113.80");

    // Another private peer is not a trusted proxy.
    let resp = app
        .oneshot(forwarded_get("/api/rate-limit/status", "10.0.0.6", "203.0.113.80"))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["ip"], "10.0.0.6");
}
