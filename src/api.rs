use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;

use crate::metrics::MetricsSink;
use crate::ratelimit::middleware::{client_ip, rate_limit, RateLimitState};
use crate::ratelimit::{AdaptiveRateLimiter, EndpointKey, RateLimitInfo};

#[derive(Clone)]
pub struct AppState {
    limiter: Arc<AdaptiveRateLimiter>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>, metrics: Option<PrometheusHandle>) -> Self {
        Self { limiter, metrics }
    }
}

/// Operator surface. Every route sits behind the rate limiter with its own endpoint budget.
pub fn create_router(state: AppState, sink: Arc<dyn MetricsSink>) -> Router {
    let rl = RateLimitState::new(state.limiter.clone(), sink);
    let limited = |route: MethodRouter<AppState>, category: &str, name: &str| {
        route.layer(from_fn_with_state(
            rl.for_endpoint(EndpointKey::new(category, name)),
            rate_limit,
        ))
    };

    Router::new()
        .route("/health", limited(get(health), "system", "health_check"))
        .route("/metrics", limited(get(render_metrics), "system", "metrics"))
        .route(
            "/api/rate-limit/status",
            limited(get(rate_limit_status), "system", "rate_limit_status"),
        )
        .route(
            "/api/admin/rate-limit/block",
            limited(post(admin_block), "system", "admin_block"),
        )
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.map(|h| h.render()).unwrap_or_default()
}

fn caller_ip(state: &AppState, headers: &HeaderMap, ext: &Extensions) -> IpAddr {
    let peer = ext.get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    client_ip(headers, peer, &state.limiter.config().trusted_proxies)
}

#[derive(serde::Deserialize)]
struct StatusQuery {
    #[serde(default)]
    ip: Option<String>,
}

async fn rate_limit_status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
    headers: HeaderMap,
    ext: Extensions,
) -> Result<Json<RateLimitInfo>, Response> {
    let ip = match q.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<IpAddr>().map_err(|_| bad_request(format!("invalid ip {raw:?}")))?,
        None => caller_ip(&state, &headers, &ext),
    };
    Ok(Json(state.limiter.get_rate_limit_info(ip)))
}

#[derive(serde::Deserialize)]
struct BlockReq {
    ip: String,
    #[serde(default = "default_block_minutes")]
    minutes: u32,
}

fn default_block_minutes() -> u32 {
    5
}

#[derive(serde::Serialize)]
struct BlockResp {
    ip: String,
    minutes: u32,
    block_until: chrono::DateTime<chrono::Utc>,
}

/// Only callers on the allow-list may block others.
async fn admin_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    ext: Extensions,
    Json(body): Json<BlockReq>,
) -> Result<Json<BlockResp>, Response> {
    let caller = caller_ip(&state, &headers, &ext);
    if !state.limiter.is_allowlisted(caller) {
        tracing::warn!(target: "ratelimit", %caller, "admin block refused");
        return Err((StatusCode::FORBIDDEN, Json(serde_json::json!({ "error": "forbidden" }))).into_response());
    }
    let ip = body
        .ip
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| bad_request(format!("invalid ip {:?}", body.ip)))?;
    if body.minutes == 0 {
        return Err(bad_request("minutes must be at least 1".into()));
    }
    let until = state.limiter.block_temporarily(ip, body.minutes);
    Ok(Json(BlockResp {
        ip: ip.to_string(),
        minutes: body.minutes,
        block_until: until,
    }))
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg }))).into_response()
}
