// src/ratelimit/middleware.rs
//! axum middleware around [`AdaptiveRateLimiter`].

use super::ipmatch::{self, IpRule};
use super::{AdaptiveRateLimiter, Decision, DenyReason, EndpointKey, Role};
use crate::metrics::MetricsSink;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Set by an upstream auth layer; requests without it count as anonymous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRole(pub Role);

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<AdaptiveRateLimiter>,
    /// Endpoint budget for the routes this layer wraps.
    pub endpoint: Option<EndpointKey>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl RateLimitState {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            limiter,
            endpoint: None,
            metrics,
        }
    }

    pub fn for_endpoint(&self, key: EndpointKey) -> Self {
        Self {
            endpoint: Some(key),
            ..self.clone()
        }
    }
}

/// The socket peer, unless the peer is a trusted proxy: then the first
/// `X-Forwarded-For` hop, then `X-Real-IP`. Forwarding headers from anyone else
/// are ignored.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_proxies: &[IpRule]) -> IpAddr {
    let Some(peer) = peer.map(|p| p.ip()) else {
        return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    };
    if !ipmatch::any_match(trusted_proxies, peer) {
        return peer;
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    forwarded.or_else(real).unwrap_or(peer)
}

pub async fn rate_limit(State(state): State<RateLimitState>, req: Request, next: Next) -> Response {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let ip = client_ip(req.headers(), peer, &state.limiter.config().trusted_proxies);
    let role = req.extensions().get::<UserRole>().map_or(Role::Anonymous, |r| r.0);
    state.metrics.increment_request("http");

    let decision = match &state.endpoint {
        Some(key) => state.limiter.check_endpoint(ip, role, key),
        None => state.limiter.check(ip, role),
    };

    match decision {
        Decision::Denied(reason) => {
            state.metrics.increment_denied(reason.as_str());
            too_many_requests(reason)
        }
        Decision::Allowed { limit, remaining } => {
            let mut resp = next.run(req).await;
            let reset = chrono::Utc::now().timestamp() + 60;
            let h = resp.headers_mut();
            h.insert("x-ratelimit-limit", HeaderValue::from(limit));
            h.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            h.insert("x-ratelimit-reset", HeaderValue::from(reset));
            resp
        }
    }
}

fn too_many_requests(reason: DenyReason) -> Response {
    let body = serde_json::json!({
        "error": "Rate limit exceeded",
        "message": "Too many requests. Please try again later.",
        "reason": reason.as_str(),
        "retry_after": 60,
    });
    let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    resp
}
