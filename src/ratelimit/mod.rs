// src/ratelimit/mod.rs
//! # Adaptive rate limiter
//! Gates inbound requests per client IP over a sliding 60 s window.
//!
//! Rules, first match wins:
//! 1. deny-listed: denied
//! 2. temporarily blocked: denied until the block expires (expired blocks are evicted)
//! 3. allow-listed: allowed, nothing recorded
//! 4. per-role budget (and per-endpoint budget when the route names one)
//!
//! Only allowed requests are recorded, so a client hammering past its budget gets
//! back in as soon as its allowed requests age out.

pub mod config;
pub mod ipmatch;
pub mod middleware;

pub use config::{EndpointKey, Limit, RateLimitConfig, Role};

use crate::rolling::SlidingWindow;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    DenyListed,
    Blocked { until: DateTime<Utc> },
    OverBudget { limit: u32 },
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::DenyListed => "denylisted",
            DenyReason::Blocked { .. } => "blocked",
            DenyReason::OverBudget { .. } => "over_budget",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `limit`/`remaining` describe the tightest window that applied.
    Allowed { limit: u32, remaining: u32 },
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Introspection snapshot for one IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub ip: String,
    pub requests_last_minute: usize,
    pub is_whitelisted: bool,
    pub is_blacklisted: bool,
    pub is_temporarily_blocked: bool,
    pub block_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    until: Instant,
    until_wall: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<IpAddr, SlidingWindow>,
    endpoint_windows: HashMap<(IpAddr, EndpointKey), SlidingWindow>,
    blocks: HashMap<IpAddr, Block>,
}

#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    cfg: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    pub fn is_allowlisted(&self, ip: IpAddr) -> bool {
        ipmatch::any_match(&self.cfg.allowlist, ip)
    }

    pub fn is_denylisted(&self, ip: IpAddr) -> bool {
        ipmatch::any_match(&self.cfg.denylist, ip)
    }

    pub fn check(&self, ip: IpAddr, role: Role) -> Decision {
        self.check_request_at(ip, role, None, Instant::now())
    }

    pub fn check_endpoint(&self, ip: IpAddr, role: Role, endpoint: &EndpointKey) -> Decision {
        self.check_request_at(ip, role, Some(endpoint), Instant::now())
    }

    /// True when the request should be refused. Records it otherwise.
    pub fn is_rate_limited(&self, ip: IpAddr, role: Role) -> bool {
        !self.check(ip, role).is_allowed()
    }

    /// Decide and record atomically: both windows are checked under one lock and the
    /// request is appended to both only if both allow it.
    pub fn check_request_at(
        &self,
        ip: IpAddr,
        role: Role,
        endpoint: Option<&EndpointKey>,
        now: Instant,
    ) -> Decision {
        if self.is_denylisted(ip) {
            warn!(target: "ratelimit", %ip, "denied: deny-listed");
            return Decision::Denied(DenyReason::DenyListed);
        }

        let mut st = self.state.lock();
        if let Some(block) = st.blocks.get(&ip).copied() {
            if now < block.until {
                return Decision::Denied(DenyReason::Blocked {
                    until: block.until_wall,
                });
            }
            st.blocks.remove(&ip);
            info!(target: "ratelimit", %ip, "temporary block expired");
        }

        let role_limit = self.cfg.role_limit(role).per_minute;
        if self.is_allowlisted(ip) {
            return Decision::Allowed {
                limit: role_limit,
                remaining: role_limit,
            };
        }

        let ip_count = st.windows.entry(ip).or_insert_with(|| SlidingWindow::new(WINDOW)).count(now);
        let ep = endpoint.map(|key| {
            let limit = self.cfg.endpoint_limit(key).per_minute;
            let count = st
                .endpoint_windows
                .entry((ip, key.clone()))
                .or_insert_with(|| SlidingWindow::new(WINDOW))
                .count(now);
            (key, limit, count)
        });

        let over = if ip_count >= role_limit as usize {
            Some(role_limit)
        } else {
            ep.and_then(|(_, limit, count)| (count >= limit as usize).then_some(limit))
        };
        if let Some(limit) = over {
            warn!(
                target: "ratelimit",
                %ip,
                ?role,
                endpoint = ?ep.map(|(k, _, _)| k.to_string()),
                requests = ip_count,
                limit,
                "rate limit exceeded"
            );
            if let Some(minutes) = self.cfg.auto_block_minutes.filter(|m| *m > 0) {
                st.blocks.insert(ip, block_for(now, minutes));
                warn!(target: "ratelimit", %ip, minutes, "auto-blocked after exceeding budget");
            }
            return Decision::Denied(DenyReason::OverBudget { limit });
        }

        if let Some(w) = st.windows.get_mut(&ip) {
            w.record(now);
        }
        let mut limit = role_limit;
        let mut remaining = role_limit.saturating_sub(ip_count as u32 + 1);
        if let Some((key, ep_limit, ep_count)) = ep {
            if let Some(w) = st.endpoint_windows.get_mut(&(ip, key.clone())) {
                w.record(now);
            }
            let ep_remaining = ep_limit.saturating_sub(ep_count as u32 + 1);
            if ep_remaining < remaining {
                limit = ep_limit;
                remaining = ep_remaining;
            }
        }
        Decision::Allowed { limit, remaining }
    }

    pub fn get_rate_limit_info(&self, ip: IpAddr) -> RateLimitInfo {
        self.get_rate_limit_info_at(ip, Instant::now())
    }

    /// Read-only: nothing is recorded or evicted.
    pub fn get_rate_limit_info_at(&self, ip: IpAddr, now: Instant) -> RateLimitInfo {
        let st = self.state.lock();
        let requests_last_minute = st.windows.get(&ip).map_or(0, |w| w.count_at(now));
        let block = st.blocks.get(&ip).filter(|b| now < b.until);
        RateLimitInfo {
            ip: ip.to_string(),
            requests_last_minute,
            is_whitelisted: self.is_allowlisted(ip),
            is_blacklisted: self.is_denylisted(ip),
            is_temporarily_blocked: block.is_some(),
            block_until: block.map(|b| b.until_wall),
        }
    }

    pub fn block_temporarily(&self, ip: IpAddr, minutes: u32) -> DateTime<Utc> {
        self.block_temporarily_at(ip, minutes, Instant::now())
    }

    /// Block `ip` for `minutes`, replacing any existing block. Returns the expiry.
    pub fn block_temporarily_at(&self, ip: IpAddr, minutes: u32, now: Instant) -> DateTime<Utc> {
        let block = block_for(now, minutes);
        self.state.lock().blocks.insert(ip, block);
        warn!(target: "ratelimit", %ip, minutes, until = %block.until_wall, "ip temporarily blocked");
        block.until_wall
    }

    pub fn unblock(&self, ip: IpAddr) -> bool {
        self.state.lock().blocks.remove(&ip).is_some()
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Drop expired blocks and windows with nothing left in them. Returns entries removed.
    pub fn prune_at(&self, now: Instant) -> usize {
        let mut st = self.state.lock();
        let before = st.windows.len() + st.endpoint_windows.len() + st.blocks.len();
        st.blocks.retain(|_, b| now < b.until);
        st.windows.retain(|_, w| {
            w.evict(now);
            !w.is_empty()
        });
        st.endpoint_windows.retain(|_, w| {
            w.evict(now);
            !w.is_empty()
        });
        let after = st.windows.len() + st.endpoint_windows.len() + st.blocks.len();
        before - after
    }

    /// IPs currently tracked by any window or block.
    pub fn tracked(&self) -> usize {
        let st = self.state.lock();
        let mut ips: Vec<IpAddr> = st.windows.keys().copied().collect();
        ips.extend(st.endpoint_windows.keys().map(|(ip, _)| *ip));
        ips.extend(st.blocks.keys().copied());
        ips.sort();
        ips.dedup();
        ips.len()
    }
}

fn block_for(now: Instant, minutes: u32) -> Block {
    let d = Duration::from_secs(u64::from(minutes) * 60);
    Block {
        until: now + d,
        until_wall: Utc::now() + TimeDelta::minutes(i64::from(minutes)),
    }
}
