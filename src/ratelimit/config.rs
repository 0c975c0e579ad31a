// src/ratelimit/config.rs
//! Rate-limit tables: per-role budgets, per-endpoint budgets, allow/deny lists.
//!
//! Loaded from TOML; every field has a built-in default so a partial file is fine.

use crate::ratelimit::ipmatch::IpRule;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_PATH: &str = "RATE_LIMIT_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/rate_limits.toml";

/// A budget normalized to requests per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LimitRepr")]
pub struct Limit {
    pub per_minute: u32,
}

impl Limit {
    pub const fn per_minute(n: u32) -> Self {
        Self { per_minute: n }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    Count(u32),
    Text(String),
}

impl TryFrom<LimitRepr> for Limit {
    type Error = anyhow::Error;
    fn try_from(r: LimitRepr) -> Result<Self> {
        match r {
            LimitRepr::Count(n) => Ok(Limit::per_minute(n)),
            LimitRepr::Text(s) => s.parse(),
        }
    }
}

/// `"5/minute"`, `"2/second"`, `"600/hour"` or a bare count per minute.
impl FromStr for Limit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (count, unit) = s.split_once('/').unwrap_or((s, "minute"));
        let n: u32 = count
            .trim()
            .parse()
            .with_context(|| format!("bad rate limit {s:?}"))?;
        let per_minute = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" => n.saturating_mul(60),
            "m" | "min" | "minute" => n,
            // Rounded up so a small hourly budget still admits one call a minute.
            "h" | "hour" => n.div_ceil(60),
            other => return Err(anyhow!("unknown rate limit unit {other:?} in {s:?}")),
        };
        Ok(Limit::per_minute(per_minute))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Anonymous,
    Free,
    Standard,
    Premium,
}

impl FromStr for Role {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" | "anon" | "" => Ok(Role::Anonymous),
            "free" => Ok(Role::Free),
            "standard" => Ok(Role::Standard),
            "premium" => Ok(Role::Premium),
            other => Err(anyhow!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoleLimits {
    pub anonymous: Limit,
    pub free: Limit,
    pub standard: Limit,
    pub premium: Limit,
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            anonymous: Limit::per_minute(30),
            free: Limit::per_minute(50),
            standard: Limit::per_minute(100),
            premium: Limit::per_minute(1000),
        }
    }
}

impl RoleLimits {
    pub fn get(&self, role: Role) -> Limit {
        match role {
            Role::Anonymous => self.anonymous,
            Role::Free => self.free,
            Role::Standard => self.standard,
            Role::Premium => self.premium,
        }
    }
}

/// `category.name`, e.g. `data.stock_prices`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub category: String,
    pub name: String,
}

impl EndpointKey {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl FromStr for EndpointKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let (c, n) = s
            .split_once('.')
            .ok_or_else(|| anyhow!("endpoint key must be category.name, got {s:?}"))?;
        if c.is_empty() || n.is_empty() {
            return Err(anyhow!("endpoint key must be category.name, got {s:?}"));
        }
        Ok(Self::new(c, n))
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub roles: RoleLimits,
    /// category -> endpoint -> limit.
    pub endpoints: BTreeMap<String, BTreeMap<String, Limit>>,
    pub default_endpoint: Limit,
    pub allowlist: Vec<IpRule>,
    pub denylist: Vec<IpRule>,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    pub trusted_proxies: Vec<IpRule>,
    /// When set, an IP that goes over budget is blocked for this many minutes.
    pub auto_block_minutes: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let table: &[(&str, &[(&str, u32)])] = &[
            ("auth", &[("login", 5), ("register", 3), ("password_reset", 2)]),
            (
                "data",
                &[
                    ("sentiment_summary", 60),
                    ("sentiment_timeline", 60),
                    ("stock_prices", 60),
                    ("latest_news", 60),
                    ("sentiment_by_symbol", 60),
                    ("prices_by_symbol", 60),
                ],
            ),
            (
                "analytics",
                &[("correlation_analysis", 30), ("dashboard_stats", 30), ("machine_learning", 10)],
            ),
            (
                "system",
                &[("health_check", 120), ("metrics", 30), ("test_db", 10), ("rate_limit_status", 60), ("admin_block", 10)],
            ),
            ("public", &[("root", 300), ("docs", 200)]),
        ];
        let endpoints = table
            .iter()
            .map(|(cat, rows)| {
                let inner = rows
                    .iter()
                    .map(|(name, n)| (name.to_string(), Limit::per_minute(*n)))
                    .collect();
                (cat.to_string(), inner)
            })
            .collect();

        let allowlist = ["127.0.0.1", "::1", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        Self {
            roles: RoleLimits::default(),
            endpoints,
            default_endpoint: Limit::per_minute(30),
            allowlist,
            denylist: Vec::new(),
            trusted_proxies: Vec::new(),
            auto_block_minutes: None,
        }
    }
}

impl RateLimitConfig {
    pub fn role_limit(&self, role: Role) -> Limit {
        self.roles.get(role)
    }

    /// Unknown endpoints get `default_endpoint`.
    pub fn endpoint_limit(&self, key: &EndpointKey) -> Limit {
        self.endpoints
            .get(&key.category)
            .and_then(|m| m.get(&key.name))
            .copied()
            .unwrap_or(self.default_endpoint)
    }

    pub fn parse_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing rate limit config")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading rate limit config from {}", path.display()))?;
        Self::parse_toml(&content).with_context(|| format!("in {}", path.display()))
    }

    /// 1) explicit path, 2) $RATE_LIMIT_CONFIG_PATH, 3) config/rate_limits.toml,
    /// 4) built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path {}", pb.display()));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }
}
