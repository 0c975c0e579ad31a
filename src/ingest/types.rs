// src/ingest/types.rs
use crate::model::{NewsItem, PriceBar, Symbol};
use chrono::{DateTime, Months, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Classified upstream failure. The variant decides what the scheduler does next.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 or an in-body throttle note. Back off before the next call.
    #[error("{provider}: rate limited ({detail})")]
    RateLimited {
        provider: &'static str,
        detail: String,
    },

    /// Network failure, timeout or 5xx. Retry with backoff.
    #[error("{provider}: transient failure: {detail}")]
    Transient {
        provider: &'static str,
        detail: String,
    },

    /// Malformed or unexpected response. Skip the symbol for this cycle.
    #[error("{provider}: invalid response: {detail}")]
    Invalid {
        provider: &'static str,
        detail: String,
    },

    /// Missing credential. Skip the provider for the whole run.
    #[error("{provider}: not configured ({detail})")]
    NotConfigured {
        provider: &'static str,
        detail: String,
    },
}

impl ProviderError {
    pub fn rate_limited(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::RateLimited {
            provider,
            detail: detail.into(),
        }
    }

    pub fn transient(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::Transient {
            provider,
            detail: detail.into(),
        }
    }

    pub fn invalid(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid {
            provider,
            detail: detail.into(),
        }
    }

    pub fn not_configured(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::NotConfigured {
            provider,
            detail: detail.into(),
        }
    }

    /// Classify a reqwest failure (connect, timeout, body read).
    pub fn from_reqwest(provider: &'static str, e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::invalid(provider, e.to_string())
        } else {
            Self::transient(provider, e.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(provider: &'static str, status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::rate_limited(provider, format!("HTTP {status}")),
            401 | 403 => Self::not_configured(provider, format!("HTTP {status}")),
            s if s >= 500 || s == 408 => Self::transient(provider, format!("HTTP {status}")),
            _ => Self::invalid(provider, format!("HTTP {status}")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient { .. } => "transient",
            Self::Invalid { .. } => "invalid",
            Self::NotConfigured { .. } => "not_configured",
        }
    }
}

/// Longest lookbacks the CLI accepts.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;
pub const MAX_LOOKBACK_MONTHS: u32 = 120;

/// How far back a historic fetch reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Months(u32),
    Days(u32),
}

impl Lookback {
    /// Saturates at the earliest representable instant.
    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let start = match self {
            Lookback::Months(m) => now.checked_sub_months(Months::new(m)),
            Lookback::Days(d) => TimeDelta::try_days(i64::from(d)).and_then(|d| now.checked_sub_signed(d)),
        };
        start.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for Lookback {
    fn default() -> Self {
        Lookback::Months(6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Latest items only.
    Realtime,
    /// Everything inside the window ending now.
    Historic(Lookback),
}

impl FetchMode {
    pub fn is_historic(self) -> bool {
        matches!(self, FetchMode::Historic(_))
    }

    /// Lower bound for local filtering, if any.
    pub fn window_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            FetchMode::Realtime => None,
            FetchMode::Historic(lb) => Some(lb.start(now)),
        }
    }
}

/// Per-call timeouts, realtime calls are kept tighter than historic ones.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    pub realtime: Duration,
    pub historic: Duration,
}

impl CallTimeouts {
    pub fn for_mode(&self, mode: FetchMode) -> Duration {
        if mode.is_historic() {
            self.historic
        } else {
            self.realtime
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            realtime: Duration::from_secs(15),
            historic: Duration::from_secs(30),
        }
    }
}

/// Source of news candidates for a symbol.
#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_news(
        &self,
        symbol: &Symbol,
        mode: FetchMode,
    ) -> Result<Vec<NewsItem>, ProviderError>;

    fn name(&self) -> &'static str;

    /// Sources sharing a key share one upstream request budget.
    fn budget_key(&self) -> &'static str {
        self.name()
    }
}

/// Source of OHLCV bars for a symbol.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(
        &self,
        symbol: &Symbol,
        mode: FetchMode,
    ) -> Result<Vec<PriceBar>, ProviderError>;

    fn name(&self) -> &'static str;

    fn budget_key(&self) -> &'static str {
        self.name()
    }
}

/// Hands out strictly increasing `ingested_at` stamps, even when the wall clock
/// returns the same instant twice.
#[derive(Debug, Default)]
pub struct IngestClock {
    last_micros: AtomicI64,
}

impl IngestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
                Err(actual) => prev = actual,
            }
        }
    }
}
