// src/config/mod.rs
//! Process configuration from environment variables (`.env` is loaded by the binary).
//!
//! Missing API keys are not an error here: the matching provider reports
//! `NotConfigured` and the scheduler skips it for the run.

pub mod db;

pub use db::DbConfig;

use crate::ingest::retry::RetryPolicy;
use crate::ingest::types::CallTimeouts;
use crate::model::Symbol;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SYMBOLS: &str = "AAPL,MSFT,GOOGL,AMZN,TSLA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsProviderKind {
    AlphaVantage,
    NewsApi,
    Simulated,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceProviderKind {
    Yahoo,
    AlphaVantage,
    Simulated,
    Disabled,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(anyhow!("unknown STORE_BACKEND {other:?}")),
        }
    }
}

impl FromStr for NewsProviderKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alphavantage" | "alpha_vantage" | "alpha-vantage" => Ok(Self::AlphaVantage),
            "newsapi" | "news_api" => Ok(Self::NewsApi),
            "simulated" | "sim" => Ok(Self::Simulated),
            "none" | "off" | "disabled" => Ok(Self::Disabled),
            other => Err(anyhow!("unknown NEWS_PROVIDER {other:?}")),
        }
    }
}

impl FromStr for PriceProviderKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yahoo" => Ok(Self::Yahoo),
            "alphavantage" | "alpha_vantage" | "alpha-vantage" => Ok(Self::AlphaVantage),
            "simulated" | "sim" => Ok(Self::Simulated),
            "none" | "off" | "disabled" => Ok(Self::Disabled),
            other => Err(anyhow!("unknown PRICE_PROVIDER {other:?}")),
        }
    }
}

/// Requests per minute allowed by each upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderBudgets {
    pub alpha_vantage_rpm: u32,
    pub news_api_rpm: u32,
    pub yahoo_rpm: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub alpha_vantage_key: Option<String>,
    pub news_api_key: Option<String>,
    pub db: DbConfig,
    pub store_backend: StoreBackend,
    pub interval: Duration,
    pub symbols: Vec<Symbol>,
    /// Name of the downstream stream/sink the rows feed; carried into logs.
    pub sink_name: String,
    pub news_provider: NewsProviderKind,
    pub price_provider: PriceProviderKind,
    pub budgets: ProviderBudgets,
    pub timeouts: CallTimeouts,
    pub retry: RetryPolicy,
    pub error_cooldown: Duration,
    pub simulation_seed: Option<u64>,
    pub rate_limit_config_path: Option<PathBuf>,
    pub metrics_flush: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parse = |k: &str, default: u64| -> Result<u64> {
            match var(k) {
                Some(v) => v.parse::<u64>().with_context(|| format!("{k} must be an integer, got {v:?}")),
                None => Ok(default),
            }
        };
        let secs = |k: &str, default: u64| parse(k, default).map(Duration::from_secs);
        let rpm = |k: &str, default: u32| -> Result<u32> {
            let v = parse(k, u64::from(default))?;
            u32::try_from(v).with_context(|| format!("{k} out of range"))
        };

        let db = DbConfig {
            host: var("DB_HOST").unwrap_or_else(|| DbConfig::default().host),
            port: match var("DB_PORT") {
                Some(p) => p.parse().with_context(|| format!("DB_PORT must be a port number, got {p:?}"))?,
                None => 5432,
            },
            name: var("DB_NAME").unwrap_or_else(|| DbConfig::default().name),
            user: var("DB_USER").unwrap_or_else(|| DbConfig::default().user),
            password: get("DB_PASSWORD").unwrap_or_else(|| DbConfig::default().password),
        };

        let symbols = Symbol::parse_list(&var("STOCK_SYMBOLS").unwrap_or_else(|| DEFAULT_SYMBOLS.into()));
        if symbols.is_empty() {
            return Err(anyhow!("STOCK_SYMBOLS contains no valid symbols"));
        }

        let interval_minutes = parse("INGEST_INTERVAL_MINUTES", 5)?;
        if interval_minutes == 0 {
            return Err(anyhow!("INGEST_INTERVAL_MINUTES must be at least 1"));
        }

        let retry = RetryPolicy {
            max_retries: u32::try_from(parse("INGEST_MAX_RETRIES", 3)?).context("INGEST_MAX_RETRIES out of range")?,
            rate_limit_backoff: secs("RATE_LIMIT_BACKOFF_SECS", 60)?,
            ..RetryPolicy::default()
        };

        Ok(Self {
            alpha_vantage_key: var("ALPHA_VANTAGE_API_KEY"),
            news_api_key: var("NEWS_API_KEY"),
            db,
            store_backend: var("STORE_BACKEND").as_deref().unwrap_or("postgres").parse()?,
            interval: Duration::from_secs(interval_minutes * 60),
            symbols,
            sink_name: var("SINK_NAME")
                .or_else(|| var("KINESIS_STREAM_NAME"))
                .unwrap_or_else(|| "financial-sentiment-stream".into()),
            news_provider: var("NEWS_PROVIDER").as_deref().unwrap_or("alphavantage").parse()?,
            price_provider: var("PRICE_PROVIDER").as_deref().unwrap_or("yahoo").parse()?,
            budgets: ProviderBudgets {
                alpha_vantage_rpm: rpm("ALPHA_VANTAGE_RPM", 5)?,
                news_api_rpm: rpm("NEWS_API_RPM", 100)?,
                yahoo_rpm: rpm("YAHOO_RPM", 60)?,
            },
            timeouts: CallTimeouts {
                realtime: secs("PROVIDER_TIMEOUT_SECS", 15)?,
                historic: secs("HISTORIC_TIMEOUT_SECS", 30)?,
            },
            retry,
            error_cooldown: secs("INGEST_ERROR_COOLDOWN_SECS", 60)?,
            simulation_seed: match var("SIMULATION_SEED") {
                Some(s) => Some(s.parse().with_context(|| format!("SIMULATION_SEED must be an integer, got {s:?}"))?),
                None => None,
            },
            rate_limit_config_path: var("RATE_LIMIT_CONFIG_PATH").map(PathBuf::from),
            metrics_flush: secs("METRICS_FLUSH_SECS", 60)?,
        })
    }

    /// Safe diagnostics: key presence and lengths, never key values or the DB password.
    pub fn log_summary(&self) {
        tracing::info!(
            symbols = self.symbols.len(),
            interval_secs = self.interval.as_secs(),
            news = ?self.news_provider,
            prices = ?self.price_provider,
            store = ?self.store_backend,
            sink = %self.sink_name,
            alpha_vantage_key_len = self.alpha_vantage_key.as_ref().map_or(0, String::len),
            news_api_key_len = self.news_api_key.as_ref().map_or(0, String::len),
            db_host = %self.db.host,
            db_name = %self.db.name,
            "config loaded"
        );
        if self.alpha_vantage_key.is_none() && self.news_provider == NewsProviderKind::AlphaVantage {
            tracing::warn!("ALPHA_VANTAGE_API_KEY not set; Alpha Vantage will be skipped");
        }
        if self.news_api_key.is_none() && self.news_provider == NewsProviderKind::NewsApi {
            tracing::warn!("NEWS_API_KEY not set; NewsAPI will be skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_match_deployment() {
        let c = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c.db, DbConfig::default());
        assert_eq!(c.interval, Duration::from_secs(300));
        assert_eq!(c.symbols.len(), 5);
        assert_eq!(c.news_provider, NewsProviderKind::AlphaVantage);
        assert_eq!(c.price_provider, PriceProviderKind::Yahoo);
        assert_eq!(c.budgets.alpha_vantage_rpm, 5);
        assert_eq!(c.store_backend, StoreBackend::Postgres);
        assert!(c.alpha_vantage_key.is_none());
        assert_eq!(c.sink_name, "financial-sentiment-stream");
    }

    #[test]
    fn overrides_and_aliases() {
        let c = AppConfig::from_lookup(lookup(&[
            ("STOCK_SYMBOLS", "nvda, jpm"),
            ("INGEST_INTERVAL_MINUTES", "15"),
            ("KINESIS_STREAM_NAME", "legacy-stream"),
            ("NEWS_PROVIDER", "NewsAPI"),
            ("STORE_BACKEND", "memory"),
            ("ALPHA_VANTAGE_API_KEY", "  "),
            ("DB_PORT", "6543"),
        ]))
        .unwrap();
        assert_eq!(c.symbols[0].as_str(), "NVDA");
        assert_eq!(c.interval, Duration::from_secs(900));
        assert_eq!(c.sink_name, "legacy-stream");
        assert_eq!(c.news_provider, NewsProviderKind::NewsApi);
        assert_eq!(c.store_backend, StoreBackend::Memory);
        assert!(c.alpha_vantage_key.is_none(), "blank key counts as missing");
        assert_eq!(c.db.port, 6543);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(AppConfig::from_lookup(lookup(&[("DB_PORT", "abc")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("STOCK_SYMBOLS", " , ")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("INGEST_INTERVAL_MINUTES", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("PRICE_PROVIDER", "bloomberg")])).is_err());
    }
}
