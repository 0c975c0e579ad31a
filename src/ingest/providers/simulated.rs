// src/ingest/providers/simulated.rs
//! Synthetic news and daily bars for demos and dry runs.
//!
//! Output is a pure function of (seed, symbol, day), so re-running a simulation over
//! the same window produces the same urls and timestamps and stores nothing new.

use crate::ingest::types::{FetchMode, IngestClock, NewsSource, PriceSource, ProviderError};
use crate::model::{NewsItem, PriceBar, Symbol};
use crate::sentiment::{normalize, SentimentInput};
use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const NAME: &str = "simulated";

const HEADLINES: &[&str] = &[
    "{company} reports strong quarterly earnings, beats expectations",
    "{company} stock surges on positive analyst upgrade",
    "{company} announces innovative product launch",
    "{company} faces regulatory scrutiny over business practices",
    "{company} shares decline amid market uncertainty",
    "{company} CEO optimistic about future growth prospects",
    "{company} misses revenue targets, stock falls",
    "{company} expands into new international markets",
    "{company} partnership deal boosts investor confidence",
    "{company} warns of supply chain headwinds",
];

const OUTLETS: &[&str] = &[
    "Reuters",
    "Bloomberg",
    "CNBC",
    "Wall Street Journal",
    "Financial Times",
    "MarketWatch",
];

#[derive(Debug, Clone)]
pub struct SimulatedSource {
    seed: u64,
    clock: Arc<IngestClock>,
}

impl SimulatedSource {
    /// `None` picks a fresh seed from the thread rng.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed: seed.unwrap_or_else(|| rand::rng().random()),
            clock: Arc::new(IngestClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<IngestClock>) -> Self {
        self.clock = clock;
        self
    }

    fn rng_for(&self, symbol: &Symbol, salt: &str) -> StdRng {
        let mut h = Sha256::new();
        h.update(self.seed.to_be_bytes());
        h.update(symbol.as_str().as_bytes());
        h.update(salt.as_bytes());
        let digest = h.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        StdRng::from_seed(seed)
    }

    fn days(mode: FetchMode, now: DateTime<Utc>) -> Vec<NaiveDate> {
        let today = now.date_naive();
        let first = mode.window_start(now).map_or(today, |s| s.date_naive());
        first.iter_days().take_while(|d| *d <= today).collect()
    }

    /// Daily random walk from a per-symbol starting price, ±5% per day.
    pub fn bars(&self, symbol: &Symbol, mode: FetchMode, now: DateTime<Utc>) -> Vec<PriceBar> {
        let mut rng = self.rng_for(symbol, "prices");
        let mut price: f64 = rng.random_range(50.0..500.0);
        let days = Self::days(mode, now);
        let mut out = Vec::with_capacity(days.len());
        for day in days {
            let open = price;
            let close = open * (1.0 + rng.random_range(-0.05..0.05));
            let high = open.max(close) * rng.random_range(1.0..1.03);
            let low = open.min(close) * rng.random_range(0.97..1.0);
            let volume: i64 = rng.random_range(1_000_000..10_000_000);
            price = close;
            let Some(ts) = day.and_hms_opt(16, 0, 0).map(|n| n.and_utc()) else {
                continue;
            };
            out.push(PriceBar {
                symbol: symbol.clone(),
                timestamp: ts,
                open: Some(round2(open)),
                high: Some(round2(high)),
                low: Some(round2(low)),
                close: round2(close),
                volume: Some(volume),
            });
        }
        if !mode.is_historic() {
            // Realtime: just the latest bar, stamped to the current minute.
            let mut last = out.pop().into_iter().collect::<Vec<_>>();
            if let Some(b) = last.first_mut() {
                b.timestamp = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
            }
            return last;
        }
        out
    }

    /// One to three headlines per day, scored by the lexicon.
    pub fn news(&self, symbol: &Symbol, mode: FetchMode, now: DateTime<Utc>) -> Vec<NewsItem> {
        let mut rng = self.rng_for(symbol, "news");
        let company = crate::ingest::providers::newsapi::company_names(symbol)
            .first()
            .copied()
            .unwrap_or(symbol.as_str())
            .to_string();
        let mut days = Self::days(mode, now);
        if !mode.is_historic() {
            days = days.split_off(days.len().saturating_sub(1));
        }

        let mut out = Vec::new();
        for day in days {
            let n = rng.random_range(1..=3);
            for i in 0..n {
                let title = HEADLINES[rng.random_range(0..HEADLINES.len())].replace("{company}", &company);
                let outlet = OUTLETS[rng.random_range(0..OUTLETS.len())];
                let minute: u32 = rng.random_range(0..(24 * 60));
                let Some(published_at) = day
                    .and_hms_opt(minute / 60, minute % 60, 0)
                    .map(|n| n.and_utc())
                else {
                    continue;
                };
                if published_at > now {
                    continue;
                }
                let description = format!("Market update on {company} ({symbol}) from {outlet}.");
                out.push(NewsItem {
                    symbol: symbol.clone(),
                    sentiment: Some(normalize(SentimentInput::Text(&title))),
                    title,
                    description: Some(description),
                    url: Some(format!(
                        "https://example.com/news/{}-{}-{i}",
                        symbol.as_str().to_ascii_lowercase(),
                        day.format("%Y%m%d")
                    )),
                    source_name: Some(outlet.to_string()),
                    published_at,
                    ingested_at: self.clock.stamp(),
                });
            }
        }
        out
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait::async_trait]
impl NewsSource for SimulatedSource {
    async fn fetch_news(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<NewsItem>, ProviderError> {
        Ok(self.news(symbol, mode, Utc::now()))
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

#[async_trait::async_trait]
impl PriceSource for SimulatedSource {
    async fn fetch_prices(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<PriceBar>, ProviderError> {
        Ok(self.bars(symbol, mode, Utc::now()))
    }

    fn name(&self) -> &'static str {
        NAME
    }
}
