//! # Data model
//! Records that flow from the upstream clients through the scheduler into the store.
//!
//! Every record is immutable once built. The only field ever written after creation is
//! a missing [`NewsItem::sentiment`], filled in by the sentiment backfill.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Ticker symbol, stored trimmed and upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Returns `None` for empty or whitespace-only input.
    pub fn parse(raw: &str) -> Option<Self> {
        let t = raw.trim();
        if t.is_empty() || t.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self(t.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a comma separated list, skipping blanks and repeats while keeping order.
    pub fn parse_list(raw: &str) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = Vec::new();
        for s in raw.split(',').filter_map(Symbol::parse) {
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value).ok_or_else(|| format!("invalid symbol: {value:?}"))
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.0
    }
}

/// Polarity in `[-1, 1]` plus subjectivity in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub score: f64,
    pub subjectivity: f64,
}

impl Sentiment {
    pub const NEUTRAL: Sentiment = Sentiment {
        score: 0.0,
        subjectivity: 0.5,
    };

    /// Builds a sentiment with both components clamped into range.
    pub fn clamped(score: f64, subjectivity: f64) -> Self {
        Self {
            score: clamp_or(score, -1.0, 1.0, 0.0),
            subjectivity: clamp_or(subjectivity, 0.0, 1.0, 0.5),
        }
    }
}

fn clamp_or(v: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v.clamp(lo, hi)
    } else {
        fallback
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub symbol: Symbol,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub source_name: Option<String>,
    pub published_at: DateTime<Utc>,
    /// `None` only for rows waiting on the sentiment backfill.
    pub sentiment: Option<Sentiment>,
    pub ingested_at: DateTime<Utc>,
}

/// Identity of a news item: its url when it has one, otherwise symbol + title + time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NewsKey {
    Url(String),
    Content(String),
}

impl NewsItem {
    pub fn key(&self) -> NewsKey {
        match self.url.as_deref().map(str::trim) {
            Some(u) if !u.is_empty() => NewsKey::Url(u.to_string()),
            _ => NewsKey::Content(self.content_fingerprint()),
        }
    }

    /// sha256 over symbol, title and publish time; stable across runs.
    pub fn content_fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.symbol.as_str().as_bytes());
        h.update([0u8]);
        h.update(self.title.as_bytes());
        h.update([0u8]);
        h.update(self.published_at.timestamp().to_be_bytes());
        h.finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentimentCategory {
    Positive,
    Neutral,
    Negative,
}

impl SentimentCategory {
    pub fn from_score(avg: f64) -> Self {
        if avg > 0.1 {
            Self::Positive
        } else if avg < -0.1 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "Positive",
            Self::Neutral => "Neutral",
            Self::Negative => "Negative",
        }
    }
}

/// Hourly join of news sentiment and price statistics for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationBucket {
    pub hour: DateTime<Utc>,
    pub symbol: Symbol,
    pub avg_sentiment_score: f64,
    pub avg_subjectivity: f64,
    pub avg_close_price: Option<f64>,
    pub max_high_price: Option<f64>,
    pub min_low_price: Option<f64>,
    pub total_volume: i64,
    pub news_count: i64,
    pub price_points: i64,
    pub sentiment_category: SentimentCategory,
}

/// Truncate a timestamp to the start of its hour.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}
