//! # Persistence gateway
//! Idempotent writes for news, price bars and hourly correlation buckets.
//!
//! News and bars are conflict-skip: writing the same record twice stores it once
//! and is not an error. Buckets are conflict-update: a refresh overwrites the row.
//! Batch writes are best-effort per item; a bad record is logged, counted and
//! skipped without failing its neighbours.

pub mod correlation;
pub mod memory;
pub mod postgres;

use crate::model::{CorrelationBucket, NewsItem, PriceBar, Sentiment};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Pool, socket or TLS failure. Later records in the batch would fail the same way.
    #[error("{op}: connection error: {detail}")]
    Connection { op: &'static str, detail: String },

    /// The statement itself was rejected.
    #[error("{op}: query error: {detail}")]
    Query { op: &'static str, detail: String },

    #[error("{op}: unexpected error: {detail}")]
    Unexpected { op: &'static str, detail: String },
}

impl PersistenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Query { .. } => "query",
            Self::Unexpected { .. } => "unexpected",
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Outcome of a best-effort batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn merge(&mut self, other: UpsertReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpsert {
    /// False when the (symbol, timestamp) row already existed.
    pub inserted: bool,
    /// The correlation bucket written for the bar's hour.
    pub snapshot: CorrelationBucket,
}

/// Stored news row whose sentiment is still missing.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSentiment {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
}

/// Row counts behind the post-cycle data-quality check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    /// News published at or after `since`.
    pub recent_news: u64,
    /// Bars stamped at or after `since`.
    pub recent_prices: u64,
    /// Stored news still without a sentiment score, of any age.
    pub pending_sentiment: u64,
}

/// Half-open `[start, end)` range of whole hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HourRange {
    /// Smallest range of whole hours covering `from..=to`.
    pub fn covering(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let (from, to) = if from <= to { (from, to) } else { (to, from) };
        Self {
            start: crate::model::truncate_to_hour(from),
            end: crate::model::truncate_to_hour(to) + TimeDelta::hours(1),
        }
    }

    /// The last `hours` whole hours up to and including the current one.
    pub fn last_hours(now: DateTime<Utc>, hours: i64) -> Self {
        Self::covering(now - TimeDelta::hours(hours), now)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Persistence gateway.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Conflict-skip by url, or by (symbol, title, published_at) when there is no url.
    async fn upsert_news(&self, items: &[NewsItem]) -> Result<UpsertReport, PersistenceError>;

    /// Conflict-skip by (symbol, timestamp), then rewrite the bar's hourly snapshot using
    /// the average sentiment of the 24 h ending at the bar (0 when there is none).
    ///
    /// The snapshot is provisional: its news figures cover the trailing 24 h, not the
    /// hour, until the next [`Store::refresh_correlation_buckets`] over that hour
    /// overwrites the row with per-hour figures.
    async fn upsert_price_bar(&self, bar: &PriceBar) -> Result<PriceUpsert, PersistenceError>;

    /// Recompute and overwrite every bucket with news or prices inside `range`.
    /// Returns the number of buckets written.
    async fn refresh_correlation_buckets(&self, range: HourRange) -> Result<u64, PersistenceError>;

    async fn pending_sentiment(&self, limit: usize) -> Result<Vec<PendingSentiment>, PersistenceError>;

    /// Only fills a missing score; returns false if the row was already scored or is gone.
    async fn set_sentiment(&self, id: i64, sentiment: Sentiment) -> Result<bool, PersistenceError>;

    async fn quality_snapshot(&self, since: DateTime<Utc>) -> Result<QualitySnapshot, PersistenceError>;

    fn name(&self) -> &'static str;
}
