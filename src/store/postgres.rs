//! PostgreSQL store.
//!
//! Uniqueness lives in the schema (unique indexes), so concurrent or repeated writers
//! never duplicate rows: inserts use `ON CONFLICT DO NOTHING`, buckets use
//! `ON CONFLICT (hour, symbol) DO UPDATE`.

use super::{
    HourRange, PendingSentiment, PersistenceError, PriceUpsert, QualitySnapshot, Store, UpsertReport,
};
use crate::config::DbConfig;
use crate::model::{truncate_to_hour, CorrelationBucket, NewsItem, PriceBar, Sentiment, SentimentCategory};
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS news_with_sentiment (
        id BIGSERIAL PRIMARY KEY,
        symbol VARCHAR(16) NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        url TEXT,
        source_name VARCHAR(128),
        published_at TIMESTAMPTZ NOT NULL,
        sentiment_score DOUBLE PRECISION CHECK (sentiment_score BETWEEN -1 AND 1),
        sentiment_subjectivity DOUBLE PRECISION CHECK (sentiment_subjectivity BETWEEN 0 AND 1),
        ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    r"CREATE UNIQUE INDEX IF NOT EXISTS news_with_sentiment_url_key
        ON news_with_sentiment (url) WHERE url IS NOT NULL AND url <> ''",
    r"CREATE UNIQUE INDEX IF NOT EXISTS news_with_sentiment_content_key
        ON news_with_sentiment (symbol, title, published_at)",
    r"CREATE INDEX IF NOT EXISTS news_with_sentiment_symbol_published
        ON news_with_sentiment (symbol, published_at)",
    r#"CREATE TABLE IF NOT EXISTS stock_prices (
        id BIGSERIAL PRIMARY KEY,
        symbol VARCHAR(16) NOT NULL,
        "timestamp" TIMESTAMPTZ NOT NULL,
        open_price DOUBLE PRECISION,
        high_price DOUBLE PRECISION,
        low_price DOUBLE PRECISION,
        close_price DOUBLE PRECISION NOT NULL,
        volume BIGINT,
        ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (symbol, "timestamp")
    )"#,
    r"CREATE TABLE IF NOT EXISTS financial_sentiment_correlation (
        id BIGSERIAL PRIMARY KEY,
        hour TIMESTAMPTZ NOT NULL,
        symbol VARCHAR(16) NOT NULL,
        avg_sentiment_score DOUBLE PRECISION NOT NULL DEFAULT 0,
        avg_sentiment_subjectivity DOUBLE PRECISION NOT NULL DEFAULT 0,
        avg_close_price DOUBLE PRECISION,
        max_high_price DOUBLE PRECISION,
        min_low_price DOUBLE PRECISION,
        total_volume BIGINT NOT NULL DEFAULT 0,
        news_count BIGINT NOT NULL DEFAULT 0,
        price_points BIGINT NOT NULL DEFAULT 0,
        sentiment_category VARCHAR(16) NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (hour, symbol)
    )",
];

const INSERT_NEWS: &str = r"
    INSERT INTO news_with_sentiment
        (symbol, title, description, url, source_name, published_at,
         sentiment_score, sentiment_subjectivity, ingested_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT DO NOTHING";

const INSERT_BAR: &str = r#"
    INSERT INTO stock_prices
        (symbol, "timestamp", open_price, high_price, low_price, close_price, volume)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (symbol, "timestamp") DO NOTHING"#;

const QUALITY_COUNTS: &str = r#"
    SELECT
        (SELECT COUNT(*) FROM news_with_sentiment WHERE published_at >= $1),
        (SELECT COUNT(*) FROM stock_prices WHERE "timestamp" >= $1),
        (SELECT COUNT(*) FROM news_with_sentiment WHERE sentiment_score IS NULL)"#;

const TRAILING_SENTIMENT: &str = r"
    SELECT AVG(sentiment_score), AVG(sentiment_subjectivity), COUNT(*)
    FROM news_with_sentiment
    WHERE symbol = $1
      AND published_at > $2 - INTERVAL '24 hours'
      AND published_at <= $2";

const HOUR_PRICES: &str = r#"
    SELECT AVG(close_price), MAX(high_price), MIN(low_price),
           COALESCE(SUM(volume), 0)::BIGINT, COUNT(*)
    FROM stock_prices
    WHERE symbol = $1 AND "timestamp" >= $2 AND "timestamp" < $2 + INTERVAL '1 hour'"#;

const UPSERT_BUCKET: &str = r"
    INSERT INTO financial_sentiment_correlation
        (hour, symbol, avg_sentiment_score, avg_sentiment_subjectivity, avg_close_price,
         max_high_price, min_low_price, total_volume, news_count, price_points,
         sentiment_category, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
    ON CONFLICT (hour, symbol) DO UPDATE SET
        avg_sentiment_score = EXCLUDED.avg_sentiment_score,
        avg_sentiment_subjectivity = EXCLUDED.avg_sentiment_subjectivity,
        avg_close_price = EXCLUDED.avg_close_price,
        max_high_price = EXCLUDED.max_high_price,
        min_low_price = EXCLUDED.min_low_price,
        total_volume = EXCLUDED.total_volume,
        news_count = EXCLUDED.news_count,
        price_points = EXCLUDED.price_points,
        sentiment_category = EXCLUDED.sentiment_category,
        updated_at = NOW()";

const REFRESH_BUCKETS: &str = r#"
    WITH news_agg AS (
        SELECT date_trunc('hour', published_at, 'UTC') AS hour, symbol,
               AVG(sentiment_score) AS avg_score,
               AVG(sentiment_subjectivity) AS avg_subj,
               COUNT(*) AS news_count
        FROM news_with_sentiment
        WHERE published_at >= $1 AND published_at < $2
        GROUP BY 1, 2
    ),
    price_agg AS (
        SELECT date_trunc('hour', "timestamp", 'UTC') AS hour, symbol,
               AVG(close_price) AS avg_close,
               MAX(high_price) AS max_high,
               MIN(low_price) AS min_low,
               COALESCE(SUM(volume), 0)::BIGINT AS total_volume,
               COUNT(*) AS price_points
        FROM stock_prices
        WHERE "timestamp" >= $1 AND "timestamp" < $2
        GROUP BY 1, 2
    ),
    joined AS (
        SELECT COALESCE(n.hour, p.hour) AS hour,
               COALESCE(n.symbol, p.symbol) AS symbol,
               COALESCE(n.avg_score, 0) AS avg_score,
               COALESCE(n.avg_subj, 0) AS avg_subj,
               p.avg_close, p.max_high, p.min_low,
               COALESCE(p.total_volume, 0) AS total_volume,
               COALESCE(n.news_count, 0) AS news_count,
               COALESCE(p.price_points, 0) AS price_points
        FROM news_agg n
        FULL OUTER JOIN price_agg p ON n.hour = p.hour AND n.symbol = p.symbol
    )
    INSERT INTO financial_sentiment_correlation
        (hour, symbol, avg_sentiment_score, avg_sentiment_subjectivity, avg_close_price,
         max_high_price, min_low_price, total_volume, news_count, price_points,
         sentiment_category, updated_at)
    SELECT hour, symbol, avg_score, avg_subj, avg_close, max_high, min_low,
           total_volume, news_count, price_points,
           CASE WHEN avg_score > 0.1 THEN 'Positive'
                WHEN avg_score < -0.1 THEN 'Negative'
                ELSE 'Neutral' END,
           NOW()
    FROM joined
    ON CONFLICT (hour, symbol) DO UPDATE SET
        avg_sentiment_score = EXCLUDED.avg_sentiment_score,
        avg_sentiment_subjectivity = EXCLUDED.avg_sentiment_subjectivity,
        avg_close_price = EXCLUDED.avg_close_price,
        max_high_price = EXCLUDED.max_high_price,
        min_low_price = EXCLUDED.min_low_price,
        total_volume = EXCLUDED.total_volume,
        news_count = EXCLUDED.news_count,
        price_points = EXCLUDED.price_points,
        sentiment_category = EXCLUDED.sentiment_category,
        updated_at = NOW()"#;

/// Repository over the three ingestion tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    host: String,
    database: String,
}

impl PgStore {
    /// Connect eagerly so a bad host or password fails at startup, not mid-cycle.
    ///
    /// # Errors
    /// Returns a `Connection` error if the pool cannot open a first connection.
    pub async fn connect(db: &DbConfig) -> Result<Self, PersistenceError> {
        let opts = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .database(&db.name)
            .username(&db.user)
            .password(&db.password);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .map_err(|e| {
                tracing::error!(
                    target: "store",
                    host = %db.host,
                    port = db.port,
                    db = %db.name,
                    user = %db.user,
                    error = %e,
                    "database connection failed"
                );
                classify("connect", e)
            })?;
        tracing::info!(target: "store", host = %db.host, db = %db.name, "connected to postgres");
        Ok(Self {
            pool,
            host: db.host.clone(),
            database: db.name.clone(),
        })
    }

    /// Wrap an existing pool, e.g. one built from `DATABASE_URL` in tests.
    #[must_use]
    pub fn from_pool(pool: PgPool, host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            pool,
            host: host.into(),
            database: database.into(),
        }
    }

    /// Create tables and unique indexes if absent.
    ///
    /// # Errors
    /// Returns the first DDL statement failure.
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| self.fail("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Log with host/db/operation context, count, classify.
    fn fail(&self, op: &'static str, e: sqlx::Error) -> PersistenceError {
        let err = classify(op, e);
        tracing::error!(
            target: "store",
            host = %self.host,
            db = %self.database,
            op,
            kind = err.kind(),
            error = %err,
            "persistence failure"
        );
        counter!("persistence_errors_total", "kind" => err.kind()).increment(1);
        err
    }

    async fn insert_one_news(&self, n: &NewsItem) -> Result<bool, sqlx::Error> {
        let res = sqlx::query(INSERT_NEWS)
            .bind(n.symbol.as_str())
            .bind(&n.title)
            .bind(n.description.as_deref())
            .bind(n.url.as_deref().map(str::trim).filter(|u| !u.is_empty()))
            .bind(n.source_name.as_deref())
            .bind(n.published_at)
            .bind(n.sentiment.map(|s| s.score))
            .bind(n.sentiment.map(|s| s.subjectivity))
            .bind(n.ingested_at)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn write_bucket(&self, b: &CorrelationBucket) -> Result<(), sqlx::Error> {
        sqlx::query(UPSERT_BUCKET)
            .bind(b.hour)
            .bind(b.symbol.as_str())
            .bind(b.avg_sentiment_score)
            .bind(b.avg_subjectivity)
            .bind(b.avg_close_price)
            .bind(b.max_high_price)
            .bind(b.min_low_price)
            .bind(b.total_volume)
            .bind(b.news_count)
            .bind(b.price_points)
            .bind(b.sentiment_category.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Sort sqlx failures into connection / query / unexpected.
fn classify(op: &'static str, e: sqlx::Error) -> PersistenceError {
    let detail = e.to_string();
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_) => PersistenceError::Connection { op, detail },
        sqlx::Error::Database(_)
        | sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => PersistenceError::Query { op, detail },
        _ => PersistenceError::Unexpected { op, detail },
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn upsert_news(&self, items: &[NewsItem]) -> Result<UpsertReport, PersistenceError> {
        let mut report = UpsertReport::default();
        for n in items {
            match self.insert_one_news(n).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    let err = self.fail("upsert_news", e);
                    if err.is_connection() {
                        return Err(err);
                    }
                    tracing::warn!(target: "store", symbol = %n.symbol, title = %n.title, "skipping news item");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn upsert_price_bar(&self, bar: &PriceBar) -> Result<PriceUpsert, PersistenceError> {
        let op = "upsert_price_bar";
        let inserted = sqlx::query(INSERT_BAR)
            .bind(bar.symbol.as_str())
            .bind(bar.timestamp)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail(op, e))?
            .rows_affected()
            == 1;

        let (avg_score, avg_subj, news_count): (Option<f64>, Option<f64>, i64) =
            sqlx::query_as(TRAILING_SENTIMENT)
                .bind(bar.symbol.as_str())
                .bind(bar.timestamp)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| self.fail(op, e))?;

        let hour = truncate_to_hour(bar.timestamp);
        let (avg_close, max_high, min_low, total_volume, price_points): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            i64,
            i64,
        ) = sqlx::query_as(HOUR_PRICES)
            .bind(bar.symbol.as_str())
            .bind(hour)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(op, e))?;

        let avg_sentiment_score = avg_score.unwrap_or(0.0);
        let snapshot = CorrelationBucket {
            hour,
            symbol: bar.symbol.clone(),
            avg_sentiment_score,
            avg_subjectivity: avg_subj.unwrap_or(0.0),
            avg_close_price: avg_close,
            max_high_price: max_high,
            min_low_price: min_low,
            total_volume,
            news_count,
            price_points,
            sentiment_category: SentimentCategory::from_score(avg_sentiment_score),
        };
        self.write_bucket(&snapshot)
            .await
            .map_err(|e| self.fail(op, e))?;
        Ok(PriceUpsert { inserted, snapshot })
    }

    async fn refresh_correlation_buckets(&self, range: HourRange) -> Result<u64, PersistenceError> {
        let res = sqlx::query(REFRESH_BUCKETS)
            .bind(range.start)
            .bind(range.end)
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail("refresh_correlation_buckets", e))?;
        Ok(res.rows_affected())
    }

    async fn pending_sentiment(&self, limit: usize) -> Result<Vec<PendingSentiment>, PersistenceError> {
        let rows: Vec<(i64, String, Option<String>)> = sqlx::query_as(
            r"SELECT id, title, description FROM news_with_sentiment
              WHERE sentiment_score IS NULL ORDER BY id LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail("pending_sentiment", e))?;
        Ok(rows
            .into_iter()
            .map(|(id, title, description)| PendingSentiment {
                id,
                title,
                description,
            })
            .collect())
    }

    async fn set_sentiment(&self, id: i64, sentiment: Sentiment) -> Result<bool, PersistenceError> {
        let s = Sentiment::clamped(sentiment.score, sentiment.subjectivity);
        let res = sqlx::query(
            r"UPDATE news_with_sentiment
              SET sentiment_score = $2, sentiment_subjectivity = $3
              WHERE id = $1 AND sentiment_score IS NULL",
        )
        .bind(id)
        .bind(s.score)
        .bind(s.subjectivity)
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail("set_sentiment", e))?;
        Ok(res.rows_affected() == 1)
    }

    async fn quality_snapshot(&self, since: DateTime<Utc>) -> Result<QualitySnapshot, PersistenceError> {
        let (news, prices, pending): (i64, i64, i64) = sqlx::query_as(QUALITY_COUNTS)
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail("quality_snapshot", e))?;
        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(QualitySnapshot {
            recent_news: count(news),
            recent_prices: count(prices),
            pending_sentiment: count(pending),
        })
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
