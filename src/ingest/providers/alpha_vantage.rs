// src/ingest/providers/alpha_vantage.rs
//! Alpha Vantage: `NEWS_SENTIMENT` for news with provider-computed sentiment,
//! `TIME_SERIES_INTRADAY` / `TIME_SERIES_DAILY_ADJUSTED` for prices.
//!
//! Alpha Vantage answers throttled calls with HTTP 200 and a `Note` or `Information`
//! field instead of data, so every response is checked for those first.

use super::{clean_text, get_text, http_client, lenient_f64, non_empty, parse_json};
use crate::ingest::types::{CallTimeouts, FetchMode, IngestClock, NewsSource, PriceSource, ProviderError};
use crate::model::{NewsItem, PriceBar, Symbol};
use crate::sentiment::{normalize, SentimentInput};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const NAME: &str = "alphavantage";
const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";
const NEWS_TOPICS: &str = "technology,earnings,ipo,mergers_and_acquisitions";

#[derive(Clone)]
pub struct AlphaVantageClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeouts: CallTimeouts,
    clock: Arc<IngestClock>,
}

impl AlphaVantageClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeouts: CallTimeouts::default(),
            clock: Arc::new(IngestClock::new()),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<IngestClock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(NAME, "ALPHA_VANTAGE_API_KEY is not set"))
    }

    async fn query(&self, params: &[(&str, String)], mode: FetchMode) -> Result<String, ProviderError> {
        let key = self.key()?;
        let req = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(params)
            .query(&[("apikey", key)])
            .timeout(self.timeouts.for_mode(mode));
        let (status, body) = get_text(NAME, req).await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(NAME, status));
        }
        Ok(body)
    }

    /// Turn one decoded response into items, applying the local window filter.
    fn convert_feed(
        &self,
        symbol: &Symbol,
        rsp: NewsSentimentResponse,
        window_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<NewsItem>, ProviderError> {
        rsp.status.check()?;
        let feed = rsp
            .feed
            .ok_or_else(|| ProviderError::invalid(NAME, "response has no `feed`"))?;

        let mut out = Vec::with_capacity(feed.len());
        for raw in feed {
            let Some(title) = clean_text(raw.title) else {
                continue;
            };
            let Some(published_at) = raw.time_published.as_deref().and_then(parse_news_time) else {
                tracing::debug!(target: "ingest", provider = NAME, %symbol, "skipping item with bad time_published");
                continue;
            };
            if window_start.is_some_and(|start| published_at < start) {
                continue;
            }
            let description = clean_text(raw.summary);
            let text = format!("{title}. {}", description.as_deref().unwrap_or_default());
            let sentiment = normalize(SentimentInput::from_provider(
                raw.overall_sentiment_score,
                raw.overall_sentiment_label.as_deref(),
                &text,
            ));
            out.push(NewsItem {
                symbol: symbol.clone(),
                title,
                description,
                url: non_empty(raw.url),
                source_name: non_empty(raw.source),
                published_at,
                sentiment: Some(sentiment),
                ingested_at: self.clock.stamp(),
            });
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl NewsSource for AlphaVantageClient {
    async fn fetch_news(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<NewsItem>, ProviderError> {
        let window_start = mode.window_start(Utc::now());
        let mut params = vec![
            ("function", "NEWS_SENTIMENT".to_string()),
            ("tickers", symbol.to_string()),
            ("topics", NEWS_TOPICS.to_string()),
        ];
        match window_start {
            None => params.push(("limit", "10".to_string())),
            Some(start) => {
                params.push(("limit", "50".to_string()));
                params.push(("time_from", start.format("%Y%m%dT%H%M").to_string()));
            }
        }
        let body = self.query(&params, mode).await?;
        let rsp: NewsSentimentResponse = parse_json(NAME, &body)?;
        self.convert_feed(symbol, rsp, window_start)
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

#[async_trait::async_trait]
impl PriceSource for AlphaVantageClient {
    async fn fetch_prices(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<PriceBar>, ProviderError> {
        match mode.window_start(Utc::now()) {
            None => {
                let params = [
                    ("function", "TIME_SERIES_INTRADAY".to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", "1min".to_string()),
                ];
                let body = self.query(&params, mode).await?;
                let rsp: IntradayResponse = parse_json(NAME, &body)?;
                rsp.status.check()?;
                let series = rsp
                    .series
                    .ok_or_else(|| ProviderError::invalid(NAME, "response has no intraday series"))?;
                // Keys sort chronologically; realtime keeps only the newest complete bar.
                let latest = series
                    .into_iter()
                    .rev()
                    .find_map(|(k, v)| convert_bar(symbol, parse_intraday_time(&k)?, &v, "5. volume"));
                Ok(latest.into_iter().collect())
            }
            Some(start) => {
                let params = [
                    ("function", "TIME_SERIES_DAILY_ADJUSTED".to_string()),
                    ("symbol", symbol.to_string()),
                    ("outputsize", "full".to_string()),
                ];
                let body = self.query(&params, mode).await?;
                let rsp: DailyResponse = parse_json(NAME, &body)?;
                rsp.status.check()?;
                let series = rsp
                    .series
                    .ok_or_else(|| ProviderError::invalid(NAME, "response has no daily series"))?;
                // `outputsize=full` returns decades; the window is applied here.
                Ok(series
                    .into_iter()
                    .filter_map(|(k, v)| {
                        let ts = parse_daily_time(&k)?;
                        (ts >= start).then(|| convert_bar(symbol, ts, &v, "6. volume"))?
                    })
                    .collect())
            }
        }
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

/// In-body status fields Alpha Vantage uses instead of HTTP codes.
#[derive(Debug, Default, Deserialize)]
struct AvStatus {
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

impl AvStatus {
    fn check(&self) -> Result<(), ProviderError> {
        if let Some(e) = &self.error_message {
            return Err(ProviderError::invalid(NAME, e.clone()));
        }
        if let Some(n) = self.note.as_ref().or(self.information.as_ref()) {
            return Err(ProviderError::rate_limited(NAME, n.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NewsSentimentResponse {
    #[serde(flatten)]
    status: AvStatus,
    feed: Option<Vec<FeedItem>>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    title: Option<String>,
    url: Option<String>,
    time_published: Option<String>,
    summary: Option<String>,
    source: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    overall_sentiment_score: Option<f64>,
    overall_sentiment_label: Option<String>,
}

type Series = BTreeMap<String, HashMap<String, String>>;

#[derive(Debug, Deserialize)]
struct IntradayResponse {
    #[serde(flatten)]
    status: AvStatus,
    #[serde(rename = "Time Series (1min)")]
    series: Option<Series>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(flatten)]
    status: AvStatus,
    #[serde(rename = "Time Series (Daily)")]
    series: Option<Series>,
}

fn convert_bar(
    symbol: &Symbol,
    timestamp: DateTime<Utc>,
    fields: &HashMap<String, String>,
    volume_key: &str,
) -> Option<PriceBar> {
    let num = |k: &str| fields.get(k).and_then(|v| v.trim().parse::<f64>().ok());
    Some(PriceBar {
        symbol: symbol.clone(),
        timestamp,
        open: num("1. open"),
        high: num("2. high"),
        low: num("3. low"),
        close: num("4. close")?,
        volume: num(volume_key).map(|v| v as i64),
    })
}

/// `20240115T143000`, occasionally without seconds.
fn parse_news_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M"))
        .ok()
        .map(|n| n.and_utc())
}

fn parse_intraday_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

fn parse_daily_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}
