// src/ingest/providers/newsapi.rs
//! NewsAPI `/v2/everything`. Returns raw articles without sentiment, so every item
//! is scored locally by the lexicon normalizer.

use super::{clean_text, get_text, http_client, non_empty, parse_json};
use crate::ingest::types::{CallTimeouts, FetchMode, IngestClock, NewsSource, ProviderError};
use crate::model::{NewsItem, Symbol};
use crate::sentiment::{normalize, SentimentInput};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

pub const NAME: &str = "newsapi";
const DEFAULT_BASE_URL: &str = "https://newsapi.org";

/// Company names searched for each known ticker. Unknown tickers search the ticker.
pub fn company_names(symbol: &Symbol) -> Vec<&str> {
    let names: &[&'static str] = match symbol.as_str() {
        "AAPL" => &["Apple"],
        "GOOGL" | "GOOG" => &["Google", "Alphabet"],
        "MSFT" => &["Microsoft"],
        "AMZN" => &["Amazon"],
        "TSLA" => &["Tesla"],
        "META" => &["Meta", "Facebook"],
        "NVDA" => &["NVIDIA"],
        "NFLX" => &["Netflix"],
        "JPM" => &["JPMorgan"],
        "JNJ" => &["Johnson & Johnson"],
        "V" => &["Visa"],
        "PG" => &["Procter & Gamble"],
        "UNH" => &["UnitedHealth"],
        "HD" => &["Home Depot"],
        "MA" => &["Mastercard"],
        "DIS" => &["Disney"],
        "PYPL" => &["PayPal"],
        "BAC" => &["Bank of America"],
        _ => &[],
    };
    if names.is_empty() {
        vec![symbol.as_str()]
    } else {
        names.to_vec()
    }
}

/// `("Google" OR "Alphabet") AND (stock OR market OR financial OR earnings)`
pub fn build_query(symbol: &Symbol) -> String {
    let names = company_names(symbol)
        .into_iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({names}) AND (stock OR market OR financial OR earnings)")
}

#[derive(Clone)]
pub struct NewsApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeouts: CallTimeouts,
    clock: Arc<IngestClock>,
}

impl NewsApiClient {
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
}

#[async_trait::async_trait]
impl NewsSource for NewsApiClient {
    async fn fetch_news(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<NewsItem>, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::not_configured(NAME, "NEWS_API_KEY is not set"))?;

        let window_start = mode.window_start(Utc::now());
        let mut params: Vec<(&str, String)> = vec![
            ("q", build_query(symbol)),
            ("language", "en".into()),
            ("sortBy", "publishedAt".into()),
            ("apiKey", key.to_string()),
        ];
        match window_start {
            None => params.push(("pageSize", "10".into())),
            Some(start) => {
                params.push(("pageSize", "100".into()));
                params.push(("from", start.format("%Y-%m-%dT%H:%M:%S").to_string()));
            }
        }

        let req = self
            .client
            .get(format!("{}/v2/everything", self.base_url))
            .query(&params)
            .timeout(self.timeouts.for_mode(mode));
        let (status, body) = get_text(NAME, req).await?;

        // Error bodies carry a machine-readable `code`, prefer it over the status.
        let rsp = match parse_json::<EverythingResponse>(NAME, &body) {
            Ok(r) => r,
            Err(e) if status.is_success() => return Err(e),
            Err(_) => return Err(ProviderError::from_status(NAME, status)),
        };
        if rsp.status != "ok" {
            let code = rsp.code.unwrap_or_default();
            let detail = format!("{code}: {}", rsp.message.unwrap_or_default());
            return Err(match code.as_str() {
                "rateLimited" => ProviderError::rate_limited(NAME, detail),
                "apiKeyInvalid" | "apiKeyMissing" | "apiKeyDisabled" | "apiKeyExhausted" => {
                    ProviderError::not_configured(NAME, detail)
                }
                "unexpectedError" => ProviderError::transient(NAME, detail),
                _ => ProviderError::invalid(NAME, detail),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::from_status(NAME, status));
        }

        let mut out = Vec::with_capacity(rsp.articles.len());
        for a in rsp.articles {
            let Some(title) = clean_text(a.title).filter(|t| t != "[Removed]") else {
                continue;
            };
            let Some(published_at) = a
                .published_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
            else {
                continue;
            };
            if window_start.is_some_and(|start| published_at < start) {
                continue;
            }
            let description = clean_text(a.description);
            let text = format!("{title}. {}", description.as_deref().unwrap_or_default());
            out.push(NewsItem {
                symbol: symbol.clone(),
                title,
                description,
                url: non_empty(a.url),
                source_name: a.source.and_then(|s| non_empty(s.name)),
                published_at,
                sentiment: Some(normalize(SentimentInput::Text(&text))),
                ingested_at: self.clock.stamp(),
            });
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

#[derive(Debug, Deserialize)]
struct EverythingResponse {
    status: String,
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Article {
    source: Option<ArticleSource>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArticleSource {
    name: Option<String>,
}
