// src/ingest/mod.rs
pub mod pacer;
pub mod providers;
pub mod quality;
pub mod retry;
pub mod scheduler;
pub mod types;

use crate::config::{AppConfig, NewsProviderKind, PriceProviderKind};
use crate::ingest::pacer::PacerRegistry;
use crate::ingest::providers::{
    alpha_vantage::{self, AlphaVantageClient},
    newsapi::{self, NewsApiClient},
    simulated::SimulatedSource,
    yahoo::{self, YahooChartClient},
};
use crate::ingest::types::{IngestClock, NewsSource, PriceSource};
use crate::model::{NewsItem, NewsKey};
use crate::sentiment::{normalize, SentimentInput};
use std::collections::HashSet;
use std::sync::Arc;

/// Normalize article text: decode entities, strip tags, fold quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[a-z][^>]*>").expect("static regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Curly and angle quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Cap at 2000 chars; descriptions from some feeds carry whole articles.
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/// Drop repeats inside one batch, by url or by (symbol, title, published_at).
/// Returns the kept items and how many were dropped.
pub fn dedup_news(items: Vec<NewsItem>) -> (Vec<NewsItem>, usize) {
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut seen_content: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut dropped = 0usize;

    for item in items {
        let fp = item.content_fingerprint();
        let url_dup = match item.key() {
            NewsKey::Url(u) => !seen_urls.insert(u),
            NewsKey::Content(_) => false,
        };
        let content_dup = !seen_content.insert(fp);
        if url_dup || content_dup {
            dropped += 1;
            continue;
        }
        kept.push(item);
    }
    (kept, dropped)
}

/// Fill in sentiment for items a provider left unscored.
pub fn ensure_scored(items: &mut [NewsItem]) {
    for item in items.iter_mut().filter(|i| i.sentiment.is_none()) {
        let text = format!("{}. {}", item.title, item.description.as_deref().unwrap_or_default());
        item.sentiment = Some(normalize(SentimentInput::Text(&text)));
    }
}

/// News and price sources chosen by configuration, plus the pacers for their budgets.
pub struct Sources {
    pub news: Option<Arc<dyn NewsSource>>,
    pub prices: Option<Arc<dyn PriceSource>>,
    pub pacers: PacerRegistry,
}

impl Sources {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let clock = Arc::new(IngestClock::new());
        let alpha = || {
            AlphaVantageClient::new(cfg.alpha_vantage_key.clone())
                .with_timeouts(cfg.timeouts)
                .with_clock(clock.clone())
        };
        let simulated = || SimulatedSource::new(cfg.simulation_seed).with_clock(clock.clone());

        let news: Option<Arc<dyn NewsSource>> = match cfg.news_provider {
            NewsProviderKind::AlphaVantage => Some(Arc::new(alpha())),
            NewsProviderKind::NewsApi => Some(Arc::new(
                NewsApiClient::new(cfg.news_api_key.clone())
                    .with_timeouts(cfg.timeouts)
                    .with_clock(clock.clone()),
            )),
            NewsProviderKind::Simulated => Some(Arc::new(simulated())),
            NewsProviderKind::Disabled => None,
        };
        let prices: Option<Arc<dyn PriceSource>> = match cfg.price_provider {
            PriceProviderKind::Yahoo => Some(Arc::new(YahooChartClient::new().with_timeouts(cfg.timeouts))),
            PriceProviderKind::AlphaVantage => Some(Arc::new(alpha())),
            PriceProviderKind::Simulated => Some(Arc::new(simulated())),
            PriceProviderKind::Disabled => None,
        };

        let pacers = PacerRegistry::new()
            .with_budget(alpha_vantage::NAME, cfg.budgets.alpha_vantage_rpm)
            .with_budget(newsapi::NAME, cfg.budgets.news_api_rpm)
            .with_budget(yahoo::NAME, cfg.budgets.yahoo_rpm);

        Self { news, prices, pacers }
    }

    /// Both families from one simulated source, for `--simulate` runs.
    pub fn simulated(seed: Option<u64>) -> Self {
        let sim = Arc::new(SimulatedSource::new(seed));
        Self {
            news: Some(sim.clone()),
            prices: Some(sim),
            pacers: PacerRegistry::new(),
        }
    }
}
