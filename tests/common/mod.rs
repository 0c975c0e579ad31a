// tests/common/mod.rs
//
// Scripted news/price sources shared by the scheduler tests.
#![allow(dead_code)]

use chrono::{TimeDelta, Utc};
use market_sentiment_ingest::ingest::types::{FetchMode, NewsSource, PriceSource, ProviderError};
use market_sentiment_ingest::model::{NewsItem, PriceBar, Sentiment, Symbol};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// Called with the symbol and the 1-based call number for that symbol.
pub type Script<T> = Box<dyn Fn(&Symbol, usize) -> Result<Vec<T>, ProviderError> + Send + Sync>;

pub struct FakeSource<T> {
    name: &'static str,
    budget_key: &'static str,
    script: Script<T>,
    calls: Mutex<Vec<(Symbol, Instant)>>,
}

impl<T> FakeSource<T> {
    pub fn new(name: &'static str, script: Script<T>) -> Self {
        Self {
            name,
            budget_key: name,
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn sharing_budget(mut self, key: &'static str) -> Self {
        self.budget_key = key;
        self
    }

    pub fn calls(&self) -> Vec<(Symbol, Instant)> {
        self.calls.lock().clone()
    }

    pub fn called_symbols(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(s, _)| s.to_string()).collect()
    }

    fn run(&self, symbol: &Symbol) -> Result<Vec<T>, ProviderError> {
        let nth = {
            let mut calls = self.calls.lock();
            calls.push((symbol.clone(), Instant::now()));
            calls.iter().filter(|(s, _)| s == symbol).count()
        };
        (self.script)(symbol, nth)
    }
}

#[async_trait::async_trait]
impl NewsSource for FakeSource<NewsItem> {
    async fn fetch_news(&self, symbol: &Symbol, _mode: FetchMode) -> Result<Vec<NewsItem>, ProviderError> {
        self.run(symbol)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn budget_key(&self) -> &'static str {
        self.budget_key
    }
}

#[async_trait::async_trait]
impl PriceSource for FakeSource<PriceBar> {
    async fn fetch_prices(&self, symbol: &Symbol, _mode: FetchMode) -> Result<Vec<PriceBar>, ProviderError> {
        self.run(symbol)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn budget_key(&self) -> &'static str {
        self.budget_key
    }
}

pub fn symbols(list: &str) -> Vec<Symbol> {
    Symbol::parse_list(list)
}

pub fn headline(symbol: &Symbol, n: usize) -> NewsItem {
    let now = Utc::now();
    NewsItem {
        symbol: symbol.clone(),
        title: format!("{symbol} headline {n}"),
        description: None,
        url: Some(format!("https://news.example/{symbol}/{n}")),
        source_name: Some("Example Wire".into()),
        published_at: now - TimeDelta::minutes(5),
        sentiment: Some(Sentiment::clamped(0.2, 0.4)),
        ingested_at: now,
    }
}

pub fn latest_bar(symbol: &Symbol) -> PriceBar {
    PriceBar {
        symbol: symbol.clone(),
        timestamp: Utc::now() - TimeDelta::minutes(1),
        open: Some(100.0),
        high: Some(101.0),
        low: Some(99.0),
        close: 100.5,
        volume: Some(5_000),
    }
}

/// One fresh headline per call.
pub fn news_ok() -> Script<NewsItem> {
    Box::new(|s, n| Ok(vec![headline(s, n)]))
}

pub fn prices_ok() -> Script<PriceBar> {
    Box::new(|s, _| Ok(vec![latest_bar(s)]))
}

pub fn counts_by_symbol(calls: &[(Symbol, Instant)]) -> HashMap<String, usize> {
    let mut m = HashMap::new();
    for (s, _) in calls {
        *m.entry(s.to_string()).or_insert(0) += 1;
    }
    m
}
