//! Process-local store with the same uniqueness rules as the Postgres schema.
//! Backs `STORE_BACKEND=memory` dry runs and the test suite.

use super::correlation::{build_buckets, in_trailing_day, price_snapshot};
use super::{
    HourRange, PendingSentiment, PersistenceError, PriceUpsert, QualitySnapshot, Store, UpsertReport,
};
use crate::model::{truncate_to_hour, CorrelationBucket, NewsItem, PriceBar, Sentiment, Symbol};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    news: BTreeMap<i64, NewsItem>,
    urls: HashSet<String>,
    fingerprints: HashSet<String>,
    bars: BTreeMap<(Symbol, DateTime<Utc>), PriceBar>,
    buckets: BTreeMap<(DateTime<Utc>, Symbol), CorrelationBucket>,
    failing: HashSet<Symbol>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write for `symbol` fail with a query error.
    pub fn fail_writes_for(&self, symbol: &Symbol) {
        self.state.lock().failing.insert(symbol.clone());
    }

    pub fn news(&self) -> Vec<NewsItem> {
        self.state.lock().news.values().cloned().collect()
    }

    pub fn bars(&self) -> Vec<PriceBar> {
        self.state.lock().bars.values().cloned().collect()
    }

    pub fn buckets(&self) -> Vec<CorrelationBucket> {
        self.state.lock().buckets.values().cloned().collect()
    }

    pub fn bucket(&self, hour: DateTime<Utc>, symbol: &Symbol) -> Option<CorrelationBucket> {
        self.state
            .lock()
            .buckets
            .get(&(truncate_to_hour(hour), symbol.clone()))
            .cloned()
    }
}

fn rejected(op: &'static str, symbol: &Symbol) -> PersistenceError {
    let err = PersistenceError::Query {
        op,
        detail: format!("writes for {symbol} are disabled"),
    };
    counter!("persistence_errors_total", "kind" => err.kind()).increment(1);
    err
}

impl State {
    fn insert_news(&mut self, item: &NewsItem) -> bool {
        let url = item
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let fp = item.content_fingerprint();
        if url.as_ref().is_some_and(|u| self.urls.contains(u)) || self.fingerprints.contains(&fp) {
            return false;
        }
        if let Some(u) = url {
            self.urls.insert(u);
        }
        self.fingerprints.insert(fp);
        self.next_id += 1;
        let mut stored = item.clone();
        stored.sentiment = item.sentiment.map(|s| Sentiment::clamped(s.score, s.subjectivity));
        self.news.insert(self.next_id, stored);
        true
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn upsert_news(&self, items: &[NewsItem]) -> Result<UpsertReport, PersistenceError> {
        let mut st = self.state.lock();
        let mut report = UpsertReport::default();
        for item in items {
            if st.failing.contains(&item.symbol) {
                let e = rejected("upsert_news", &item.symbol);
                tracing::warn!(target: "store", error = %e, "news insert failed");
                report.failed += 1;
                continue;
            }
            if st.insert_news(item) {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }
        Ok(report)
    }

    async fn upsert_price_bar(&self, bar: &PriceBar) -> Result<PriceUpsert, PersistenceError> {
        let mut st = self.state.lock();
        if st.failing.contains(&bar.symbol) {
            return Err(rejected("upsert_price_bar", &bar.symbol));
        }
        let key = (bar.symbol.clone(), bar.timestamp);
        let inserted = !st.bars.contains_key(&key);
        if inserted {
            st.bars.insert(key, bar.clone());
        }

        let hour = truncate_to_hour(bar.timestamp);
        let snapshot = {
            let hour_bars = st
                .bars
                .values()
                .filter(|b| b.symbol == bar.symbol && truncate_to_hour(b.timestamp) == hour);
            let trailing = st
                .news
                .values()
                .filter(|n| n.symbol == bar.symbol && in_trailing_day(n.published_at, bar.timestamp));
            price_snapshot(bar, hour_bars, trailing)
        };
        st.buckets
            .insert((snapshot.hour, snapshot.symbol.clone()), snapshot.clone());
        Ok(PriceUpsert { inserted, snapshot })
    }

    async fn refresh_correlation_buckets(&self, range: HourRange) -> Result<u64, PersistenceError> {
        let mut st = self.state.lock();
        let fresh = build_buckets(
            st.news.values().filter(|n| range.contains(n.published_at)),
            st.bars.values().filter(|b| range.contains(b.timestamp)),
        );
        let written = fresh.len() as u64;
        for b in fresh {
            st.buckets.insert((b.hour, b.symbol.clone()), b);
        }
        Ok(written)
    }

    async fn pending_sentiment(&self, limit: usize) -> Result<Vec<PendingSentiment>, PersistenceError> {
        let st = self.state.lock();
        Ok(st
            .news
            .iter()
            .filter(|(_, n)| n.sentiment.is_none())
            .take(limit)
            .map(|(id, n)| PendingSentiment {
                id: *id,
                title: n.title.clone(),
                description: n.description.clone(),
            })
            .collect())
    }

    async fn set_sentiment(&self, id: i64, sentiment: Sentiment) -> Result<bool, PersistenceError> {
        let mut st = self.state.lock();
        match st.news.get_mut(&id) {
            Some(n) if n.sentiment.is_none() => {
                n.sentiment = Some(Sentiment::clamped(sentiment.score, sentiment.subjectivity));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn quality_snapshot(&self, since: DateTime<Utc>) -> Result<QualitySnapshot, PersistenceError> {
        let st = self.state.lock();
        Ok(QualitySnapshot {
            recent_news: st.news.values().filter(|n| n.published_at >= since).count() as u64,
            recent_prices: st.bars.values().filter(|b| b.timestamp >= since).count() as u64,
            pending_sentiment: st.news.values().filter(|n| n.sentiment.is_none()).count() as u64,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn rejected_writes_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let store = MemoryStore::new();
        let sym = Symbol::parse("GOOGL").unwrap();
        store.fail_writes_for(&sym);
        let bar = PriceBar {
            symbol: sym,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 15, 30, 0).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 140.0,
            volume: None,
        };

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        metrics::with_local_recorder(&recorder, || {
            let err = rt.block_on(store.upsert_price_bar(&bar)).unwrap_err();
            assert_eq!(err.kind(), "query");
            assert!(!err.is_connection());
        });

        let snap = snapshotter.snapshot().into_vec();
        let errors = snap
            .iter()
            .find(|(k, _, _, _)| k.key().name() == "persistence_errors_total")
            .map(|(_, _, _, v)| v);
        assert_eq!(errors, Some(&DebugValue::Counter(1)));
        assert!(store.bars().is_empty());
    }
}
