//! Hourly aggregation shared by the in-memory store. `PgStore` computes the same
//! figures in SQL; the two must agree.

use crate::model::{truncate_to_hour, CorrelationBucket, NewsItem, PriceBar, SentimentCategory, Symbol};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy)]
struct NewsAgg {
    score_sum: f64,
    subj_sum: f64,
    scored: i64,
    count: i64,
}

impl NewsAgg {
    fn add(&mut self, n: &NewsItem) {
        self.count += 1;
        if let Some(s) = n.sentiment {
            self.score_sum += s.score;
            self.subj_sum += s.subjectivity;
            self.scored += 1;
        }
    }

    /// Averages over scored rows; `(0, 0)` when nothing is scored.
    fn averages(&self) -> (f64, f64) {
        if self.scored == 0 {
            (0.0, 0.0)
        } else {
            (
                self.score_sum / self.scored as f64,
                self.subj_sum / self.scored as f64,
            )
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PriceAgg {
    close_sum: f64,
    max_high: Option<f64>,
    min_low: Option<f64>,
    volume: i64,
    points: i64,
}

impl PriceAgg {
    fn add(&mut self, b: &PriceBar) {
        self.close_sum += b.close;
        self.points += 1;
        self.volume += b.volume.unwrap_or(0);
        if let Some(h) = b.high {
            self.max_high = Some(self.max_high.map_or(h, |m| m.max(h)));
        }
        if let Some(l) = b.low {
            self.min_low = Some(self.min_low.map_or(l, |m| m.min(l)));
        }
    }

    fn avg_close(&self) -> Option<f64> {
        (self.points > 0).then(|| self.close_sum / self.points as f64)
    }
}

fn bucket(hour: DateTime<Utc>, symbol: Symbol, news: NewsAgg, prices: PriceAgg) -> CorrelationBucket {
    let (avg_score, avg_subj) = news.averages();
    CorrelationBucket {
        hour,
        symbol,
        avg_sentiment_score: avg_score,
        avg_subjectivity: avg_subj,
        avg_close_price: prices.avg_close(),
        max_high_price: prices.max_high,
        min_low_price: prices.min_low,
        total_volume: prices.volume,
        news_count: news.count,
        price_points: prices.points,
        sentiment_category: SentimentCategory::from_score(avg_score),
    }
}

/// One bucket per (hour, symbol) that has news or prices in the input.
pub fn build_buckets<'a>(
    news: impl IntoIterator<Item = &'a NewsItem>,
    bars: impl IntoIterator<Item = &'a PriceBar>,
) -> Vec<CorrelationBucket> {
    let mut acc: BTreeMap<(DateTime<Utc>, Symbol), (NewsAgg, PriceAgg)> = BTreeMap::new();
    for n in news {
        acc.entry((truncate_to_hour(n.published_at), n.symbol.clone()))
            .or_default()
            .0
            .add(n);
    }
    for b in bars {
        acc.entry((truncate_to_hour(b.timestamp), b.symbol.clone()))
            .or_default()
            .1
            .add(b);
    }
    acc.into_iter()
        .map(|((hour, symbol), (n, p))| bucket(hour, symbol, n, p))
        .collect()
}

/// Snapshot written for a newly stored bar: price statistics of the bar's hour,
/// sentiment averaged over the 24 h ending at the bar.
pub fn price_snapshot<'a>(
    bar: &PriceBar,
    hour_bars: impl IntoIterator<Item = &'a PriceBar>,
    trailing_news: impl IntoIterator<Item = &'a NewsItem>,
) -> CorrelationBucket {
    let mut n = NewsAgg::default();
    for item in trailing_news {
        n.add(item);
    }
    let mut p = PriceAgg::default();
    for b in hour_bars {
        p.add(b);
    }
    bucket(truncate_to_hour(bar.timestamp), bar.symbol.clone(), n, p)
}

/// Is `published_at` inside the 24 h window that ends at `at`, end inclusive?
pub fn in_trailing_day(published_at: DateTime<Utc>, at: DateTime<Utc>) -> bool {
    published_at > at - TimeDelta::hours(24) && published_at <= at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sentiment;
    use chrono::TimeZone;

    fn sym() -> Symbol {
        Symbol::parse("AAPL").unwrap()
    }

    fn news(h: u32, m: u32, score: Option<f64>) -> NewsItem {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap();
        NewsItem {
            symbol: sym(),
            title: format!("t{h}{m}"),
            description: None,
            url: None,
            source_name: None,
            published_at: ts,
            sentiment: score.map(|s| Sentiment::clamped(s, 0.4)),
            ingested_at: ts,
        }
    }

    fn bar(h: u32, m: u32, close: f64) -> PriceBar {
        PriceBar {
            symbol: sym(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap(),
            open: None,
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close,
            volume: Some(10),
        }
    }

    #[test]
    fn groups_by_hour_and_outer_joins() {
        let ns = [news(9, 5, Some(0.4)), news(9, 40, Some(0.2)), news(9, 50, None)];
        let bs = [bar(9, 1, 100.0), bar(9, 2, 102.0), bar(11, 0, 90.0)];
        let out = build_buckets(ns.iter(), bs.iter());
        assert_eq!(out.len(), 2);

        let b9 = &out[0];
        assert_eq!(b9.news_count, 3);
        assert!((b9.avg_sentiment_score - 0.3).abs() < 1e-9);
        assert_eq!(b9.avg_close_price, Some(101.0));
        assert_eq!(b9.max_high_price, Some(103.0));
        assert_eq!(b9.min_low_price, Some(99.0));
        assert_eq!(b9.total_volume, 20);
        assert_eq!(b9.sentiment_category, SentimentCategory::Positive);

        let b11 = &out[1];
        assert_eq!(b11.news_count, 0);
        assert_eq!(b11.avg_sentiment_score, 0.0);
        assert_eq!(b11.sentiment_category, SentimentCategory::Neutral);
    }

    #[test]
    fn snapshot_without_news_uses_zero() {
        let b = bar(10, 30, 50.0);
        let s = price_snapshot(&b, [&b], std::iter::empty());
        assert_eq!(s.avg_sentiment_score, 0.0);
        assert_eq!(s.price_points, 1);
        assert_eq!(s.hour, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn trailing_day_bounds() {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        assert!(in_trailing_day(at, at));
        assert!(!in_trailing_day(at - TimeDelta::hours(24), at));
        assert!(!in_trailing_day(at + TimeDelta::seconds(1), at));
    }
}
