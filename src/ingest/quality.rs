// src/ingest/quality.rs
//! Post-cycle data-quality check.
//!
//! After a realtime cycle the store is asked how much fresh data it holds. Too few
//! recent news rows or price bars, or news still waiting for a score, are reported
//! as issues. Issues are warnings; they never fail the cycle.

use crate::store::QualitySnapshot;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// How far back "recent" reaches.
    pub window: Duration,
    pub min_recent_news: u64,
    pub min_recent_prices: u64,
    pub max_pending_sentiment: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(4 * 3600),
            min_recent_news: 10,
            min_recent_prices: 50,
            max_pending_sentiment: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    FewRecentNews { count: u64, min: u64 },
    FewRecentPrices { count: u64, min: u64 },
    PendingSentiment { count: u64, max: u64 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FewRecentNews { count, min } => write!(f, "few recent news: {count} (want {min})"),
            Self::FewRecentPrices { count, min } => write!(f, "few recent prices: {count} (want {min})"),
            Self::PendingSentiment { count, max } => {
                write!(f, "news pending sentiment: {count} (allowed {max})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub snapshot: QualitySnapshot,
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn evaluate(snapshot: QualitySnapshot, t: &QualityThresholds) -> Self {
        let mut issues = Vec::new();
        if snapshot.recent_news < t.min_recent_news {
            issues.push(QualityIssue::FewRecentNews {
                count: snapshot.recent_news,
                min: t.min_recent_news,
            });
        }
        if snapshot.recent_prices < t.min_recent_prices {
            issues.push(QualityIssue::FewRecentPrices {
                count: snapshot.recent_prices,
                min: t.min_recent_prices,
            });
        }
        if snapshot.pending_sentiment > t.max_pending_sentiment {
            issues.push(QualityIssue::PendingSentiment {
                count: snapshot.pending_sentiment,
                max: t.max_pending_sentiment,
            });
        }
        Self { snapshot, issues }
    }

    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(news: u64, prices: u64, pending: u64) -> QualitySnapshot {
        QualitySnapshot {
            recent_news: news,
            recent_prices: prices,
            pending_sentiment: pending,
        }
    }

    #[test]
    fn thresholds_are_inclusive() {
        let t = QualityThresholds::default();
        assert!(QualityReport::evaluate(snap(10, 50, 0), &t).is_healthy());

        let r = QualityReport::evaluate(snap(9, 49, 1), &t);
        assert_eq!(
            r.issues,
            vec![
                QualityIssue::FewRecentNews { count: 9, min: 10 },
                QualityIssue::FewRecentPrices { count: 49, min: 50 },
                QualityIssue::PendingSentiment { count: 1, max: 0 },
            ]
        );
        assert_eq!(r.issues[0].to_string(), "few recent news: 9 (want 10)");
    }

    #[test]
    fn issues_serialize_with_a_tag() {
        let v = serde_json::to_value(QualityIssue::PendingSentiment { count: 3, max: 0 }).unwrap();
        assert_eq!(v["issue"], "pending_sentiment");
        assert_eq!(v["count"], 3);
    }
}
