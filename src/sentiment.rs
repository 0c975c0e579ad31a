//! # Sentiment normalizer
//! Turns whatever an upstream provider hands us (a numeric polarity, a categorical
//! label, or bare text) into a [`Sentiment`] with score in `[-1, 1]` and subjectivity
//! in `[0, 1]`.
//!
//! Provider sentiment wins when present. Text is only scored locally, with the
//! lexicon in `sentiment_lexicon.json`, when the provider gave nothing usable.

use crate::model::Sentiment;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static LEXICON: Lazy<HashMap<String, (f64, f64)>> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, (f64, f64)>>(raw).expect("valid sentiment lexicon")
});

/// Polarity assigned to a bare categorical label.
pub const LABEL_POLARITY: f64 = 0.5;

/// What a provider supplied for one article.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SentimentInput<'a> {
    Polarity(f64),
    Label(&'a str),
    Text(&'a str),
    Empty,
}

impl<'a> SentimentInput<'a> {
    /// Pick the strongest signal available: numeric score, then label, then text.
    /// Non-finite scores count as absent.
    pub fn from_provider(score: Option<f64>, label: Option<&'a str>, text: &'a str) -> Self {
        if let Some(s) = score.filter(|s| s.is_finite()) {
            return Self::Polarity(s);
        }
        if let Some(l) = label.map(str::trim).filter(|l| !l.is_empty()) {
            return Self::Label(l);
        }
        if !text.trim().is_empty() {
            return Self::Text(text);
        }
        Self::Empty
    }
}

/// Deterministic, side-effect free.
pub fn normalize(input: SentimentInput<'_>) -> Sentiment {
    match input {
        SentimentInput::Polarity(p) => Sentiment::clamped(p, Sentiment::NEUTRAL.subjectivity),
        SentimentInput::Label(l) => Sentiment {
            score: label_polarity(l),
            subjectivity: Sentiment::NEUTRAL.subjectivity,
        },
        SentimentInput::Text(t) => SentimentAnalyzer.score_text(t),
        SentimentInput::Empty => Sentiment::NEUTRAL,
    }
}

/// `positive` → +0.5, `negative` → -0.5, anything else → 0.0.
/// Alpha Vantage's bullish/bearish scale folds onto the same three buckets.
pub fn label_polarity(label: &str) -> f64 {
    let l = label.trim().to_ascii_lowercase().replace('_', "-");
    match l.as_str() {
        "positive" | "bullish" | "somewhat-bullish" => LABEL_POLARITY,
        "negative" | "bearish" | "somewhat-bearish" => -LABEL_POLARITY,
        _ => 0.0,
    }
}

/// Lexicon scorer used when a provider returns only text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentimentAnalyzer;

impl SentimentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Mean polarity and mean subjectivity over the words found in the lexicon.
    ///
    /// A negator within the previous three tokens flips and halves a word's polarity;
    /// an intensifier directly before a word scales it by 1.3.
    /// Text with no lexicon words yields [`Sentiment::NEUTRAL`].
    pub fn score_text(&self, text: &str) -> Sentiment {
        let tokens: Vec<String> = tokenize(text).collect();
        let mut pol_sum = 0.0;
        let mut subj_sum = 0.0;
        let mut hits = 0usize;

        for i in 0..tokens.len() {
            let Some(&(mut pol, mut subj)) = LEXICON.get(tokens[i].as_str()) else {
                continue;
            };
            if i >= 1 && is_intensifier(tokens[i - 1].as_str()) {
                pol *= 1.3;
                subj *= 1.3;
            }
            let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
            if negated {
                pol *= -0.5;
            }
            pol_sum += pol;
            subj_sum += subj;
            hits += 1;
        }

        if hits == 0 {
            return Sentiment::NEUTRAL;
        }
        Sentiment::clamped(pol_sum / hits as f64, subj_sum / hits as f64)
    }
}

fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not"
            | "no"
            | "never"
            | "isn't"
            | "wasn't"
            | "aren't"
            | "won't"
            | "can't"
            | "cannot"
            | "didn't"
            | "doesn't"
            | "without"
    )
}

fn is_intensifier(tok: &str) -> bool {
    matches!(
        tok,
        "very" | "extremely" | "highly" | "strongly" | "sharply" | "significantly"
    )
}
