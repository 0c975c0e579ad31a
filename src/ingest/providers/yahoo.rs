// src/ingest/providers/yahoo.rs
//! Yahoo Finance chart endpoint (`/v8/finance/chart/{symbol}`), prices only.
//! No key required; throttling shows up as plain HTTP 429.

use super::{get_text, http_client, parse_json};
use crate::ingest::types::{CallTimeouts, FetchMode, PriceSource, ProviderError};
use crate::model::{PriceBar, Symbol};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

pub const NAME: &str = "yahoo";
const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

#[derive(Clone)]
pub struct YahooChartClient {
    client: Client,
    base_url: String,
    timeouts: CallTimeouts,
}

impl Default for YahooChartClient {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooChartClient {
    pub fn new() -> Self {
        Self {
            client: http_client(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeouts: CallTimeouts::default(),
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
}

#[async_trait::async_trait]
impl PriceSource for YahooChartClient {
    async fn fetch_prices(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<PriceBar>, ProviderError> {
        let now = Utc::now();
        let params: Vec<(&str, String)> = match mode.window_start(now) {
            None => vec![("interval", "1m".into()), ("range", "1d".into())],
            Some(start) => vec![
                ("interval", "1d".into()),
                ("period1", start.timestamp().to_string()),
                ("period2", now.timestamp().to_string()),
            ],
        };
        let req = self
            .client
            .get(format!("{}/v8/finance/chart/{}", self.base_url, symbol))
            .query(&params)
            .timeout(self.timeouts.for_mode(mode));
        let (status, body) = get_text(NAME, req).await?;

        // Unknown tickers come back as 404 with a chart.error body.
        let envelope = match parse_json::<ChartEnvelope>(NAME, &body) {
            Ok(env) => env,
            Err(e) if status.is_success() => return Err(e),
            Err(_) => return Err(ProviderError::from_status(NAME, status)),
        };
        if let Some(err) = envelope.chart.error {
            return Err(ProviderError::invalid(
                NAME,
                format!("{}: {}", err.code, err.description.unwrap_or_default()),
            ));
        }
        if !status.is_success() {
            return Err(ProviderError::from_status(NAME, status));
        }

        let result = envelope
            .chart
            .result
            .and_then(|mut r| (!r.is_empty()).then(|| r.swap_remove(0)))
            .ok_or_else(|| ProviderError::invalid(NAME, "chart has no result"))?;
        let mut bars = convert_result(symbol, result);

        if mode.is_historic() {
            Ok(bars)
        } else {
            Ok(bars.pop().into_iter().collect())
        }
    }

    fn name(&self) -> &'static str {
        NAME
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Zip the parallel arrays into bars, oldest first. Slots with a null close
/// (the still-forming minute, halted sessions) are dropped.
fn convert_result(symbol: &Symbol, result: ChartResult) -> Vec<PriceBar> {
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let close = at(&quote.close, i)?;
            Some(PriceBar {
                symbol: symbol.clone(),
                timestamp: DateTime::from_timestamp(ts, 0)?,
                open: at(&quote.open, i),
                high: at(&quote.high, i),
                low: at(&quote.low, i),
                close,
                volume: at(&quote.volume, i).map(|v| v as i64),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_close_slots_are_dropped() {
        let raw = r#"{
            "timestamp": [1700000000, 1700000060, 1700000120],
            "indicators": {"quote": [{
                "open":  [1.0, 2.0, 3.0],
                "high":  [1.5, 2.5, null],
                "low":   [0.5, 1.5, 2.5],
                "close": [1.2, null, 3.1],
                "volume":[100, 200, null]
            }]}
        }"#;
        let r: ChartResult = serde_json::from_str(raw).unwrap();
        let bars = convert_result(&Symbol::parse("AAPL").unwrap(), r);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 1.2);
        assert_eq!(bars[0].volume, Some(100));
        assert_eq!(bars[1].close, 3.1);
        assert_eq!(bars[1].high, None);
        assert_eq!(bars[1].volume, None);
    }
}
