// src/ingest/providers/mod.rs
pub mod alpha_vantage;
pub mod newsapi;
pub mod simulated;
pub mod yahoo;

use crate::ingest::types::ProviderError;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

const USER_AGENT: &str = concat!("market-sentiment-ingest/", env!("CARGO_PKG_VERSION"));

/// Shared reqwest client. Per-call timeouts are applied on each request.
pub(crate) fn http_client() -> Client {
    match Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(4))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = ?e, "http client builder failed, using defaults");
            Client::new()
        }
    }
}

/// GET, classify the HTTP status, return the body text.
pub(crate) async fn get_text(
    provider: &'static str,
    req: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, String), ProviderError> {
    let rsp = req
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    let status = rsp.status();
    let body = rsp
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    Ok((status, body))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    body: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::invalid(provider, e.to_string()))
}

/// Accepts `1.5`, `"1.5"` or null.
pub(crate) fn lenient_f64<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }
    Ok(match Option::<NumOrStr>::deserialize(d)? {
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// Trimmed; empty strings become `None`.
pub(crate) fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Article text through [`normalize_text`](crate::ingest::normalize_text); empty becomes `None`.
pub(crate) fn clean_text(s: Option<String>) -> Option<String> {
    s.map(|v| crate::ingest::normalize_text(&v))
        .filter(|v| !v.is_empty())
}
