// tests/providers_alpha_vantage.rs
//
// Alpha Vantage client against a local wiremock server.

use chrono::{TimeDelta, Utc};
use market_sentiment_ingest::ingest::providers::alpha_vantage::AlphaVantageClient;
use market_sentiment_ingest::ingest::types::{FetchMode, Lookback, NewsSource, PriceSource, ProviderError};
use market_sentiment_ingest::model::Symbol;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn aapl() -> Symbol {
    Symbol::parse("AAPL").unwrap()
}

async fn client(server: &MockServer) -> AlphaVantageClient {
    AlphaVantageClient::new(Some("demo".into())).with_base_url(server.uri())
}

#[tokio::test]
async fn news_prefers_provider_score_then_label() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query"))
        .and(query_param("function", "NEWS_SENTIMENT"))
        .and(query_param("tickers", "AAPL"))
        .and(query_param("limit", "10"))
        .and(query_param("apikey", "demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": "2",
            "feed": [
                {
                    "title": "Apple&#39;s <b>services</b> revenue jumps",
                    "url": "https://news.example/apple-services",
                    "time_published": "20240115T143000",
                    "summary": "Strong quarter.",
                    "source": "Example Wire",
                    "overall_sentiment_score": "0.35",
                    "overall_sentiment_label": "Somewhat-Bullish"
                },
                {
                    "title": "Apple faces probe",
                    "url": "https://news.example/apple-probe",
                    "time_published": "20240115T150000",
                    "overall_sentiment_label": "negative"
                },
                {
                    "title": "   ",
                    "url": "https://news.example/empty",
                    "time_published": "20240115T150000"
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let items = client(&server).await.fetch_news(&aapl(), FetchMode::Realtime).await.unwrap();
    assert_eq!(items.len(), 2, "blank titles are dropped");

    let first = &items[0];
    assert_eq!(first.title, "Apple's services revenue jumps");
    assert_eq!(first.source_name.as_deref(), Some("Example Wire"));
    let s = first.sentiment.unwrap();
    assert!((s.score - 0.35).abs() < 1e-9);

    let second = &items[1];
    let s = second.sentiment.unwrap();
    assert_eq!(s.score, -0.5);
    assert_eq!(s.subjectivity, 0.5);
    assert_eq!(second.symbol, aapl());
    assert!(items[0].ingested_at < items[1].ingested_at);
}

#[tokio::test]
async fn note_body_is_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."
        })))
        .mount(&server)
        .await;

    let err = client(&server).await.fetch_news(&aapl(), FetchMode::Realtime).await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }), "got {err:?}");
}

#[tokio::test]
async fn server_error_is_transient_and_garbage_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("function", "NEWS_SENTIMENT"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("function", "TIME_SERIES_INTRADAY"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let c = client(&server).await;
    let err = c.fetch_news(&aapl(), FetchMode::Realtime).await.unwrap_err();
    assert!(matches!(err, ProviderError::Transient { .. }), "got {err:?}");
    let err = c.fetch_prices(&aapl(), FetchMode::Realtime).await.unwrap_err();
    assert!(matches!(err, ProviderError::Invalid { .. }), "got {err:?}");
}

#[tokio::test]
async fn missing_key_never_calls_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let c = AlphaVantageClient::new(None).with_base_url(server.uri());
    let err = c.fetch_prices(&aapl(), FetchMode::Realtime).await.unwrap_err();
    assert!(matches!(err, ProviderError::NotConfigured { .. }));
}

#[tokio::test]
async fn intraday_keeps_latest_bar() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("function", "TIME_SERIES_INTRADAY"))
        .and(query_param("interval", "1min"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Meta Data": { "2. Symbol": "AAPL" },
            "Time Series (1min)": {
                "2024-01-15 15:58:00": { "1. open": "185.0", "2. high": "185.2", "3. low": "184.9", "4. close": "185.1", "5. volume": "1000" },
                "2024-01-15 15:59:00": { "1. open": "185.1", "2. high": "185.6", "3. low": "185.0", "4. close": "185.5", "5. volume": "2500" }
            }
        })))
        .mount(&server)
        .await;

    let bars = client(&server).await.fetch_prices(&aapl(), FetchMode::Realtime).await.unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].close, 185.5);
    assert_eq!(bars[0].volume, Some(2500));
    assert_eq!(bars[0].timestamp.to_rfc3339(), "2024-01-15T15:59:00+00:00");
}

#[tokio::test]
async fn historic_daily_is_windowed() {
    let server = MockServer::start().await;
    let today = Utc::now().date_naive();
    let recent = (today - TimeDelta::days(3)).format("%Y-%m-%d").to_string();
    let old = (today - TimeDelta::days(400)).format("%Y-%m-%d").to_string();
    let mut series = serde_json::Map::new();
    series.insert(recent, json!({ "1. open": "10", "2. high": "11", "3. low": "9", "4. close": "10.5", "6. volume": "42" }));
    series.insert(old, json!({ "1. open": "5", "2. high": "6", "3. low": "4", "4. close": "5.5", "6. volume": "7" }));

    Mock::given(method("GET"))
        .and(query_param("function", "TIME_SERIES_DAILY_ADJUSTED"))
        .and(query_param("outputsize", "full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Time Series (Daily)": series })))
        .mount(&server)
        .await;

    let bars = client(&server)
        .await
        .fetch_prices(&aapl(), FetchMode::Historic(Lookback::Months(6)))
        .await
        .unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].close, 10.5);
    assert_eq!(bars[0].volume, Some(42));
}
