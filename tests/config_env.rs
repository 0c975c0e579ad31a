// tests/config_env.rs
use market_sentiment_ingest::config::{AppConfig, NewsProviderKind, PriceProviderKind, StoreBackend};
use market_sentiment_ingest::ingest::Sources;
use std::env;
use std::time::Duration;

const KEYS: &[&str] = &[
    "ALPHA_VANTAGE_API_KEY",
    "NEWS_API_KEY",
    "STOCK_SYMBOLS",
    "INGEST_INTERVAL_MINUTES",
    "STORE_BACKEND",
    "NEWS_PROVIDER",
    "PRICE_PROVIDER",
    "ALPHA_VANTAGE_RPM",
    "INGEST_MAX_RETRIES",
    "DB_PASSWORD",
    "SINK_NAME",
    "KINESIS_STREAM_NAME",
];

fn clear_env() {
    for k in KEYS {
        env::remove_var(k);
    }
}

#[serial_test::serial]
#[test]
fn reads_process_environment() {
    clear_env();
    env::set_var("ALPHA_VANTAGE_API_KEY", "av-test-key");
    env::set_var("STOCK_SYMBOLS", "aapl,MSFT,aapl");
    env::set_var("INGEST_INTERVAL_MINUTES", "10");
    env::set_var("STORE_BACKEND", "memory");
    env::set_var("INGEST_MAX_RETRIES", "1");
    env::set_var("DB_PASSWORD", " spaced ");

    let c = AppConfig::from_env().unwrap();
    assert_eq!(c.alpha_vantage_key.as_deref(), Some("av-test-key"));
    let syms: Vec<&str> = c.symbols.iter().map(|s| s.as_str()).collect();
    assert_eq!(syms, vec!["AAPL", "MSFT"]);
    assert_eq!(c.interval, Duration::from_secs(600));
    assert_eq!(c.store_backend, StoreBackend::Memory);
    assert_eq!(c.retry.max_attempts(), 2);
    // passwords are taken verbatim
    assert_eq!(c.db.password, " spaced ");

    clear_env();
}

#[serial_test::serial]
#[test]
fn invalid_environment_is_rejected() {
    clear_env();
    env::set_var("ALPHA_VANTAGE_RPM", "-5");
    assert!(AppConfig::from_env().is_err());
    clear_env();

    env::set_var("NEWS_PROVIDER", "bloomberg");
    let err = AppConfig::from_env().unwrap_err().to_string();
    assert!(err.contains("NEWS_PROVIDER"), "{err}");
    clear_env();
}

#[serial_test::serial]
#[test]
fn sources_follow_provider_selection() {
    clear_env();
    let c = AppConfig::from_env().unwrap();
    let s = Sources::from_config(&c);
    assert_eq!(s.news.as_ref().map(|n| n.name()), Some("alphavantage"));
    assert_eq!(s.prices.as_ref().map(|p| p.name()), Some("yahoo"));
    assert_eq!(s.pacers.get("alphavantage").min_spacing(), Duration::from_secs(12));

    env::set_var("NEWS_PROVIDER", "off");
    env::set_var("PRICE_PROVIDER", "alphavantage");
    let c = AppConfig::from_env().unwrap();
    assert_eq!(c.news_provider, NewsProviderKind::Disabled);
    assert_eq!(c.price_provider, PriceProviderKind::AlphaVantage);
    let s = Sources::from_config(&c);
    assert!(s.news.is_none());
    assert_eq!(s.prices.as_ref().map(|p| p.budget_key()), Some("alphavantage"));

    clear_env();
}
