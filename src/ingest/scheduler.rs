// src/ingest/scheduler.rs
//! Drives ingestion over the symbol universe.
//!
//! Three run modes share one per-symbol step: fetch news and prices (paced per
//! provider budget, retried per [`RetryPolicy`]), persist, move on. A failing symbol
//! is recorded in the [`CycleReport`] and never stops the loop.

use crate::config::AppConfig;
use crate::ingest::pacer::PacerRegistry;
use crate::ingest::quality::{QualityReport, QualityThresholds};
use crate::ingest::retry::RetryPolicy;
use crate::ingest::types::{FetchMode, Lookback, NewsSource, PriceSource, ProviderError};
use crate::ingest::{dedup_news, ensure_scored, Sources};
use crate::metrics::{MetricsSink, NoopSink};
use crate::model::{NewsItem, PriceBar, Symbol};
use crate::sentiment::{normalize, SentimentInput};
use crate::store::{HourRange, Store, UpsertReport};
use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub symbols: Vec<Symbol>,
    pub retry: RetryPolicy,
    /// Pause after a cycle that failed as a whole.
    pub error_cooldown: Duration,
    /// Null-sentiment rows scored after each cycle.
    pub sentiment_backfill_batch: usize,
    /// Hours of buckets recomputed after each realtime cycle.
    pub refresh_hours: i64,
    /// Checked after each realtime cycle.
    pub quality: QualityThresholds,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            symbols: Symbol::parse_list(crate::config::DEFAULT_SYMBOLS),
            retry: RetryPolicy::default(),
            error_cooldown: Duration::from_secs(60),
            sentiment_backfill_batch: 100,
            refresh_hours: 24,
            quality: QualityThresholds::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            symbols: cfg.symbols.clone(),
            retry: cfg.retry,
            error_cooldown: cfg.error_cooldown,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolFailure {
    pub symbol: Symbol,
    pub stage: &'static str,
    pub error: String,
}

/// What one run did. Returned by every run mode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub mode: &'static str,
    pub symbols_attempted: Vec<Symbol>,
    pub failures: Vec<SymbolFailure>,
    pub news: UpsertReport,
    /// Repeats dropped inside a batch before reaching the store.
    pub news_batch_duplicates: usize,
    pub bars: UpsertReport,
    pub sentiment_backfilled: usize,
    pub buckets_refreshed: u64,
    /// Set after realtime cycles; `None` when the check could not run.
    pub quality: Option<QualityReport>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn new(mode: &'static str) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    fn fail(&mut self, symbol: &Symbol, stage: &'static str, error: impl std::fmt::Display) {
        warn!(target: "ingest", %symbol, stage, error = %error, "symbol step failed");
        self.failures.push(SymbolFailure {
            symbol: symbol.clone(),
            stage,
            error: error.to_string(),
        });
    }

    pub fn failed_symbols(&self) -> Vec<&Symbol> {
        let mut out: Vec<&Symbol> = Vec::new();
        for f in &self.failures {
            if !out.contains(&&f.symbol) {
                out.push(&f.symbol);
            }
        }
        out
    }
}

enum CallError {
    Provider(ProviderError),
    /// Provider was disabled earlier in this run.
    Skipped,
    Cancelled,
}

pub struct Scheduler {
    news: Option<Arc<dyn NewsSource>>,
    prices: Option<Arc<dyn PriceSource>>,
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSink>,
    pacers: PacerRegistry,
    cfg: SchedulerConfig,
    cancel: CancellationToken,
    disabled: Mutex<HashSet<&'static str>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, cfg: SchedulerConfig) -> Self {
        Self {
            news: None,
            prices: None,
            store,
            metrics: Arc::new(NoopSink),
            pacers: PacerRegistry::new(),
            cfg,
            cancel: CancellationToken::new(),
            disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_sources(mut self, sources: Sources) -> Self {
        self.news = sources.news;
        self.prices = sources.prices;
        self.pacers = sources.pacers;
        self
    }

    pub fn with_news(mut self, src: Arc<dyn NewsSource>) -> Self {
        self.news = Some(src);
        self
    }

    pub fn with_prices(mut self, src: Arc<dyn PriceSource>) -> Self {
        self.prices = Some(src);
        self
    }

    pub fn with_pacers(mut self, pacers: PacerRegistry) -> Self {
        self.pacers = pacers;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    /// One pass over the configured symbols in order.
    pub async fn run_single_cycle(&self) -> Result<CycleReport> {
        self.ensure_runnable()?;
        let started = Instant::now();
        let mut report = CycleReport::new("realtime");
        let symbols = self.cfg.symbols.clone();
        self.run_symbols(&symbols, FetchMode::Realtime, &mut report).await;
        if !report.cancelled {
            let range = HourRange::last_hours(Utc::now(), self.cfg.refresh_hours);
            self.post_process(range, &mut report).await;
            report.quality = self.check_quality().await;
        }
        self.finish(started, &mut report);
        Ok(report)
    }

    /// Repeat single cycles every `interval` until cancelled.
    ///
    /// Sleeps `interval - elapsed` after a good cycle. A cycle that errors or panics is
    /// logged and followed by `error_cooldown`. Cancellation lets the in-flight symbol
    /// finish its writes, then returns.
    pub async fn run_continuous(self: Arc<Self>, interval: Duration) -> Result<()> {
        self.ensure_runnable()?;
        info!(
            target: "ingest",
            interval_secs = interval.as_secs(),
            symbols = self.cfg.symbols.len(),
            "continuous ingestion started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            let this = Arc::clone(&self);
            let outcome = tokio::spawn(async move { this.run_single_cycle().await }).await;
            let pause = match outcome {
                Ok(Ok(report)) if report.cancelled => break,
                Ok(Ok(_)) => interval.saturating_sub(started.elapsed()),
                Ok(Err(e)) => {
                    error!(target: "ingest", error = ?e, "ingestion cycle failed");
                    self.metrics.increment_error("cycle");
                    self.cfg.error_cooldown
                }
                Err(join) => {
                    error!(target: "ingest", error = %join, "ingestion cycle aborted");
                    self.metrics.increment_error("cycle_panic");
                    self.cfg.error_cooldown
                }
            };
            if !self.sleep_or_cancel(pause).await {
                break;
            }
        }
        info!(target: "ingest", "continuous ingestion stopped");
        Ok(())
    }

    /// Fetch and persist a bounded window of history for each symbol.
    ///
    /// Calls go through the provider pacers, so a 5 requests/minute budget puts 12 s
    /// between requests however many symbols are queued.
    pub async fn run_historic_backfill(&self, symbols: &[Symbol], lookback: Lookback) -> Result<CycleReport> {
        self.ensure_runnable()?;
        let started = Instant::now();
        let mut report = CycleReport::new("historic");
        info!(target: "ingest", symbols = symbols.len(), ?lookback, "historic backfill started");
        self.run_symbols(symbols, FetchMode::Historic(lookback), &mut report).await;
        if !report.cancelled {
            let now = Utc::now();
            self.post_process(HourRange::covering(lookback.start(now), now), &mut report)
                .await;
        }
        self.finish(started, &mut report);
        Ok(report)
    }

    fn ensure_runnable(&self) -> Result<()> {
        let disabled = self.disabled.lock();
        let news_ok = self.news.as_ref().is_some_and(|s| !disabled.contains(s.name()));
        let prices_ok = self.prices.as_ref().is_some_and(|s| !disabled.contains(s.name()));
        if !news_ok && !prices_ok {
            bail!("no usable news or price source is configured");
        }
        Ok(())
    }

    async fn run_symbols(&self, symbols: &[Symbol], mode: FetchMode, report: &mut CycleReport) {
        for symbol in symbols {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.symbols_attempted.push(symbol.clone());
            if !self.process_symbol(symbol, mode, report).await {
                report.cancelled = true;
                break;
            }
        }
    }

    /// Returns false if cancellation interrupted the step.
    async fn process_symbol(&self, symbol: &Symbol, mode: FetchMode, report: &mut CycleReport) -> bool {
        let (news, prices) = tokio::join!(self.fetch_news(symbol, mode), self.fetch_prices(symbol, mode));
        let mut completed = true;

        match news {
            Ok(items) => self.persist_news(symbol, items, report).await,
            Err(CallError::Provider(e)) => report.fail(symbol, "fetch_news", e),
            Err(CallError::Skipped) => {}
            Err(CallError::Cancelled) => completed = false,
        }
        match prices {
            Ok(bars) => self.persist_bars(symbol, bars, report).await,
            Err(CallError::Provider(e)) => report.fail(symbol, "fetch_prices", e),
            Err(CallError::Skipped) => {}
            Err(CallError::Cancelled) => completed = false,
        }
        completed
    }

    async fn fetch_news(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<NewsItem>, CallError> {
        let Some(src) = self.news.as_ref() else {
            return Err(CallError::Skipped);
        };
        self.call(src.name(), src.budget_key(), symbol, || src.fetch_news(symbol, mode))
            .await
    }

    async fn fetch_prices(&self, symbol: &Symbol, mode: FetchMode) -> Result<Vec<PriceBar>, CallError> {
        let Some(src) = self.prices.as_ref() else {
            return Err(CallError::Skipped);
        };
        self.call(src.name(), src.budget_key(), symbol, || src.fetch_prices(symbol, mode))
            .await
    }

    /// Paced call with bounded retries.
    async fn call<T, F, Fut>(
        &self,
        provider: &'static str,
        budget: &'static str,
        symbol: &Symbol,
        mut op: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.disabled.lock().contains(provider) {
            return Err(CallError::Skipped);
        }
        let pacer = self.pacers.get(budget);
        let max_attempts = self.cfg.retry.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if pacer.acquire(&self.cancel).await.is_err() {
                return Err(CallError::Cancelled);
            }
            self.metrics.increment_request(provider);
            let started = Instant::now();
            let res = op().await;
            self.metrics.record_latency(provider, started.elapsed());

            let err = match res {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            self.metrics.increment_error(err.kind());
            match &err {
                ProviderError::NotConfigured { .. } => {
                    warn!(target: "ingest", provider, error = %err, "provider disabled for this run");
                    self.disabled.lock().insert(provider);
                    return Err(CallError::Provider(err));
                }
                ProviderError::RateLimited { .. } => {
                    pacer.penalize(self.cfg.retry.rate_limit_backoff);
                    if attempt >= max_attempts {
                        return Err(CallError::Provider(err));
                    }
                    warn!(
                        target: "ingest",
                        provider,
                        %symbol,
                        attempt,
                        backoff_secs = self.cfg.retry.rate_limit_backoff.as_secs(),
                        "provider throttled, backing off"
                    );
                }
                ProviderError::Transient { .. } if attempt < max_attempts => {
                    let delay = self.cfg.retry.backoff(attempt);
                    warn!(
                        target: "ingest",
                        provider,
                        %symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, retrying"
                    );
                    if !self.sleep_or_cancel(delay).await {
                        return Err(CallError::Cancelled);
                    }
                }
                _ => return Err(CallError::Provider(err)),
            }
        }
    }

    async fn persist_news(&self, symbol: &Symbol, mut items: Vec<NewsItem>, report: &mut CycleReport) {
        ensure_scored(&mut items);
        let (items, dropped) = dedup_news(items);
        report.news_batch_duplicates += dropped;
        if items.is_empty() {
            return;
        }
        match self.store.upsert_news(&items).await {
            Ok(r) => {
                self.metrics.add("ingest_news_inserted_total", r.inserted as u64);
                if r.failed > 0 {
                    report.fail(symbol, "persist_news", format!("{} of {} items rejected", r.failed, items.len()));
                }
                report.news.merge(r);
            }
            Err(e) => {
                self.metrics.increment_error(e.kind());
                report.news.failed += items.len();
                report.fail(symbol, "persist_news", e);
            }
        }
    }

    async fn persist_bars(&self, symbol: &Symbol, bars: Vec<PriceBar>, report: &mut CycleReport) {
        let mut local = UpsertReport::default();
        let mut last_err = None;
        for (i, bar) in bars.iter().enumerate() {
            match self.store.upsert_price_bar(bar).await {
                Ok(u) if u.inserted => local.inserted += 1,
                Ok(_) => local.duplicates += 1,
                Err(e) => {
                    self.metrics.increment_error(e.kind());
                    if e.is_connection() {
                        local.failed += bars.len() - i;
                        last_err = Some(e);
                        break;
                    }
                    local.failed += 1;
                    last_err = Some(e);
                }
            }
        }
        self.metrics.add("ingest_bars_inserted_total", local.inserted as u64);
        if let Some(e) = last_err {
            report.fail(symbol, "persist_prices", e);
        }
        report.bars.merge(local);
    }

    /// Score rows stored without sentiment, then rebuild the buckets in `range`.
    async fn post_process(&self, range: HourRange, report: &mut CycleReport) {
        match self.run_sentiment_backfill().await {
            Ok(n) => report.sentiment_backfilled = n,
            Err(e) => warn!(target: "ingest", error = %e, "sentiment backfill failed"),
        }
        match self.store.refresh_correlation_buckets(range).await {
            Ok(n) => report.buckets_refreshed = n,
            Err(e) => warn!(target: "ingest", error = %e, "correlation refresh failed"),
        }
    }

    /// Compare fresh-data counts against the configured thresholds.
    pub async fn check_quality(&self) -> Option<QualityReport> {
        let t = &self.cfg.quality;
        let since = Utc::now() - chrono::TimeDelta::from_std(t.window).unwrap_or(chrono::TimeDelta::hours(4));
        let snapshot = match self.store.quality_snapshot(since).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "ingest", error = %e, "data quality check failed");
                return None;
            }
        };
        self.metrics.set_gauge("data_quality_recent_news", snapshot.recent_news as f64);
        self.metrics.set_gauge("data_quality_recent_prices", snapshot.recent_prices as f64);
        self.metrics.set_gauge("data_quality_pending_sentiment", snapshot.pending_sentiment as f64);

        let report = QualityReport::evaluate(snapshot, t);
        self.metrics.set_gauge("data_quality_issues", report.issues.len() as f64);
        if report.is_healthy() {
            info!(
                target: "ingest",
                recent_news = snapshot.recent_news,
                recent_prices = snapshot.recent_prices,
                "data quality ok"
            );
        } else {
            for issue in &report.issues {
                warn!(target: "ingest", %issue, "data quality issue");
            }
        }
        Some(report)
    }

    /// Fill missing sentiment on stored news using the lexicon scorer.
    pub async fn run_sentiment_backfill(&self) -> Result<usize, crate::store::PersistenceError> {
        let pending = self.store.pending_sentiment(self.cfg.sentiment_backfill_batch).await?;
        let mut updated = 0usize;
        for row in pending {
            let text = format!("{}. {}", row.title, row.description.as_deref().unwrap_or_default());
            let s = normalize(SentimentInput::Text(&text));
            match self.store.set_sentiment(row.id, s).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => warn!(target: "ingest", id = row.id, error = %e, "sentiment update failed"),
            }
        }
        Ok(updated)
    }

    fn finish(&self, started: Instant, report: &mut CycleReport) {
        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        self.metrics.record_duration("ingest_cycle_duration_ms", elapsed);
        self.metrics.set_gauge("ingest_last_cycle_ts", Utc::now().timestamp() as f64);
        info!(
            target: "ingest",
            mode = report.mode,
            attempted = report.symbols_attempted.len(),
            failed = report.failed_symbols().len(),
            news_inserted = report.news.inserted,
            news_duplicates = report.news.duplicates + report.news_batch_duplicates,
            bars_inserted = report.bars.inserted,
            bars_duplicates = report.bars.duplicates,
            backfilled = report.sentiment_backfilled,
            buckets = report.buckets_refreshed,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "ingestion run finished"
        );
    }

    /// True if the full duration elapsed, false if cancelled first.
    async fn sleep_or_cancel(&self, d: Duration) -> bool {
        if d.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}
