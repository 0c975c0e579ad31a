//! Market sentiment ingestion: binary entrypoint.
//! Parses the run mode, wires config, store, sources and metrics, then runs the
//! scheduler (and the operator HTTP surface when `--serve` is given).

use anyhow::{Context, Result};
use clap::Parser;
use market_sentiment_ingest::{
    api::{self, AppState},
    config::{AppConfig, StoreBackend},
    ingest::{
        types::{Lookback, MAX_LOOKBACK_DAYS, MAX_LOOKBACK_MONTHS},
        Sources,
    },
    metrics::{spawn_flush_task, MetricsSink, PrometheusSink},
    model::Symbol,
    ratelimit::{AdaptiveRateLimiter, RateLimitConfig},
    store::{MemoryStore, PgStore, Store},
    Scheduler, SchedulerConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// One week.
const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Parser, Debug)]
#[command(name = "market-sentiment-ingest")]
#[command(about = "Paced financial news and price ingestion", long_about = None)]
struct Cli {
    /// Run cycles forever, every MINUTES (default INGEST_INTERVAL_MINUTES, 5)
    #[arg(
        long,
        value_name = "MINUTES",
        num_args = 0..=1,
        value_parser = clap::value_parser!(u64).range(1..=MAX_INTERVAL_MINUTES),
        conflicts_with_all = ["historic", "simulate"]
    )]
    continuous: Option<Option<u64>>,

    /// Backfill history for every symbol (default 6 months)
    #[arg(long, conflicts_with = "simulate")]
    historic: bool,

    /// Historic lookback in months
    #[arg(
        long,
        requires = "historic",
        conflicts_with = "days",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LOOKBACK_MONTHS))
    )]
    months: Option<u32>,

    /// Historic lookback in days
    #[arg(
        long,
        requires = "historic",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LOOKBACK_DAYS))
    )]
    days: Option<u32>,

    /// Backfill DAYS of generated data (default 30)
    #[arg(
        long,
        value_name = "DAYS",
        num_args = 0..=1,
        default_missing_value = "30",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LOOKBACK_DAYS))
    )]
    simulate: Option<u32>,

    /// Comma-separated symbols, overriding STOCK_SYMBOLS
    #[arg(long, value_name = "A,B,C")]
    symbols: Option<String>,

    /// Serve /health, /metrics and the rate-limit endpoints on ADDR
    #[arg(long, value_name = "ADDR")]
    serve: Option<SocketAddr>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_sentiment_ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn build_store(cfg: &AppConfig) -> Result<Arc<dyn Store>> {
    match cfg.store_backend {
        StoreBackend::Memory => {
            warn!("STORE_BACKEND=memory: nothing will outlive this process");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let pg = PgStore::connect(&cfg.db)
                .await
                .context("database unreachable at startup")?;
            pg.ensure_schema().await.context("creating schema")?;
            Ok(Arc::new(pg))
        }
    }
}

async fn serve(addr: SocketAddr, state: AppState, sink: Arc<dyn MetricsSink>, cancel: CancellationToken) -> Result<()> {
    let router = api::create_router(state, sink);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "operator http listening");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server")
}

fn spawn_prune_task(limiter: Arc<AdaptiveRateLimiter>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.prune();
                    if removed > 0 {
                        tracing::debug!(target: "ratelimit", removed, "pruned limiter state");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = AppConfig::from_env().context("loading configuration")?;
    if let Some(raw) = cli.symbols.as_deref() {
        let symbols = Symbol::parse_list(raw);
        anyhow::ensure!(!symbols.is_empty(), "--symbols contains no valid symbols");
        cfg.symbols = symbols;
    }
    cfg.log_summary();

    let store = build_store(&cfg).await?;
    let sources = if cli.simulate.is_some() {
        Sources::simulated(cfg.simulation_seed)
    } else {
        Sources::from_config(&cfg)
    };

    let prom = Arc::new(PrometheusSink::install(&cfg.sink_name)?);
    let sink: Arc<dyn MetricsSink> = prom.clone();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, finishing current work");
                cancel.cancel();
            }
        });
    }
    let flush = spawn_flush_task(sink.clone(), cfg.metrics_flush, cancel.clone());

    let server = match cli.serve {
        Some(addr) => {
            let rl_cfg = RateLimitConfig::load(cfg.rate_limit_config_path.as_deref())
                .context("loading rate limit config")?;
            let limiter = Arc::new(AdaptiveRateLimiter::new(rl_cfg));
            spawn_prune_task(limiter.clone(), cancel.clone());
            let state = AppState::new(limiter, prom.handle());
            Some(tokio::spawn(serve(addr, state, sink.clone(), cancel.clone())))
        }
        None => None,
    };

    let scheduler = Arc::new(
        Scheduler::new(store, SchedulerConfig::from_app(&cfg))
            .with_sources(sources)
            .with_metrics(sink.clone())
            .with_cancel(cancel.clone()),
    );

    if let Some(minutes) = cli.continuous {
        let interval = match minutes {
            Some(m) => Duration::from_secs(m.saturating_mul(60)),
            None => cfg.interval,
        };
        scheduler.run_continuous(interval).await?;
    } else if let Some(days) = cli.simulate {
        let symbols = cfg.symbols.clone();
        let report = scheduler.run_historic_backfill(&symbols, Lookback::Days(days)).await?;
        info!(report = %serde_json::to_string(&report)?, "simulation backfill done");
    } else if cli.historic {
        let lookback = match (cli.months, cli.days) {
            (_, Some(d)) => Lookback::Days(d),
            (Some(m), None) => Lookback::Months(m),
            (None, None) => Lookback::default(),
        };
        let symbols = cfg.symbols.clone();
        let report = scheduler.run_historic_backfill(&symbols, lookback).await?;
        info!(report = %serde_json::to_string(&report)?, "historic backfill done");
    } else {
        let report = scheduler.run_single_cycle().await?;
        info!(report = %serde_json::to_string(&report)?, "single cycle done");
    }

    if let Some(server) = server {
        info!("ingestion finished; serving until ctrl-c");
        server.await.context("http server task")??;
    }
    cancel.cancel();
    let _ = flush.await;
    Ok(())
}
