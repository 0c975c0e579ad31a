//! Process metrics behind an injected [`MetricsSink`].
//!
//! The binary builds one sink at startup and hands `Arc<dyn MetricsSink>` to the
//! scheduler, the limiter middleware and the flush task. Nothing reaches for a
//! global sink on its own.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub trait MetricsSink: Send + Sync {
    /// One upstream call (or one inbound request, with `name = "http"`).
    fn increment_request(&self, name: &'static str);
    fn increment_error(&self, kind: &'static str);
    /// Inbound request refused by the rate limiter.
    fn increment_denied(&self, reason: &'static str);
    fn record_latency(&self, name: &'static str, elapsed: Duration);
    /// Add `n` to a named counter, e.g. rows inserted.
    fn add(&self, counter: &'static str, n: u64);
    fn record_duration(&self, histogram: &'static str, elapsed: Duration);
    fn set_gauge(&self, gauge: &'static str, value: f64);
    fn flush(&self);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_request(&self, _: &'static str) {}
    fn increment_error(&self, _: &'static str) {}
    fn increment_denied(&self, _: &'static str) {}
    fn record_latency(&self, _: &'static str, _: Duration) {}
    fn add(&self, _: &'static str, _: u64) {}
    fn record_duration(&self, _: &'static str, _: Duration) {}
    fn set_gauge(&self, _: &'static str, _: f64) {}
    fn flush(&self) {}
}

/// One-time metric descriptions so series show up on /metrics with help text.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_provider_requests_total", "Upstream calls by provider.");
        describe_counter!("ingest_provider_errors_total", "Upstream and pipeline errors by kind.");
        describe_histogram!("ingest_provider_latency_ms", "Upstream call latency in milliseconds.");
        describe_counter!("ingest_news_inserted_total", "News rows newly stored.");
        describe_counter!("ingest_bars_inserted_total", "Price bars newly stored.");
        describe_histogram!("ingest_cycle_duration_ms", "Single-cycle duration in milliseconds.");
        describe_gauge!("ingest_last_cycle_ts", "Unix ts when the last cycle finished.");
        describe_counter!("persistence_errors_total", "Store failures by kind.");
        describe_gauge!("data_quality_recent_news", "News rows published in the quality window.");
        describe_gauge!("data_quality_recent_prices", "Price bars stamped in the quality window.");
        describe_gauge!("data_quality_pending_sentiment", "Stored news still without a score.");
        describe_gauge!("data_quality_issues", "Issues raised by the last data-quality check.");
        describe_counter!("ratelimit_denied_total", "Inbound requests denied by reason.");
        describe_gauge!("metrics_last_flush_ts", "Unix ts of the last metrics flush.");
    });
}

/// Sink backed by the `metrics` facade; renders Prometheus text when an exporter
/// is installed.
pub struct PrometheusSink {
    handle: Option<PrometheusHandle>,
    sink_name: String,
    requests: AtomicU64,
    errors: AtomicU64,
}

/// Exporter builder; every series carries `sink="<sink_name>"`.
pub fn exporter_builder(sink_name: &str) -> PrometheusBuilder {
    PrometheusBuilder::new().add_global_label("sink", sink_name)
}

impl PrometheusSink {
    /// Install the global Prometheus recorder, labelled with `sink_name`.
    pub fn install(sink_name: &str) -> anyhow::Result<Self> {
        let handle = exporter_builder(sink_name)
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        ensure_metrics_described();
        Ok(Self::with_handle(Some(handle), sink_name))
    }

    /// Emit through whatever recorder is current (possibly none).
    pub fn without_exporter() -> Self {
        Self::with_handle(None, "")
    }

    fn with_handle(handle: Option<PrometheusHandle>, sink_name: &str) -> Self {
        Self {
            handle,
            sink_name: sink_name.to_string(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> Option<PrometheusHandle> {
        self.handle.clone()
    }
}

impl MetricsSink for PrometheusSink {
    fn increment_request(&self, name: &'static str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter!("ingest_provider_requests_total", "provider" => name).increment(1);
    }

    fn increment_error(&self, kind: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("ingest_provider_errors_total", "kind" => kind).increment(1);
    }

    fn increment_denied(&self, reason: &'static str) {
        counter!("ratelimit_denied_total", "reason" => reason).increment(1);
    }

    fn record_latency(&self, name: &'static str, elapsed: Duration) {
        histogram!("ingest_provider_latency_ms", "provider" => name).record(elapsed.as_secs_f64() * 1000.0);
    }

    fn add(&self, name: &'static str, n: u64) {
        counter!(name).increment(n);
    }

    fn record_duration(&self, name: &'static str, elapsed: Duration) {
        histogram!(name).record(elapsed.as_secs_f64() * 1000.0);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        gauge!(name).set(value);
    }

    fn flush(&self) {
        let now = chrono::Utc::now().timestamp();
        gauge!("metrics_last_flush_ts").set(now as f64);
        tracing::info!(
            target: "metrics",
            sink = %self.sink_name,
            requests = self.requests.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            "metrics flush"
        );
    }
}

/// Flush every `every` until cancelled, then flush once more.
pub fn spawn_flush_task(
    sink: Arc<dyn MetricsSink>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => sink.flush(),
                _ = cancel.cancelled() => break,
            }
        }
        sink.flush();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn prometheus_sink_emits_labelled_counters() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let sink = PrometheusSink::without_exporter();

        metrics::with_local_recorder(&recorder, || {
            sink.increment_request("alphavantage");
            sink.increment_request("alphavantage");
            sink.increment_error("transient");
            sink.add("ingest_news_inserted_total", 3);
        });

        let snap = snapshotter.snapshot().into_vec();
        let count = |name: &str| {
            snap.iter()
                .find(|(k, _, _, _)| k.key().name() == name)
                .map(|(_, _, _, v)| v)
        };
        assert_eq!(count("ingest_provider_requests_total"), Some(&DebugValue::Counter(2)));
        assert_eq!(count("ingest_provider_errors_total"), Some(&DebugValue::Counter(1)));
        assert_eq!(count("ingest_news_inserted_total"), Some(&DebugValue::Counter(3)));
    }

    #[test]
    fn exporter_labels_series_with_sink_name() {
        let recorder = exporter_builder("financial-sentiment-stream").build_recorder();
        let handle = recorder.handle();
        let sink = PrometheusSink::without_exporter();
        metrics::with_local_recorder(&recorder, || {
            sink.add("ingest_bars_inserted_total", 2);
            sink.set_gauge("data_quality_pending_sentiment", 4.0);
        });
        let text = handle.render();
        assert!(
            text.contains(r#"ingest_bars_inserted_total{sink="financial-sentiment-stream"} 2"#),
            "{text}"
        );
        assert!(text.contains(r#"data_quality_pending_sentiment{sink="financial-sentiment-stream"} 4"#));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_task_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let h = spawn_flush_task(Arc::new(NoopSink), Duration::from_secs(60), cancel.clone());
        tokio::time::sleep(Duration::from_secs(125)).await;
        cancel.cancel();
        h.await.unwrap();
    }
}
