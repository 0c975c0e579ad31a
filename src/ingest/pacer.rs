// src/ingest/pacer.rs
//! Per-provider request pacing.
//!
//! Each upstream budget (e.g. Alpha Vantage's 5 requests/minute per key) gets one
//! [`ProviderPacer`] backed by a `governor` GCRA limiter with a burst of one, so
//! calls go out at least `60 s / n` apart and never more than `n` in a minute.
//! Callers `acquire()` before every request and are served one at a time.
//!
//! The limiter reads tokio's clock and waits with tokio timers, so paused-clock
//! tests drive it the same way they drive the scheduler.

use governor::{
    clock::Clock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BUDGET_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("cancelled while waiting for provider budget")]
pub struct Cancelled;

/// `governor` clock over `tokio::time::Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

type Budget = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

pub struct ProviderPacer {
    budget_key: String,
    min_spacing: Duration,
    budget: Option<Budget>,
    gate: tokio::sync::Mutex<()>,
    /// Set after a throttle reply; no call goes out before it.
    not_before: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ProviderPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderPacer")
            .field("budget_key", &self.budget_key)
            .field("min_spacing", &self.min_spacing)
            .field("not_before", &*self.not_before.lock())
            .finish()
    }
}

impl ProviderPacer {
    /// `None` (or zero) means no budget: calls are only serialized.
    pub fn new(budget_key: impl Into<String>, per_minute: Option<u32>) -> Self {
        let per_minute = per_minute.and_then(NonZeroU32::new);
        let min_spacing = per_minute.map_or(Duration::ZERO, |n| BUDGET_WINDOW / n.get());
        let budget = per_minute.map(|n| {
            let quota = Quota::per_minute(n).allow_burst(NonZeroU32::MIN);
            RateLimiter::direct_with_clock(quota, &TokioClock)
        });
        Self {
            budget_key: budget_key.into(),
            min_spacing,
            budget,
            gate: tokio::sync::Mutex::new(()),
            not_before: Mutex::new(None),
        }
    }

    pub fn budget_key(&self) -> &str {
        &self.budget_key
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Wait for a slot, then take it. Returns early if `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let _turn = tokio::select! {
            g = self.gate.lock() => g,
            _ = cancel.cancelled() => return Err(Cancelled),
        };
        loop {
            let penalty = *self.not_before.lock();
            if let Some(at) = penalty.filter(|at| *at > Instant::now()) {
                self.wait_until(at, cancel).await?;
                continue;
            }
            let Some(budget) = &self.budget else {
                return Ok(());
            };
            match budget.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(TokioClock.now());
                    self.wait_until(Instant::now() + wait, cancel).await?;
                }
            }
        }
    }

    async fn wait_until(&self, at: Instant, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tracing::debug!(
            target: "ingest",
            budget = %self.budget_key,
            wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
            "pacing provider call"
        );
        tokio::select! {
            _ = tokio::time::sleep_until(at) => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    /// Push the next allowed call out by `backoff` from now. Used after a throttle reply.
    pub fn penalize(&self, backoff: Duration) {
        let until = Instant::now() + backoff;
        let mut nb = self.not_before.lock();
        *nb = Some(nb.map_or(until, |t| t.max(until)));
    }
}

/// Pacers by budget key. Unknown keys get an unbudgeted pacer on first use.
#[derive(Debug, Default, Clone)]
pub struct PacerRegistry {
    budgets: HashMap<String, u32>,
    pacers: Arc<Mutex<HashMap<String, Arc<ProviderPacer>>>>,
}

impl PacerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, key: impl Into<String>, per_minute: u32) -> Self {
        self.budgets.insert(key.into(), per_minute);
        self
    }

    pub fn get(&self, key: &str) -> Arc<ProviderPacer> {
        let mut map = self.pacers.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(ProviderPacer::new(key, self.budgets.get(key).copied())))
            .clone()
    }
}
