// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod ratelimit;
pub mod rolling;
pub mod sentiment;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::AppConfig;
pub use crate::ingest::scheduler::{CycleReport, Scheduler, SchedulerConfig};
pub use crate::model::{NewsItem, PriceBar, Sentiment, Symbol};
pub use crate::ratelimit::AdaptiveRateLimiter;
pub use crate::store::{MemoryStore, PgStore, Store};
