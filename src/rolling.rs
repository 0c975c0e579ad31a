//! # Sliding window
//! Timestamps of recent events inside a fixed-length window.
//!
//! Used for per-IP request accounting in the rate limiter, where exact counts over
//! the last 60 s are reported back to operators. Not synchronized; callers hold
//! their own lock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    buf: VecDeque<Instant>,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            buf: VecDeque::new(),
            window,
        }
    }

    /// Drop entries at least `window` old. Entries are appended in order,
    /// so the scan stops at the first young one.
    pub fn evict(&mut self, now: Instant) {
        while let Some(&t) = self.buf.front() {
            if now < t || now - t < self.window {
                break;
            }
            self.buf.pop_front();
        }
    }

    /// Evicts, then returns how many events remain inside the window.
    pub fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.buf.len()
    }

    /// Count without evicting, for read-only introspection.
    pub fn count_at(&self, now: Instant) -> usize {
        self.buf
            .iter()
            .rev()
            .take_while(|&&t| now < t || now - t < self.window)
            .count()
    }

    pub fn record(&mut self, now: Instant) {
        self.buf.push_back(now);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
