//! Per-stage processing counters
//!
//! Cheap atomics, sampled by the `/stats` endpoint and logged at
//! shutdown. Counters are monotonic for the lifetime of the process.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared between a stage's consumer loop, claimer, and API.
#[derive(Debug, Default)]
pub struct StageStats {
    consumed: AtomicU64,
    produced: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    claimed: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
    /// Unix milliseconds of the last successful handling, 0 if none
    last_success_ms: AtomicI64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub produced: u64,
    pub acked: u64,
    pub retried: u64,
    pub claimed: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub handler_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<String>,
}

impl StageStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claimed(&self, count: u64) {
        self.claimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Time of the last successful handling, if any.
    #[must_use]
    pub fn last_success(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let ms = self.last_success_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        chrono::DateTime::from_timestamp_millis(ms)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            produced: self.produced.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            last_success: self.last_success().map(|t| t.to_rfc3339()),
        }
    }
}
