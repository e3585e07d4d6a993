//! Engine metrics
//!
//! Counters are atomics so the platform can sample them from another thread
//! while an invocation is running.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine invocation counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    invocations_total: AtomicU64,
    errors_total: AtomicU64,
    recovers_total: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(&self) {
        self.invocations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recover(&self) {
        self.recovers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocations_total(&self) -> u64 {
        self.invocations_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn recovers_total(&self) -> u64 {
        self.recovers_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations_total: self.invocations_total(),
            errors_total: self.errors_total(),
            recovers_total: self.recovers_total(),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub invocations_total: u64,
    pub errors_total: u64,
    pub recovers_total: u64,
}

impl MetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.invocations_total == 0 {
            0.0
        } else {
            self.errors_total as f64 / self.invocations_total as f64
        }
    }
}
