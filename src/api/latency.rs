//! In-memory histogram of event ingestion latency: time from a decoded log
//! reaching its market task to the trade row and metadata refresh landing.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

/// Values stored in microseconds. Pipeline records, API reads.
pub struct LatencyStats {
    inner: Mutex<Option<Histogram<u64>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: Option<u64>,
    pub p95_us: Option<u64>,
    pub p99_us: Option<u64>,
}

impl LatencyStats {
    /// 1us to 100s, 3 significant figures.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Histogram::new_with_bounds(1, 100_000_000, 3).ok()),
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                let _ = h.record(us.max(1));
            }
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let empty = LatencySummary { samples: 0, p50_us: None, p95_us: None, p99_us: None };
        let Ok(guard) = self.inner.lock() else {
            return empty;
        };
        match guard.as_ref() {
            Some(h) if h.len() > 0 => LatencySummary {
                samples: h.len(),
                p50_us: Some(h.value_at_quantile(0.5)),
                p95_us: Some(h.value_at_quantile(0.95)),
                p99_us: Some(h.value_at_quantile(0.99)),
            },
            _ => empty,
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
