//! Indexer health as reported by `/health`.

use serde::Serialize;

use crate::api::latency::{LatencyStats, LatencySummary};
use crate::indexer::coordinator::Indexer;
use crate::types::FeedMode;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `ok` while streaming, `degraded` while log filters are polled.
    pub status: &'static str,
    pub feed_mode: FeedMode,
    pub active_subscriptions: usize,
    /// Unix seconds of the last successful liveness read.
    pub last_healthy_at: u64,
    pub ingestion_latency: LatencySummary,
}

impl HealthReport {
    pub fn collect(indexer: &Indexer, latency: &LatencyStats) -> Self {
        let feed_mode = indexer.connection().mode();
        Self {
            status: match feed_mode {
                FeedMode::Streaming => "ok",
                FeedMode::Polling => "degraded",
            },
            feed_mode,
            active_subscriptions: indexer.registry().len(),
            last_healthy_at: indexer.connection().last_healthy_at(),
            ingestion_latency: latency.summary(),
        }
    }
}
