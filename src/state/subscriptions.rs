//! Live listener sets, one per tracked market.
//!
//! A subscription is three tasks: a trade log pump, a resolution log pump,
//! and the ingestion task draining both channels in arrival order. They are
//! created together. When the entry leaves the map both pumps are aborted;
//! the ingestion task finishes the events already queued and then exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::chain::abi::{decode_resolution, decode_trade};
use crate::chain::contracts::Contracts;
use crate::chain::feed::LogStream;
use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::indexer::pipeline::EventPipeline;
use crate::types::{MarketEvent, ResolutionOutcome};

struct MarketSubscription {
    id: u64,
    pumps: [AbortHandle; 2],
}

impl Drop for MarketSubscription {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

pub struct SubscriptionRegistry {
    subs: DashMap<Address, MarketSubscription>,
    pipeline: EventPipeline,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(pipeline: EventPipeline) -> Arc<Self> {
        Arc::new(Self {
            subs: DashMap::new(),
            pipeline,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn is_subscribed(&self, market: &Address) -> bool {
        self.subs.contains_key(market)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.subs.iter().map(|e| *e.key()).collect()
    }

    /// Attach listeners for `market` unless it already has them. Returns
    /// `true` if a new listener set was created. Concurrent callers race
    /// safely: the loser drops the streams it opened.
    pub async fn ensure_subscribed(self: &Arc<Self>, contracts: &Contracts, market: Address) -> Result<bool> {
        if self.subs.contains_key(&market) {
            return Ok(false);
        }

        let handle = contracts.market(market);
        let trades = contracts.feed().watch_logs(handle.trade_query()).await?;
        let resolutions = contracts.feed().watch_logs(handle.resolution_query()).await?;

        match self.subs.entry(market) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (trade_tx, trade_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                let (resolution_tx, resolution_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

                let trade_pump = tokio::spawn(pump(
                    market,
                    "trade",
                    trades,
                    trade_tx,
                    |log| decode_trade(log).map(MarketEvent::Trade),
                    self.pipeline.clone(),
                ));
                let resolution_pump = tokio::spawn(pump(
                    market,
                    "resolution",
                    resolutions,
                    resolution_tx,
                    |log| decode_resolution(log).map(MarketEvent::Resolution),
                    self.pipeline.clone(),
                ));
                tokio::spawn(ingest(
                    Arc::downgrade(self),
                    market,
                    id,
                    trade_rx,
                    resolution_rx,
                    self.pipeline.clone(),
                ));

                slot.insert(MarketSubscription {
                    id,
                    pumps: [trade_pump.abort_handle(), resolution_pump.abort_handle()],
                });
                debug!(market = %market, "subscribed");
                Ok(true)
            }
        }
    }

    /// Tear down both listeners. Returns `false` if the market was not
    /// subscribed.
    pub fn unsubscribe(&self, market: &Address) -> bool {
        let removed = self.subs.remove(market).is_some();
        if removed {
            debug!(market = %market, "unsubscribed");
        }
        removed
    }

    /// Remove only the subscription generation `id`, so a stale task cannot
    /// tear down a set created after a reset.
    fn unsubscribe_generation(&self, market: &Address, id: u64) -> bool {
        self.subs.remove_if(market, |_, sub| sub.id == id).is_some()
    }

    /// Drop every subscription. Returns the markets that were torn down.
    pub fn reset_all(&self) -> Vec<Address> {
        let mut removed = Vec::with_capacity(self.subs.len());
        self.subs.retain(|market, _| {
            removed.push(*market);
            false
        });
        info!(markets = removed.len(), "all subscriptions torn down");
        removed
    }
}

/// Forward decoded logs into a market's channel until the stream or the
/// channel closes.
async fn pump<F>(
    market: Address,
    kind: &'static str,
    mut logs: LogStream,
    tx: mpsc::Sender<MarketEvent>,
    decode: F,
    pipeline: EventPipeline,
) where
    F: Fn(&Log) -> Result<MarketEvent>,
{
    while let Some(log) = logs.next().await {
        match decode(&log) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(market = %market, kind, "undecodable log skipped: {e}"),
        }
    }
    warn!(market = %market, kind, "log stream ended");
    pipeline.request_health_check();
}

/// One market's events, one at a time. Stops after the market resolves, or
/// once both pumps are gone and their channels are drained.
async fn ingest(
    registry: Weak<SubscriptionRegistry>,
    market: Address,
    id: u64,
    mut trades: mpsc::Receiver<MarketEvent>,
    mut resolutions: mpsc::Receiver<MarketEvent>,
    pipeline: EventPipeline,
) {
    loop {
        let event = tokio::select! {
            Some(event) = trades.recv() => event,
            Some(event) = resolutions.recv() => event,
            else => break,
        };

        if let Some(ResolutionOutcome::Resolved { outcome, backfilled }) = pipeline.process(event).await {
            info!(market = %market, outcome, backfilled, "market resolved; dropping listeners");
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe_generation(&market, id);
            }
            return;
        }
    }
    debug!(market = %market, "ingestion channels closed");
}
