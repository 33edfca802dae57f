use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::Address;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::latency::LatencyStats;
use crate::chain::abi::MarketField;
use crate::chain::contracts::Contracts;
use crate::db::models::NewTrade;
use crate::db::store::Store;
use crate::error::{AppError, Result};
use crate::indexer::metadata::{to_i64, MetadataIndexer};
use crate::types::{
    hex_key, InsertOutcome, MarketEvent, MarketSnapshot, ResolutionEvent, ResolutionOutcome,
    TradeEvent,
};

/// Turns decoded market notifications into rows. Cheap to clone; every
/// market's ingestion task holds one.
#[derive(Clone)]
pub struct EventPipeline {
    metadata: MetadataIndexer,
    contracts: watch::Receiver<Contracts>,
    health_tx: mpsc::Sender<()>,
    latency: Arc<LatencyStats>,
}

impl EventPipeline {
    pub fn new(
        metadata: MetadataIndexer,
        contracts: watch::Receiver<Contracts>,
        health_tx: mpsc::Sender<()>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        Self { metadata, contracts, health_tx, latency }
    }

    fn store(&self) -> &Store {
        self.metadata.store()
    }

    /// Bindings for the connection that is current right now.
    fn contracts(&self) -> Contracts {
        self.contracts.borrow().clone()
    }

    /// Process one notification. Errors are logged and turned into a health
    /// re-check request; they never escape to the caller.
    pub async fn process(&self, event: MarketEvent) -> Option<ResolutionOutcome> {
        match event {
            MarketEvent::Trade(trade) => {
                if let Err(e) = self.handle_trade(&trade).await {
                    self.report(trade.market, "trade", &e);
                }
                None
            }
            MarketEvent::Resolution(resolution) => match self.handle_resolution(&resolution).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    self.report(resolution.market, "resolution", &e);
                    None
                }
            },
        }
    }

    fn report(&self, market: Address, kind: &'static str, e: &AppError) {
        error!(market = %market, kind, "event handling failed: {e}");
        self.request_health_check();
    }

    /// Ask the coordinator for an out-of-band feed health check.
    pub fn request_health_check(&self) {
        // A full channel means a check is already queued.
        let _ = self.health_tx.try_send(());
    }

    // -----------------------------------------------------------------------
    // Trades
    // -----------------------------------------------------------------------

    pub async fn handle_trade(&self, trade: &TradeEvent) -> Result<InsertOutcome> {
        let started = Instant::now();
        let contracts = self.contracts();
        let timestamp = contracts.feed().block_timestamp(trade.block_number).await?;

        let user_fid = match contracts.market(trade.market).user_fid(trade.user).await {
            Ok(fid) => to_i64(fid),
            Err(e) => {
                debug!(market = %trade.market, user = %trade.user, "no user fid: {e}");
                None
            }
        };
        let context = self.trade_context(&contracts, trade.market).await;

        let market_key = hex_key(&trade.market);
        self.store().ensure_market_row(&market_key).await?;

        let row = NewTrade {
            tx_hash: hex_key(&trade.tx_hash),
            block_number: i64::try_from(trade.block_number)
                .map_err(|_| AppError::Chain(format!("block number {} out of range", trade.block_number)))?,
            user_address: hex_key(&trade.user),
            market_address: market_key,
            outcome: i64::from(trade.outcome),
            amount: trade.amount.to_string(),
            shares: trade.shares.to_string(),
            platform_fee: trade.platform_fee.to_string(),
            creator_fee: trade.creator_fee.to_string(),
            timestamp: i64::try_from(timestamp).unwrap_or(i64::MAX),
            user_fid,
            prediction_id: context.prediction_id.map(|id| id.to_string()),
            resolved_outcome: match context.resolved {
                Some(true) => context.winning_outcome.map(i64::from),
                _ => None,
            },
        };

        let outcome = self.store().insert_trade(&row).await?;
        match outcome {
            InsertOutcome::Inserted => info!(
                market = %trade.market,
                tx = %trade.tx_hash,
                user = %trade.user,
                outcome = trade.outcome,
                amount = %trade.amount,
                "trade indexed"
            ),
            InsertOutcome::Duplicate => {
                debug!(market = %trade.market, tx = %trade.tx_hash, "duplicate trade skipped")
            }
        }

        self.metadata.refresh_market(&contracts, trade.market).await?;
        self.latency.record(started.elapsed());
        Ok(outcome)
    }

    /// Best-effort prediction id and, for a resolved market, its outcome.
    async fn trade_context(&self, contracts: &Contracts, address: Address) -> MarketSnapshot {
        let market = contracts.market(address);
        let mut snapshot = MarketSnapshot::empty(address);

        for field in [MarketField::PredictionId, MarketField::Resolved] {
            if let Ok(raw) = market.read(field).await {
                let _ = field.decode_into(&raw, &mut snapshot);
            }
        }
        if snapshot.resolved == Some(true) {
            if let Ok(raw) = market.read(MarketField::WinningOutcome).await {
                let _ = MarketField::WinningOutcome.decode_into(&raw, &mut snapshot);
            }
        }
        snapshot
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Refresh, read the row back, and stamp the outcome onto every trade
    /// that does not have one yet.
    pub async fn handle_resolution(&self, event: &ResolutionEvent) -> Result<ResolutionOutcome> {
        let started = Instant::now();
        let contracts = self.contracts();
        self.metadata.refresh_market(&contracts, event.market).await?;

        let market_key = hex_key(&event.market);
        let record = self.store().get_market(&market_key).await?.map(|row| row.record);

        let outcome = match record {
            Some(r) if r.resolved == Some(true) => match r.winning_outcome {
                Some(winning) => {
                    let outcome = u8::try_from(winning)
                        .map_err(|_| AppError::Chain(format!("winning outcome {winning} out of range")))?;
                    let backfilled = self.store().backfill_resolved_outcome(&market_key, outcome).await?;
                    info!(market = %event.market, outcome, backfilled, "market resolved");
                    ResolutionOutcome::Resolved { outcome, backfilled }
                }
                None => {
                    warn!(market = %event.market, "market resolved but winning outcome unreadable");
                    ResolutionOutcome::Pending
                }
            },
            _ => {
                warn!(market = %event.market, block = ?event.block_number, "resolution notified but market not resolved yet");
                ResolutionOutcome::Pending
            }
        };

        self.latency.record(started.elapsed());
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chain::fake::{addr, FakeChain};

    pub struct Harness {
        pub chain: Arc<FakeChain>,
        pub pipeline: EventPipeline,
        pub store: Store,
        pub health_rx: mpsc::Receiver<()>,
        pub contracts: watch::Sender<Contracts>,
    }

    /// A pipeline over a fresh fake chain and an in-memory store.
    pub async fn harness() -> Harness {
        let chain = FakeChain::new(addr(0xfa));
        let store = Store::in_memory().await.unwrap();
        let (contracts, contracts_rx) = watch::channel(Contracts::bind(chain.clone(), chain.factory));
        let (health_tx, health_rx) = mpsc::channel(1);
        let pipeline = EventPipeline::new(
            MetadataIndexer::new(store.clone()),
            contracts_rx,
            health_tx,
            Arc::new(LatencyStats::new()),
        );
        Harness { chain, pipeline, store, health_rx, contracts }
    }
}
