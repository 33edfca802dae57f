//! Reads market view functions from chain and upserts them into `markets`.
//!
//! Two read paths share one field decoder: per-market concurrent calls after
//! an event, and chunked Multicall3 batches for backfill. An unreadable field
//! is stored as NULL without affecting the rest of the row.

use alloy::primitives::{utils::format_units, Address, Bytes, U256};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::chain::abi::{MarketField, FIELD_COUNT};
use crate::chain::contracts::Contracts;
use crate::config::{MULTICALL_CHUNK_MARKETS, TOKEN_DECIMALS};
use crate::db::models::MarketRecord;
use crate::db::store::Store;
use crate::error::{AppError, Result};
use crate::types::{hex_key, MarketSnapshot};

#[derive(Clone)]
pub struct MetadataIndexer {
    store: Store,
    chunk_markets: usize,
}

impl MetadataIndexer {
    pub fn new(store: Store) -> Self {
        Self { store, chunk_markets: MULTICALL_CHUNK_MARKETS }
    }

    pub fn with_chunk_size(mut self, markets: usize) -> Self {
        self.chunk_markets = markets.max(1);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Every market the factory has deployed.
    pub async fn market_addresses(&self, contracts: &Contracts) -> Result<Vec<Address>> {
        contracts.all_markets().await
    }

    // -----------------------------------------------------------------------
    // Single-market path
    // -----------------------------------------------------------------------

    /// One call per field, issued concurrently. Never fails: a field whose
    /// read reverts or does not decode is left `None`.
    pub async fn read_market(&self, contracts: &Contracts, address: Address) -> MarketSnapshot {
        let market = contracts.market(address);
        let reads = MarketField::ALL
            .iter()
            .map(|&field| async move { (field, market.read(field).await.ok()) });

        let mut snapshot = MarketSnapshot::empty(address);
        for (field, raw) in join_all(reads).await {
            apply_field(&mut snapshot, field, raw);
        }
        snapshot
    }

    pub async fn refresh_market(&self, contracts: &Contracts, address: Address) -> Result<MarketSnapshot> {
        let snapshot = self.read_market(contracts, address).await;
        self.store.upsert_market(&to_record(&snapshot)).await?;
        debug!(market = %address, resolved = ?snapshot.resolved, "market metadata refreshed");
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Batch path
    // -----------------------------------------------------------------------

    /// All fields of all markets through Multicall3, one round trip per chunk.
    /// Result `i` of a chunk is field `i % FIELD_COUNT` of market `i / FIELD_COUNT`.
    pub async fn read_batch(&self, contracts: &Contracts, markets: &[Address]) -> Result<Vec<MarketSnapshot>> {
        let mut snapshots = Vec::with_capacity(markets.len());

        for chunk in markets.chunks(self.chunk_markets) {
            let calls: Vec<(Address, Bytes)> = chunk
                .iter()
                .flat_map(|&market| MarketField::ALL.iter().map(move |f| (market, f.calldata())))
                .collect();

            let results = contracts.feed().aggregate(&calls).await?;
            if results.len() != calls.len() {
                return Err(AppError::Chain(format!(
                    "batch read returned {} results for {} calls",
                    results.len(),
                    calls.len()
                )));
            }

            for (i, &market) in chunk.iter().enumerate() {
                let mut snapshot = MarketSnapshot::empty(market);
                for (j, &field) in MarketField::ALL.iter().enumerate() {
                    apply_field(&mut snapshot, field, results[i * FIELD_COUNT + j].clone());
                }
                snapshots.push(snapshot);
            }
        }

        Ok(snapshots)
    }

    /// Batch read and upsert. If the batch call fails, every market is read
    /// through the single-market path instead.
    pub async fn refresh_batch(&self, contracts: &Contracts, markets: &[Address]) -> Result<usize> {
        let snapshots = match self.read_batch(contracts, markets).await {
            Ok(s) => s,
            Err(e) => {
                warn!(markets = markets.len(), "batch metadata read failed: {e}; reading markets one by one");
                let reads = markets.iter().map(|&m| self.read_market(contracts, m));
                join_all(reads).await
            }
        };

        for snapshot in &snapshots {
            self.store.upsert_market(&to_record(snapshot)).await?;
        }

        info!(markets = snapshots.len(), "batch metadata refresh complete");
        Ok(snapshots.len())
    }
}

fn apply_field(snapshot: &mut MarketSnapshot, field: MarketField, raw: Option<Bytes>) {
    let Some(raw) = raw else {
        debug!(market = %snapshot.address, field = field.name(), "field unavailable");
        return;
    };
    if let Err(e) = field.decode_into(&raw, snapshot) {
        debug!(market = %snapshot.address, field = field.name(), "field did not decode: {e}");
    }
}

// ---------------------------------------------------------------------------
// Snapshot -> row
// ---------------------------------------------------------------------------

pub fn to_record(s: &MarketSnapshot) -> MarketRecord {
    let winning_outcome = match s.resolved {
        Some(true) => s.winning_outcome.map(i64::from),
        _ => None,
    };

    MarketRecord {
        address: hex_key(&s.address),
        prediction_id: s.prediction_id.map(|v| v.to_string()),
        question: s.question.clone(),
        description: s.description.clone(),
        category: s.category.clone(),
        rules: s.rules.clone(),
        status: s.status.map(i64::from),
        resolution_date: s.resolution_date.and_then(to_i64),
        resolved: s.resolved,
        winning_outcome,
        yes_pool: s.yes_pool.map(to_decimal_string),
        no_pool: s.no_pool.map(to_decimal_string),
        volume: s.total_volume.map(to_decimal_string),
        trade_count: s.trade_count.and_then(to_i64),
        creator_fid: s.creator_fid.and_then(to_i64),
        total_shares: s.total_shares.map(to_decimal_string),
    }
}

pub fn to_i64(v: U256) -> Option<i64> {
    u64::try_from(v).ok().and_then(|v| i64::try_from(v).ok())
}

/// Smallest units to a human-scale decimal, trailing zeros trimmed:
/// `1500000000000000000 -> "1.5"`, `0 -> "0.0"`.
pub fn to_decimal_string(value: U256) -> String {
    match format_units(value, TOKEN_DECIMALS) {
        Ok(s) => trim_fraction(&s),
        Err(_) => value.to_string(),
    }
}

fn trim_fraction(s: &str) -> String {
    match s.split_once('.') {
        Some((int, frac)) => {
            let frac = frac.trim_end_matches('0');
            if frac.is_empty() {
                format!("{int}.0")
            } else {
                format!("{int}.{frac}")
            }
        }
        None => format!("{s}.0"),
    }
}
