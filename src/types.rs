use alloy::primitives::{Address, B256, U256};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Market state as read from chain
// ---------------------------------------------------------------------------

/// Decoded market view-function results. `None` means the field could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketSnapshot {
    pub address: Address,
    pub prediction_id: Option<U256>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub rules: Option<String>,
    pub status: Option<u8>,
    pub resolution_date: Option<U256>,
    pub resolved: Option<bool>,
    /// Canonical 0/1, whatever the contract's return type.
    pub winning_outcome: Option<u8>,
    pub yes_pool: Option<U256>,
    pub no_pool: Option<U256>,
    pub total_volume: Option<U256>,
    pub trade_count: Option<U256>,
    pub creator_fid: Option<U256>,
    pub total_shares: Option<U256>,
}

impl MarketSnapshot {
    pub fn empty(address: Address) -> Self {
        Self { address, ..Default::default() }
    }
}

// ---------------------------------------------------------------------------
// Decoded chain notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub market: Address,
    pub user: Address,
    pub outcome: u8,
    pub amount: U256,
    pub shares: U256,
    pub platform_fee: U256,
    pub creator_fee: U256,
    pub tx_hash: B256,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionEvent {
    pub market: Address,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketCreatedEvent {
    pub market: Address,
    pub prediction_id: U256,
    pub creator: Address,
}

/// Messages delivered to a market's ingestion task.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade(TradeEvent),
    Resolution(ResolutionEvent),
}

// ---------------------------------------------------------------------------
// Outcomes reported by the pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same transaction hash already existed; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Market reports resolved; `backfilled` trades received their outcome.
    Resolved { outcome: u8, backfilled: u64 },
    /// The refresh did not observe a resolved market (yet).
    Pending,
}

// ---------------------------------------------------------------------------
// Feed mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Push subscriptions over a WebSocket.
    Streaming,
    /// Degraded: log filters are polled over HTTP.
    Polling,
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedMode::Streaming => write!(f, "streaming"),
            FeedMode::Polling => write!(f, "polling"),
        }
    }
}

/// Lowercase `0x`-prefixed hex, the key format used for every stored address and hash.
pub fn hex_key<T: std::fmt::LowerHex>(value: &T) -> String {
    format!("{value:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256};

    #[test]
    fn hex_key_is_lowercase_and_prefixed() {
        let a = address!("00000000000000000000000000000000000000ab");
        assert_eq!(hex_key(&a), "0x00000000000000000000000000000000000000ab");
        let h = b256!("00000000000000000000000000000000000000000000000000000000000000cd");
        assert!(hex_key(&h).ends_with("cd"));
        assert_eq!(hex_key(&h).len(), 66);
    }
}
