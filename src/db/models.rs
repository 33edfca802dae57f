//! Database row types matching `migrations/0001_init.sql`.
//! Used by sqlx for typed queries and serialized directly by the read API.

use serde::Serialize;

/// Writable market columns. `None` stores NULL (field unreadable on chain).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MarketRecord {
    pub address: String,
    pub prediction_id: Option<String>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub rules: Option<String>,
    pub status: Option<i64>,
    pub resolution_date: Option<i64>,
    pub resolved: Option<bool>,
    pub winning_outcome: Option<i64>,
    pub yes_pool: Option<String>,
    pub no_pool: Option<String>,
    pub volume: Option<String>,
    pub trade_count: Option<i64>,
    pub creator_fid: Option<i64>,
    pub total_shares: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MarketRow {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub record: MarketRecord,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrade {
    pub tx_hash: String,
    pub block_number: i64,
    pub user_address: String,
    pub market_address: String,
    pub outcome: i64,
    pub amount: String,
    pub shares: String,
    pub platform_fee: String,
    pub creator_fee: String,
    pub timestamp: i64,
    pub user_fid: Option<i64>,
    pub prediction_id: Option<String>,
    pub resolved_outcome: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub tx_hash: String,
    pub block_number: i64,
    pub user_address: String,
    pub market_address: String,
    pub outcome: i64,
    pub amount: String,
    pub shares: String,
    pub platform_fee: String,
    pub creator_fee: String,
    pub timestamp: i64,
    pub user_fid: Option<i64>,
    pub prediction_id: Option<String>,
    pub resolved_outcome: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct LeaderboardRow {
    pub user_address: String,
    pub user_fid: Option<i64>,
    pub trade_count: i64,
    /// Human-scale, display only.
    pub volume: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PositionRow {
    pub market_address: String,
    pub question: Option<String>,
    pub outcome: i64,
    pub trade_count: i64,
    pub invested: f64,
    pub shares: f64,
    pub resolved_outcome: Option<i64>,
    pub realized_pnl: f64,
}
