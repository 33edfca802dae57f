use std::sync::Arc;

use alloy::primitives::Address;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthReport;
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::db::models::{LeaderboardRow, MarketRow, PositionRow, TradeRow};
use crate::db::store::Store;
use crate::error::AppError;
use crate::identity::IdentityClient;
use crate::indexer::coordinator::Indexer;
use crate::types::hex_key;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub identity: IdentityClient,
    pub indexer: Arc<Indexer>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/markets/live", get(get_live_markets))
        .route("/markets/:address", get(get_market))
        .route("/markets/:address/trades", get(get_market_trades))
        .route("/users/:address/trades", get(get_user_trades))
        .route("/users/:address/portfolio", get(get_portfolio))
        .route("/leaderboard", get(get_leaderboard))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query params / responses
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Serialize)]
pub struct LeaderboardEntry {
    #[serde(flatten)]
    pub row: LeaderboardRow,
    pub display_name: Option<String>,
}

#[derive(Serialize)]
pub struct PortfolioResponse {
    pub user_address: String,
    pub realized_pnl: f64,
    pub positions: Vec<PositionRow>,
}

/// Stored keys are lowercase hex; accept any casing on input.
fn address_key(raw: &str) -> Result<String, AppError> {
    raw.parse::<Address>()
        .map(|a| hex_key(&a))
        .map_err(|_| AppError::BadRequest(format!("not an address: {raw}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(HealthReport::collect(&state.indexer, &state.latency))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}

async fn get_live_markets(
    State(state): State<ApiState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<MarketRow>>, AppError> {
    Ok(Json(state.store.live_markets(params.limit()).await?))
}

async fn get_market(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<MarketRow>, AppError> {
    let key = address_key(&address)?;
    state
        .store
        .get_market(&key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("market {key}")))
}

async fn get_market_trades(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<TradeRow>>, AppError> {
    let key = address_key(&address)?;
    Ok(Json(state.store.trades_for_market(&key, params.limit()).await?))
}

async fn get_user_trades(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<TradeRow>>, AppError> {
    let key = address_key(&address)?;
    Ok(Json(state.store.trades_for_user(&key, params.limit()).await?))
}

async fn get_portfolio(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<PortfolioResponse>, AppError> {
    let key = address_key(&address)?;
    let positions = state.store.portfolio(&key).await?;
    let realized_pnl = positions.iter().map(|p| p.realized_pnl).sum();
    Ok(Json(PortfolioResponse { user_address: key, realized_pnl, positions }))
}

async fn get_leaderboard(
    State(state): State<ApiState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, AppError> {
    let rows = state.store.leaderboard(params.limit()).await?;
    let fids: Vec<i64> = rows.iter().filter_map(|r| r.user_fid).collect();
    let names = state.identity.display_names(&fids).await;

    let entries = rows
        .into_iter()
        .map(|row| LeaderboardEntry {
            display_name: row.user_fid.and_then(|fid| names.get(&fid).cloned()),
            row,
        })
        .collect();
    Ok(Json(entries))
}
