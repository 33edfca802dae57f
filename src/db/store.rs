use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::{
    DB_ACQUIRE_TIMEOUT_SECS, DB_IDLE_TIMEOUT_SECS, DB_RETRY_ATTEMPTS, DB_RETRY_BACKOFF_MS,
};
use crate::db::models::{LeaderboardRow, MarketRecord, MarketRow, NewTrade, PositionRow, TradeRow};
use crate::error::{AppError, Result};
use crate::retry::RetryPolicy;
use crate::types::InsertOutcome;

// `resolved` and `winning_outcome` keep their previous value when a refresh
// could not read them, so a resolved market never regresses to NULL.
const UPSERT_MARKET: &str = r#"
    INSERT INTO markets (
        address, prediction_id, question, description, category, rules,
        status, resolution_date, resolved, winning_outcome,
        yes_pool, no_pool, volume, trade_count, creator_fid, total_shares, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(address) DO UPDATE SET
        prediction_id = excluded.prediction_id,
        question = excluded.question,
        description = excluded.description,
        category = excluded.category,
        rules = excluded.rules,
        status = excluded.status,
        resolution_date = excluded.resolution_date,
        resolved = COALESCE(excluded.resolved, markets.resolved),
        winning_outcome = COALESCE(excluded.winning_outcome, markets.winning_outcome),
        yes_pool = excluded.yes_pool,
        no_pool = excluded.no_pool,
        volume = excluded.volume,
        trade_count = excluded.trade_count,
        creator_fid = excluded.creator_fid,
        total_shares = excluded.total_shares,
        updated_at = excluded.updated_at
"#;

const INSERT_TRADE: &str = r#"
    INSERT INTO trades (
        tx_hash, block_number, user_address, market_address, outcome,
        amount, shares, platform_fee, creator_fee, timestamp,
        user_fid, prediction_id, resolved_outcome
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(tx_hash) DO NOTHING
"#;

const MARKET_COLUMNS: &str = "address, prediction_id, question, description, category, rules, \
     status, resolution_date, resolved, winning_outcome, yes_pool, no_pool, volume, \
     trade_count, creator_fid, total_shares, updated_at";

const TRADE_COLUMNS: &str = "id, tx_hash, block_number, user_address, market_address, outcome, \
     amount, shares, platform_fee, creator_fee, timestamp, user_fid, prediction_id, resolved_outcome";

/// Realized PnL of one trade row, human-scale: a winning side is paid its
/// shares, a losing side forfeits its amount, unresolved trades contribute 0.
fn realized_pnl(t: &str) -> String {
    format!(
        "CASE \
         WHEN {t}resolved_outcome IS NULL THEN 0.0 \
         WHEN {t}resolved_outcome = {t}outcome \
             THEN (CAST({t}shares AS REAL) - CAST({t}amount AS REAL)) / 1e18 \
         ELSE -CAST({t}amount AS REAL) / 1e18 END"
    )
}

/// The single serialization boundary between typed records and SQLite.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Store {
    /// Open (creating if needed) the database file and run migrations.
    pub async fn connect(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let retry = default_retry();
        let pool = retry
            .run_if("database connect", AppError::is_transient_db, || {
                let options = options.clone();
                async move {
                    let pool = SqlitePoolOptions::new()
                        .max_connections(max_connections)
                        .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
                        .idle_timeout(Duration::from_secs(DB_IDLE_TIMEOUT_SECS))
                        .connect_with(options)
                        .await?;
                    Ok::<_, AppError>(pool)
                }
            })
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path, max_connections, "database ready");
        Ok(Self { pool, retry })
    }

    /// Private in-memory database; a single connection that never idles out.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, retry: default_retry() })
    }

    async fn retrying<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run_if(label, AppError::is_transient_db, op).await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn upsert_market(&self, m: &MarketRecord) -> Result<()> {
        let updated_at = now_secs();
        self.retrying("upsert market", || async move {
            sqlx::query(UPSERT_MARKET)
                .bind(&m.address)
                .bind(&m.prediction_id)
                .bind(&m.question)
                .bind(&m.description)
                .bind(&m.category)
                .bind(&m.rules)
                .bind(m.status)
                .bind(m.resolution_date)
                .bind(m.resolved)
                .bind(m.winning_outcome)
                .bind(&m.yes_pool)
                .bind(&m.no_pool)
                .bind(&m.volume)
                .bind(m.trade_count)
                .bind(m.creator_fid)
                .bind(&m.total_shares)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Make sure a market row exists so trades can reference it before its metadata lands.
    pub async fn ensure_market_row(&self, address: &str) -> Result<()> {
        let updated_at = now_secs();
        self.retrying("ensure market row", || async move {
            sqlx::query("INSERT OR IGNORE INTO markets (address, updated_at) VALUES (?, ?)")
                .bind(address)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Insert-or-skip keyed by transaction hash; an existing row is never touched.
    pub async fn insert_trade(&self, t: &NewTrade) -> Result<InsertOutcome> {
        self.retrying("insert trade", || async move {
            let result = sqlx::query(INSERT_TRADE)
                .bind(&t.tx_hash)
                .bind(t.block_number)
                .bind(&t.user_address)
                .bind(&t.market_address)
                .bind(t.outcome)
                .bind(&t.amount)
                .bind(&t.shares)
                .bind(&t.platform_fee)
                .bind(&t.creator_fee)
                .bind(t.timestamp)
                .bind(t.user_fid)
                .bind(&t.prediction_id)
                .bind(t.resolved_outcome)
                .execute(&self.pool)
                .await?;
            Ok(if result.rows_affected() == 1 {
                InsertOutcome::Inserted
            } else {
                InsertOutcome::Duplicate
            })
        })
        .await
    }

    /// Set `resolved_outcome` on every trade of `market` that does not have one yet.
    pub async fn backfill_resolved_outcome(&self, market: &str, outcome: u8) -> Result<u64> {
        let outcome = i64::from(outcome);
        self.retrying("backfill resolved outcome", || async move {
            let result = sqlx::query(
                "UPDATE trades SET resolved_outcome = ? \
                 WHERE market_address = ? AND resolved_outcome IS NULL",
            )
            .bind(outcome)
            .bind(market)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_market(&self, address: &str) -> Result<Option<MarketRow>> {
        let sql = format!("SELECT {MARKET_COLUMNS} FROM markets WHERE address = ?");
        let sql = sql.as_str();
        self.retrying("get market", || async move {
            Ok(sqlx::query_as::<_, MarketRow>(sql)
                .bind(address)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    /// Addresses of markets that are resolved or whose resolution date is older than `cutoff`.
    pub async fn stale_market_addresses(&self, cutoff: i64) -> Result<Vec<String>> {
        self.retrying("stale markets", || async move {
            Ok(sqlx::query_scalar::<_, String>(
                "SELECT address FROM markets \
                 WHERE resolved = 1 OR (resolution_date IS NOT NULL AND resolution_date < ?)",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn live_markets(&self, limit: i64) -> Result<Vec<MarketRow>> {
        let sql = format!(
            "SELECT {MARKET_COLUMNS} FROM markets \
             WHERE resolved IS NULL OR resolved = 0 \
             ORDER BY CAST(volume AS REAL) DESC, address LIMIT ?"
        );
        let sql = sql.as_str();
        self.retrying("live markets", || async move {
            Ok(sqlx::query_as::<_, MarketRow>(sql)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn trades_for_market(&self, market: &str, limit: i64) -> Result<Vec<TradeRow>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE market_address = ? \
             ORDER BY block_number DESC, id DESC LIMIT ?"
        );
        let sql = sql.as_str();
        self.retrying("market trades", || async move {
            Ok(sqlx::query_as::<_, TradeRow>(sql)
                .bind(market)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn trades_for_user(&self, user: &str, limit: i64) -> Result<Vec<TradeRow>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE user_address = ? \
             ORDER BY block_number DESC, id DESC LIMIT ?"
        );
        let sql = sql.as_str();
        self.retrying("user trades", || async move {
            Ok(sqlx::query_as::<_, TradeRow>(sql)
                .bind(user)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardRow>> {
        let sql = format!(
            "SELECT user_address, MAX(user_fid) AS user_fid, COUNT(*) AS trade_count, \
                    TOTAL(CAST(amount AS REAL)) / 1e18 AS volume, \
                    TOTAL({pnl}) AS realized_pnl \
             FROM trades GROUP BY user_address \
             ORDER BY volume DESC, user_address LIMIT ?",
            pnl = realized_pnl(""),
        );
        let sql = sql.as_str();
        self.retrying("leaderboard", || async move {
            Ok(sqlx::query_as::<_, LeaderboardRow>(sql)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    /// Per-market, per-side position aggregates for one user.
    pub async fn portfolio(&self, user: &str) -> Result<Vec<PositionRow>> {
        let sql = format!(
            "SELECT t.market_address AS market_address, m.question AS question, t.outcome AS outcome, \
                    COUNT(*) AS trade_count, \
                    TOTAL(CAST(t.amount AS REAL)) / 1e18 AS invested, \
                    TOTAL(CAST(t.shares AS REAL)) / 1e18 AS shares, \
                    MAX(t.resolved_outcome) AS resolved_outcome, \
                    TOTAL({pnl}) AS realized_pnl \
             FROM trades t LEFT JOIN markets m ON m.address = t.market_address \
             WHERE t.user_address = ? \
             GROUP BY t.market_address, t.outcome \
             ORDER BY MAX(t.timestamp) DESC",
            pnl = realized_pnl("t."),
        );
        let sql = sql.as_str();
        self.retrying("portfolio", || async move {
            Ok(sqlx::query_as::<_, PositionRow>(sql)
                .bind(user)
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }
}

fn default_retry() -> RetryPolicy {
    RetryPolicy::fixed(DB_RETRY_ATTEMPTS, Duration::from_millis(DB_RETRY_BACKOFF_MS))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET: &str = "0x1111111111111111111111111111111111111111";

    fn trade(tx: &str, user: &str, outcome: i64) -> NewTrade {
        NewTrade {
            tx_hash: tx.to_string(),
            block_number: 10,
            user_address: user.to_string(),
            market_address: MARKET.to_string(),
            outcome,
            amount: "1000000000000000000".to_string(),
            shares: "2000000000000000000".to_string(),
            platform_fee: "10000000000000000".to_string(),
            creator_fee: "5000000000000000".to_string(),
            timestamp: 1_700_000_000,
            user_fid: None,
            prediction_id: Some("42".to_string()),
            resolved_outcome: None,
        }
    }

    async fn store_with_market() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.ensure_market_row(MARKET).await.unwrap();
        store
    }

    #[tokio::test]
    async fn duplicate_trade_is_skipped_not_updated() {
        let store = store_with_market().await;
        assert_eq!(store.insert_trade(&trade("0xabc", "0xu1", 1)).await.unwrap(), InsertOutcome::Inserted);

        let mut again = trade("0xabc", "0xu1", 1);
        again.amount = "5".to_string();
        assert_eq!(store.insert_trade(&again).await.unwrap(), InsertOutcome::Duplicate);

        let rows = store.trades_for_market(MARKET, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, "1000000000000000000");
    }

    #[tokio::test]
    async fn trade_requires_market_row() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.insert_trade(&trade("0xabc", "0xu1", 1)).await.is_err());
    }

    #[tokio::test]
    async fn resolved_outcome_is_only_filled_once() {
        let store = store_with_market().await;
        store.insert_trade(&trade("0x01", "0xu1", 1)).await.unwrap();
        store.insert_trade(&trade("0x02", "0xu2", 0)).await.unwrap();

        assert_eq!(store.backfill_resolved_outcome(MARKET, 1).await.unwrap(), 2);
        assert_eq!(store.backfill_resolved_outcome(MARKET, 0).await.unwrap(), 0);

        let rows = store.trades_for_market(MARKET, 10).await.unwrap();
        assert!(rows.iter().all(|r| r.resolved_outcome == Some(1)));
    }

    #[tokio::test]
    async fn upsert_keeps_resolution_when_refresh_reads_nothing() {
        let store = Store::in_memory().await.unwrap();
        let resolved = MarketRecord {
            address: MARKET.to_string(),
            question: Some("Will it rain?".to_string()),
            resolved: Some(true),
            winning_outcome: Some(1),
            ..Default::default()
        };
        store.upsert_market(&resolved).await.unwrap();

        let blind = MarketRecord {
            address: MARKET.to_string(),
            question: Some("Will it rain?".to_string()),
            ..Default::default()
        };
        store.upsert_market(&blind).await.unwrap();

        let row = store.get_market(MARKET).await.unwrap().unwrap();
        assert_eq!(row.record.resolved, Some(true));
        assert_eq!(row.record.winning_outcome, Some(1));
    }

    #[tokio::test]
    async fn stale_markets_include_resolved_and_expired() {
        let store = Store::in_memory().await.unwrap();
        let fresh = MarketRecord {
            address: "0xfresh".to_string(),
            resolved: Some(false),
            resolution_date: Some(2_000),
            ..Default::default()
        };
        let expired = MarketRecord {
            address: "0xexpired".to_string(),
            resolved: Some(false),
            resolution_date: Some(500),
            ..Default::default()
        };
        let resolved = MarketRecord {
            address: "0xresolved".to_string(),
            resolved: Some(true),
            winning_outcome: Some(0),
            resolution_date: Some(5_000),
            ..Default::default()
        };
        for m in [&fresh, &expired, &resolved] {
            store.upsert_market(m).await.unwrap();
        }

        let mut stale = store.stale_market_addresses(1_000).await.unwrap();
        stale.sort();
        assert_eq!(stale, vec!["0xexpired".to_string(), "0xresolved".to_string()]);
    }

    #[tokio::test]
    async fn leaderboard_and_portfolio_aggregate_pnl() {
        let store = store_with_market().await;
        store.insert_trade(&trade("0x01", "0xwinner", 1)).await.unwrap();
        store.insert_trade(&trade("0x02", "0xloser", 0)).await.unwrap();
        store.backfill_resolved_outcome(MARKET, 1).await.unwrap();

        let board = store.leaderboard(10).await.unwrap();
        assert_eq!(board.len(), 2);
        let winner = board.iter().find(|r| r.user_address == "0xwinner").unwrap();
        assert!((winner.volume - 1.0).abs() < 1e-9);
        assert!((winner.realized_pnl - 1.0).abs() < 1e-9);
        let loser = board.iter().find(|r| r.user_address == "0xloser").unwrap();
        assert!((loser.realized_pnl + 1.0).abs() < 1e-9);

        let positions = store.portfolio("0xwinner").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].resolved_outcome, Some(1));
        assert!((positions[0].shares - 2.0).abs() < 1e-9);
    }
}
