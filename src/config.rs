use std::time::Duration;

use alloy::primitives::{address, Address};

use crate::error::{AppError, Result};
use crate::retry::RetryPolicy;

/// Multicall3 is deployed at the same address on every major EVM chain.
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

pub const IDENTITY_API_URL: &str = "https://api.neynar.com";

/// Identity-profile lookups are best-effort; anything slower counts as absent.
pub const IDENTITY_TIMEOUT_SECS: u64 = 5;

/// Markets whose resolution date is older than this are swept from the registry.
pub const STALE_MARKET_AGE_SECS: u64 = 30 * 24 * 3_600;

/// Capacity of each per-market inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Markets per multicall round trip during batch backfill.
pub const MULTICALL_CHUNK_MARKETS: usize = 100;

/// Decimals of pool, volume and share quantities on the market contract.
pub const TOKEN_DECIMALS: u8 = 18;

pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;
pub const DB_IDLE_TIMEOUT_SECS: u64 = 300;

/// Bounded retry for pool-level database errors.
pub const DB_RETRY_ATTEMPTS: u32 = 3;
pub const DB_RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct Config {
    /// Streaming endpoint (RPC_WS_URL). Empty means polling only.
    pub rpc_ws_url: String,
    /// Polling endpoint used in degraded mode (RPC_HTTP_URL, derived from the WS URL if unset)
    pub rpc_http_url: String,
    pub factory_address: Address,
    pub multicall_address: Address,
    pub log_level: String,
    pub db_path: String,
    pub db_max_connections: u32,
    pub api_port: u16,
    pub identity_api_url: String,
    pub identity_api_key: Option<String>,
    pub health_check_interval: Duration,
    pub sweep_interval: Duration,
    pub connect_max_attempts: u32,
    pub connect_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_ws_url = std::env::var("RPC_WS_URL").unwrap_or_default();
        let rpc_http_url = match std::env::var("RPC_HTTP_URL") {
            Ok(url) => url,
            Err(_) => http_url_from_ws(&rpc_ws_url).ok_or_else(|| {
                AppError::Config("RPC_WS_URL or RPC_HTTP_URL must be set".to_string())
            })?,
        };

        let factory_address = std::env::var("FACTORY_ADDRESS")
            .map_err(|_| AppError::Config("FACTORY_ADDRESS must be set".to_string()))?
            .parse::<Address>()
            .map_err(|e| AppError::Config(format!("FACTORY_ADDRESS is not an address: {e}")))?;

        let multicall_address = match std::env::var("MULTICALL_ADDRESS") {
            Ok(s) => s
                .parse::<Address>()
                .map_err(|e| AppError::Config(format!("MULTICALL_ADDRESS is not an address: {e}")))?,
            Err(_) => MULTICALL3_ADDRESS,
        };

        Ok(Self {
            rpc_ws_url,
            rpc_http_url,
            factory_address,
            multicall_address,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "indexer.db".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u32>()
                .unwrap_or(10),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            identity_api_url: std::env::var("IDENTITY_API_URL")
                .unwrap_or_else(|_| IDENTITY_API_URL.to_string()),
            identity_api_key: std::env::var("IDENTITY_API_KEY").ok().filter(|k| !k.is_empty()),
            health_check_interval: Duration::from_secs(
                std::env::var("HEALTH_CHECK_INTERVAL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse::<u64>()
                    .unwrap_or(300)
                    .max(1),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "21600".to_string())
                    .parse::<u64>()
                    .unwrap_or(21_600)
                    .max(1),
            ),
            connect_max_attempts: std::env::var("CONNECT_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse::<u32>()
                .unwrap_or(5),
            connect_backoff: Duration::from_millis(
                std::env::var("CONNECT_BACKOFF_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse::<u64>()
                    .unwrap_or(5_000),
            ),
        })
    }

    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.connect_max_attempts, self.connect_backoff)
    }
}

/// `wss://host/path` → `https://host/path`, `ws://` → `http://`.
fn http_url_from_ws(ws_url: &str) -> Option<String> {
    if let Some(rest) = ws_url.strip_prefix("wss://") {
        Some(format!("https://{rest}"))
    } else {
        ws_url.strip_prefix("ws://").map(|rest| format!("http://{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_http_endpoint_from_ws() {
        assert_eq!(
            http_url_from_ws("wss://base-mainnet.example/v2/key").as_deref(),
            Some("https://base-mainnet.example/v2/key")
        );
        assert_eq!(http_url_from_ws("ws://127.0.0.1:8546").as_deref(), Some("http://127.0.0.1:8546"));
        assert!(http_url_from_ws("").is_none());
    }
}
