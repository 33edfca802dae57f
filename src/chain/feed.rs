//! The chain data feed seam: what the indexer needs from a node, and the
//! alloy-backed implementation used in production.

use std::sync::Arc;

use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tracing::debug;

use crate::chain::abi;
use crate::error::{AppError, Result};
use crate::types::FeedMode;

pub type LogStream = BoxStream<'static, Log>;

/// One contract address, one event signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogQuery {
    pub address: Address,
    pub event: B256,
}

#[async_trait]
pub trait ChainFeed: Send + Sync {
    fn mode(&self) -> FeedMode;

    async fn block_number(&self) -> Result<u64>;

    /// Block time in unix seconds.
    async fn block_timestamp(&self, number: u64) -> Result<u64>;

    /// Point-in-time `eth_call` against latest state.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// One round trip for many calls. Entry `i` is `None` if call `i` reverted.
    async fn aggregate(&self, calls: &[(Address, Bytes)]) -> Result<Vec<Option<Bytes>>>;

    /// Live logs for one event of one contract. The stream ends when the
    /// underlying connection drops.
    async fn watch_logs(&self, query: LogQuery) -> Result<LogStream>;
}

/// Builds feeds. The connection manager owns one and calls it on every (re)connect.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect_streaming(&self) -> Result<Arc<dyn ChainFeed>>;
    async fn connect_polling(&self) -> Result<Arc<dyn ChainFeed>>;
}

// ---------------------------------------------------------------------------
// alloy implementation
// ---------------------------------------------------------------------------

pub struct AlloyFeed {
    provider: DynProvider,
    mode: FeedMode,
    multicall: Address,
}

impl AlloyFeed {
    pub async fn connect_ws(url: &str, multicall: Address) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(url))
            .await?
            .erased();
        Ok(Self { provider, mode: FeedMode::Streaming, multicall })
    }

    pub fn connect_http(url: &str, multicall: Address) -> Result<Self> {
        let url = url
            .parse()
            .map_err(|e| AppError::Config(format!("invalid RPC HTTP URL {url}: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider, mode: FeedMode::Polling, multicall })
    }
}

#[async_trait]
impl ChainFeed for AlloyFeed {
    fn mode(&self) -> FeedMode {
        self.mode
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?
            .ok_or_else(|| AppError::Chain(format!("block {number} not found")))?;
        Ok(block.header.timestamp)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        Ok(self.provider.call(tx).await?)
    }

    async fn aggregate(&self, calls: &[(Address, Bytes)]) -> Result<Vec<Option<Bytes>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.call(self.multicall, abi::aggregate3_calldata(calls)).await?;
        let results = abi::decode_aggregate3(&raw)?;
        if results.len() != calls.len() {
            return Err(AppError::Chain(format!(
                "multicall returned {} results for {} calls",
                results.len(),
                calls.len()
            )));
        }
        Ok(results)
    }

    async fn watch_logs(&self, query: LogQuery) -> Result<LogStream> {
        let filter = Filter::new()
            .address(query.address)
            .event_signature(query.event);
        debug!(address = %query.address, mode = %self.mode, "opening log watch");
        match self.mode {
            FeedMode::Streaming => {
                let sub = self.provider.subscribe_logs(&filter).await?;
                Ok(sub.into_stream().boxed())
            }
            FeedMode::Polling => {
                let poller = self.provider.watch_logs(&filter).await?;
                Ok(poller.into_stream().flat_map(stream::iter).boxed())
            }
        }
    }
}

pub struct AlloyConnector {
    ws_url: String,
    http_url: String,
    multicall: Address,
}

impl AlloyConnector {
    pub fn new(ws_url: String, http_url: String, multicall: Address) -> Self {
        Self { ws_url, http_url, multicall }
    }
}

#[async_trait]
impl FeedConnector for AlloyConnector {
    async fn connect_streaming(&self) -> Result<Arc<dyn ChainFeed>> {
        if self.ws_url.is_empty() {
            return Err(AppError::Config("no streaming endpoint configured".to_string()));
        }
        Ok(Arc::new(AlloyFeed::connect_ws(&self.ws_url, self.multicall).await?))
    }

    async fn connect_polling(&self) -> Result<Arc<dyn ChainFeed>> {
        Ok(Arc::new(AlloyFeed::connect_http(&self.http_url, self.multicall)?))
    }
}
