//! In-process chain used by tests: contracts answer calls by selector with
//! real ABI encodings, and emitted logs are real encoded events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::chain::abi::{IPredictionFactory, IPredictionMarket as market, MarketField};
use crate::chain::feed::{ChainFeed, FeedConnector, LogQuery, LogStream};
use crate::error::{AppError, Result};
use crate::types::FeedMode;

pub const BASE_TIMESTAMP: u64 = 1_700_000_000;

pub fn wei(units: u64) -> U256 {
    U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
}

#[derive(Debug, Clone, Default)]
pub struct FakeMarket {
    fields: HashMap<MarketField, Bytes>,
    user_fids: HashMap<Address, U256>,
}

impl FakeMarket {
    /// A live, unresolved market with every view function present.
    pub fn open(question: &str) -> Self {
        let mut m = Self::default();
        m.set(MarketField::PredictionId, market::predictionIdCall::abi_encode_returns(&U256::from(42u64)));
        m.set(MarketField::Question, market::questionCall::abi_encode_returns(&question.to_string()));
        m.set(MarketField::Description, market::descriptionCall::abi_encode_returns(&"desc".to_string()));
        m.set(MarketField::Category, market::categoryCall::abi_encode_returns(&"crypto".to_string()));
        m.set(MarketField::Rules, market::rulesCall::abi_encode_returns(&"rules".to_string()));
        m.set(MarketField::Status, market::statusCall::abi_encode_returns(&0u8));
        m.set(
            MarketField::ResolutionDate,
            market::resolutionDateCall::abi_encode_returns(&U256::from(BASE_TIMESTAMP + 86_400)),
        );
        m.set(MarketField::Resolved, market::resolvedCall::abi_encode_returns(&false));
        m.set(MarketField::WinningOutcome, market::winningOutcomeCall::abi_encode_returns(&U256::ZERO));
        m.set(MarketField::YesPool, market::yesPoolCall::abi_encode_returns(&wei(10)));
        m.set(MarketField::NoPool, market::noPoolCall::abi_encode_returns(&wei(5)));
        m.set(MarketField::TotalVolume, market::totalVolumeCall::abi_encode_returns(&wei(15)));
        m.set(MarketField::TradeCount, market::tradeCountCall::abi_encode_returns(&U256::from(3u64)));
        m.set(MarketField::CreatorFid, market::creatorFidCall::abi_encode_returns(&U256::from(7u64)));
        m.set(MarketField::TotalShares, market::totalSharesOutstandingCall::abi_encode_returns(&wei(30)));
        m
    }

    pub fn set(&mut self, field: MarketField, raw: Vec<u8>) {
        self.fields.insert(field, raw.into());
    }

    /// Simulate a view function missing on an older contract version.
    pub fn remove(&mut self, field: MarketField) {
        self.fields.remove(&field);
    }

    pub fn resolve(&mut self, outcome: u8) {
        self.set(MarketField::Status, market::statusCall::abi_encode_returns(&2u8));
        self.set(MarketField::Resolved, market::resolvedCall::abi_encode_returns(&true));
        self.set(
            MarketField::WinningOutcome,
            market::winningOutcomeCall::abi_encode_returns(&U256::from(outcome)),
        );
    }

    pub fn set_resolution_date(&mut self, timestamp: u64) {
        self.set(
            MarketField::ResolutionDate,
            market::resolutionDateCall::abi_encode_returns(&U256::from(timestamp)),
        );
    }

    pub fn set_user_fid(&mut self, user: Address, fid: u64) {
        self.user_fids.insert(user, U256::from(fid));
    }
}

pub struct FakeChain {
    pub factory: Address,
    markets: DashMap<Address, FakeMarket>,
    listed: Mutex<Vec<Address>>,
    watchers: Mutex<Vec<(LogQuery, mpsc::UnboundedSender<Log>)>>,
    failing_watches: DashMap<Address, u32>,
    healthy: AtomicBool,
    block: AtomicU64,
    pub aggregate_calls: AtomicU32,
    pub single_calls: AtomicU32,
}

impl FakeChain {
    pub fn new(factory: Address) -> Arc<Self> {
        Arc::new(Self {
            factory,
            markets: DashMap::new(),
            listed: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            failing_watches: DashMap::new(),
            healthy: AtomicBool::new(true),
            block: AtomicU64::new(100),
            aggregate_calls: AtomicU32::new(0),
            single_calls: AtomicU32::new(0),
        })
    }

    /// Deploy a market and list it on the factory.
    pub fn deploy(&self, address: Address, market: FakeMarket) {
        self.markets.insert(address, market);
        self.listed.lock().unwrap().push(address);
    }

    pub fn update(&self, address: Address, f: impl FnOnce(&mut FakeMarket)) {
        if let Some(mut m) = self.markets.get_mut(&address) {
            f(&mut m);
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The next `times` log watches on `address` fail.
    pub fn fail_watches(&self, address: Address, times: u32) {
        self.failing_watches.insert(address, times);
    }

    /// Deliver a log to every open watcher for its address and topic0.
    pub fn emit(&self, log: Log) {
        let topic0 = log.inner.data.topics().first().copied();
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|(_, tx)| !tx.is_closed());
        for (query, tx) in watchers.iter() {
            if query.address == log.inner.address && Some(query.event) == topic0 {
                let _ = tx.send(log.clone());
            }
        }
    }

    /// Watchers whose receiving side is still alive.
    pub fn open_watchers(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|(_, tx)| !tx.is_closed());
        watchers.len()
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Chain("connection reset by peer".to_string()))
        }
    }

    fn answer(&self, to: Address, data: &[u8]) -> Result<Bytes> {
        let selector: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| AppError::Chain("short calldata".to_string()))?;

        if to == self.factory && selector == IPredictionFactory::getAllMarketsCall::SELECTOR {
            let listed = self.listed.lock().unwrap().clone();
            return Ok(IPredictionFactory::getAllMarketsCall::abi_encode_returns(&listed).into());
        }

        let reverted = || AppError::Chain("execution reverted".to_string());
        let m = self.markets.get(&to).ok_or_else(reverted)?;

        if selector == market::userFidCall::SELECTOR {
            let call = market::userFidCall::abi_decode(data)?;
            let fid = m.user_fids.get(&call.user).ok_or_else(reverted)?;
            return Ok(market::userFidCall::abi_encode_returns(fid).into());
        }

        MarketField::ALL
            .iter()
            .find(|f| f.calldata().starts_with(&selector))
            .and_then(|f| m.fields.get(f).cloned())
            .ok_or_else(reverted)
    }
}

#[async_trait]
impl ChainFeed for FakeChain {
    fn mode(&self) -> FeedMode {
        FeedMode::Streaming
    }

    async fn block_number(&self) -> Result<u64> {
        self.ensure_healthy()?;
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        self.ensure_healthy()?;
        Ok(BASE_TIMESTAMP + number * 2)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.ensure_healthy()?;
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(to, &data)
    }

    async fn aggregate(&self, calls: &[(Address, Bytes)]) -> Result<Vec<Option<Bytes>>> {
        self.ensure_healthy()?;
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(calls.iter().map(|(to, data)| self.answer(*to, data).ok()).collect())
    }

    async fn watch_logs(&self, query: LogQuery) -> Result<LogStream> {
        self.ensure_healthy()?;
        if let Some(mut left) = self.failing_watches.get_mut(&query.address) {
            if *left > 0 {
                *left -= 1;
                return Err(AppError::Chain("request timed out".to_string()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push((query, tx));
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|log| (log, rx)) }).boxed())
    }
}

/// Hands out the shared fake chain. Streaming connects fail while
/// `fail_streaming` is positive; a successful connect heals the chain.
pub struct FakeConnector {
    pub chain: Arc<FakeChain>,
    pub fail_streaming: AtomicU32,
    pub connects: AtomicU32,
}

impl FakeConnector {
    pub fn new(chain: Arc<FakeChain>) -> Arc<Self> {
        Arc::new(Self { chain, fail_streaming: AtomicU32::new(0), connects: AtomicU32::new(0) })
    }
}

#[async_trait]
impl FeedConnector for FakeConnector {
    async fn connect_streaming(&self) -> Result<Arc<dyn ChainFeed>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_streaming
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Chain("ws handshake failed".to_string()));
        }
        self.chain.set_healthy(true);
        Ok(self.chain.clone())
    }

    async fn connect_polling(&self) -> Result<Arc<dyn ChainFeed>> {
        self.chain.set_healthy(true);
        Ok(Arc::new(PollingFake(self.chain.clone())))
    }
}

/// The fake chain seen through a degraded connection.
pub struct PollingFake(pub Arc<FakeChain>);

#[async_trait]
impl ChainFeed for PollingFake {
    fn mode(&self) -> FeedMode {
        FeedMode::Polling
    }
    async fn block_number(&self) -> Result<u64> {
        self.0.block_number().await
    }
    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        self.0.block_timestamp(number).await
    }
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.0.call(to, data).await
    }
    async fn aggregate(&self, calls: &[(Address, Bytes)]) -> Result<Vec<Option<Bytes>>> {
        self.0.aggregate(calls).await
    }
    async fn watch_logs(&self, query: LogQuery) -> Result<LogStream> {
        self.0.watch_logs(query).await
    }
}

// ---------------------------------------------------------------------------
// Log builders
// ---------------------------------------------------------------------------

pub fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub fn tx_hash(n: u8) -> B256 {
    B256::repeat_byte(n)
}

pub fn trade_log(
    market_address: Address,
    user: Address,
    outcome: u8,
    amount: U256,
    shares: U256,
    tx: B256,
    block: u64,
) -> Log {
    let event = market::TradeExecuted {
        user,
        outcome,
        amount,
        shares,
        platformFee: amount / U256::from(100u64),
        creatorFee: amount / U256::from(200u64),
    };
    Log {
        inner: alloy::primitives::Log { address: market_address, data: event.encode_log_data() },
        block_number: Some(block),
        transaction_hash: Some(tx),
        ..Default::default()
    }
}

pub fn resolution_log(market_address: Address, block: u64) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address: market_address,
            data: market::MarketResolved {}.encode_log_data(),
        },
        block_number: Some(block),
        ..Default::default()
    }
}

pub fn market_created_log(factory: Address, new_market: Address) -> Log {
    let event = IPredictionFactory::MarketCreated {
        market: new_market,
        predictionId: U256::from(99u64),
        creator: addr(0xcc),
    };
    Log {
        inner: alloy::primitives::Log { address: factory, data: event.encode_log_data() },
        block_number: Some(101),
        ..Default::default()
    }
}
