use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolEvent;

use crate::chain::abi::{self, IPredictionFactory, IPredictionMarket, MarketField};
use crate::chain::feed::{ChainFeed, LogQuery};
use crate::error::Result;

/// Factory and market handles bound to one feed connection. Rebuilt after
/// every reconnect; a handle from a replaced feed keeps talking to the dead
/// connection.
#[derive(Clone)]
pub struct Contracts {
    feed: Arc<dyn ChainFeed>,
    factory: Address,
}

impl Contracts {
    pub fn bind(feed: Arc<dyn ChainFeed>, factory: Address) -> Self {
        Self { feed, factory }
    }

    pub fn feed(&self) -> &Arc<dyn ChainFeed> {
        &self.feed
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub fn market(&self, address: Address) -> MarketContract<'_> {
        MarketContract { feed: self.feed.as_ref(), address }
    }

    pub async fn all_markets(&self) -> Result<Vec<Address>> {
        let raw = self.feed.call(self.factory, abi::all_markets_calldata()).await?;
        abi::decode_all_markets(&raw)
    }

    pub fn market_created_query(&self) -> LogQuery {
        LogQuery {
            address: self.factory,
            event: IPredictionFactory::MarketCreated::SIGNATURE_HASH,
        }
    }
}

#[derive(Clone, Copy)]
pub struct MarketContract<'a> {
    feed: &'a dyn ChainFeed,
    pub address: Address,
}

impl MarketContract<'_> {
    pub async fn read(&self, field: MarketField) -> Result<Bytes> {
        self.feed.call(self.address, field.calldata()).await
    }

    pub async fn user_fid(&self, user: Address) -> Result<U256> {
        let raw = self.feed.call(self.address, abi::user_fid_calldata(user)).await?;
        abi::decode_user_fid(&raw)
    }

    pub fn trade_query(&self) -> LogQuery {
        LogQuery {
            address: self.address,
            event: IPredictionMarket::TradeExecuted::SIGNATURE_HASH,
        }
    }

    pub fn resolution_query(&self) -> LogQuery {
        LogQuery {
            address: self.address,
            event: IPredictionMarket::MarketResolved::SIGNATURE_HASH,
        }
    }
}
