//! Contract bindings for the factory, the market and Multicall3, plus the
//! fixed field table shared by the single-market and batch metadata reads.

use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use crate::error::{AppError, Result};
use crate::types::{MarketCreatedEvent, MarketSnapshot, ResolutionEvent, TradeEvent};

sol! {
    interface IPredictionFactory {
        event MarketCreated(address indexed market, uint256 indexed predictionId, address indexed creator);

        function getAllMarkets() external view returns (address[] memory);
    }

    interface IPredictionMarket {
        event TradeExecuted(
            address indexed user,
            uint8 outcome,
            uint256 amount,
            uint256 shares,
            uint256 platformFee,
            uint256 creatorFee
        );
        event MarketResolved();

        function predictionId() external view returns (uint256);
        function question() external view returns (string memory);
        function description() external view returns (string memory);
        function category() external view returns (string memory);
        function rules() external view returns (string memory);
        function status() external view returns (uint8);
        function resolutionDate() external view returns (uint256);
        function resolved() external view returns (bool);
        // Declared as a full word: older deployments return bool, newer ones uint8.
        function winningOutcome() external view returns (uint256);
        function yesPool() external view returns (uint256);
        function noPool() external view returns (uint256);
        function totalVolume() external view returns (uint256);
        function tradeCount() external view returns (uint256);
        function creatorFid() external view returns (uint256);
        function totalSharesOutstanding() external view returns (uint256);
        function userFid(address user) external view returns (uint256);
    }

    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Call3Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Call3Result[] memory returnData);
    }
}

use IPredictionMarket as market;

/// Market view functions read into `markets`, in batch offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketField {
    PredictionId,
    Question,
    Description,
    Category,
    Rules,
    Status,
    ResolutionDate,
    Resolved,
    WinningOutcome,
    YesPool,
    NoPool,
    TotalVolume,
    TradeCount,
    CreatorFid,
    TotalShares,
}

pub const FIELD_COUNT: usize = MarketField::ALL.len();

impl MarketField {
    pub const ALL: [MarketField; 15] = [
        MarketField::PredictionId,
        MarketField::Question,
        MarketField::Description,
        MarketField::Category,
        MarketField::Rules,
        MarketField::Status,
        MarketField::ResolutionDate,
        MarketField::Resolved,
        MarketField::WinningOutcome,
        MarketField::YesPool,
        MarketField::NoPool,
        MarketField::TotalVolume,
        MarketField::TradeCount,
        MarketField::CreatorFid,
        MarketField::TotalShares,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MarketField::PredictionId => "predictionId",
            MarketField::Question => "question",
            MarketField::Description => "description",
            MarketField::Category => "category",
            MarketField::Rules => "rules",
            MarketField::Status => "status",
            MarketField::ResolutionDate => "resolutionDate",
            MarketField::Resolved => "resolved",
            MarketField::WinningOutcome => "winningOutcome",
            MarketField::YesPool => "yesPool",
            MarketField::NoPool => "noPool",
            MarketField::TotalVolume => "totalVolume",
            MarketField::TradeCount => "tradeCount",
            MarketField::CreatorFid => "creatorFid",
            MarketField::TotalShares => "totalSharesOutstanding",
        }
    }

    pub fn calldata(self) -> Bytes {
        let data = match self {
            MarketField::PredictionId => market::predictionIdCall {}.abi_encode(),
            MarketField::Question => market::questionCall {}.abi_encode(),
            MarketField::Description => market::descriptionCall {}.abi_encode(),
            MarketField::Category => market::categoryCall {}.abi_encode(),
            MarketField::Rules => market::rulesCall {}.abi_encode(),
            MarketField::Status => market::statusCall {}.abi_encode(),
            MarketField::ResolutionDate => market::resolutionDateCall {}.abi_encode(),
            MarketField::Resolved => market::resolvedCall {}.abi_encode(),
            MarketField::WinningOutcome => market::winningOutcomeCall {}.abi_encode(),
            MarketField::YesPool => market::yesPoolCall {}.abi_encode(),
            MarketField::NoPool => market::noPoolCall {}.abi_encode(),
            MarketField::TotalVolume => market::totalVolumeCall {}.abi_encode(),
            MarketField::TradeCount => market::tradeCountCall {}.abi_encode(),
            MarketField::CreatorFid => market::creatorFidCall {}.abi_encode(),
            MarketField::TotalShares => market::totalSharesOutstandingCall {}.abi_encode(),
        };
        data.into()
    }

    /// Decode raw return data for this field into `snapshot`.
    pub fn decode_into(self, raw: &[u8], snapshot: &mut MarketSnapshot) -> Result<()> {
        match self {
            MarketField::PredictionId => {
                snapshot.prediction_id = Some(market::predictionIdCall::abi_decode_returns(raw)?)
            }
            MarketField::Question => {
                snapshot.question = Some(market::questionCall::abi_decode_returns(raw)?)
            }
            MarketField::Description => {
                snapshot.description = Some(market::descriptionCall::abi_decode_returns(raw)?)
            }
            MarketField::Category => {
                snapshot.category = Some(market::categoryCall::abi_decode_returns(raw)?)
            }
            MarketField::Rules => snapshot.rules = Some(market::rulesCall::abi_decode_returns(raw)?),
            MarketField::Status => {
                snapshot.status = Some(market::statusCall::abi_decode_returns(raw)?)
            }
            MarketField::ResolutionDate => {
                snapshot.resolution_date =
                    Some(market::resolutionDateCall::abi_decode_returns(raw)?)
            }
            MarketField::Resolved => {
                snapshot.resolved = Some(market::resolvedCall::abi_decode_returns(raw)?)
            }
            MarketField::WinningOutcome => {
                let word = market::winningOutcomeCall::abi_decode_returns(raw)?;
                snapshot.winning_outcome = normalize_outcome(word);
            }
            MarketField::YesPool => {
                snapshot.yes_pool = Some(market::yesPoolCall::abi_decode_returns(raw)?)
            }
            MarketField::NoPool => {
                snapshot.no_pool = Some(market::noPoolCall::abi_decode_returns(raw)?)
            }
            MarketField::TotalVolume => {
                snapshot.total_volume = Some(market::totalVolumeCall::abi_decode_returns(raw)?)
            }
            MarketField::TradeCount => {
                snapshot.trade_count = Some(market::tradeCountCall::abi_decode_returns(raw)?)
            }
            MarketField::CreatorFid => {
                snapshot.creator_fid = Some(market::creatorFidCall::abi_decode_returns(raw)?)
            }
            MarketField::TotalShares => {
                snapshot.total_shares =
                    Some(market::totalSharesOutstandingCall::abi_decode_returns(raw)?)
            }
        }
        Ok(())
    }
}

/// Canonical outcome representation: a `bool` word and a `uint8` word both
/// land on 0/1. Any other value is treated as unreadable.
pub fn normalize_outcome(word: U256) -> Option<u8> {
    (word <= U256::from(1u8)).then(|| u8::from(word == U256::from(1u8)))
}

pub fn user_fid_calldata(user: Address) -> Bytes {
    market::userFidCall { user }.abi_encode().into()
}

pub fn decode_user_fid(raw: &[u8]) -> Result<U256> {
    Ok(market::userFidCall::abi_decode_returns(raw)?)
}

pub fn all_markets_calldata() -> Bytes {
    IPredictionFactory::getAllMarketsCall {}.abi_encode().into()
}

pub fn decode_all_markets(raw: &[u8]) -> Result<Vec<Address>> {
    Ok(IPredictionFactory::getAllMarketsCall::abi_decode_returns(raw)?)
}

/// Encode a Multicall3 `aggregate3` call; every sub-call may fail independently.
pub fn aggregate3_calldata(calls: &[(Address, Bytes)]) -> Bytes {
    let calls = calls
        .iter()
        .map(|(target, data)| IMulticall3::Call3 {
            target: *target,
            allowFailure: true,
            callData: data.clone(),
        })
        .collect();
    IMulticall3::aggregate3Call { calls }.abi_encode().into()
}

/// Decode `aggregate3` results; failed sub-calls become `None`.
pub fn decode_aggregate3(raw: &[u8]) -> Result<Vec<Option<Bytes>>> {
    let results = IMulticall3::aggregate3Call::abi_decode_returns(raw)?;
    Ok(results
        .into_iter()
        .map(|r| r.success.then_some(r.returnData))
        .collect())
}

// ---------------------------------------------------------------------------
// Log decoding
// ---------------------------------------------------------------------------

pub fn decode_trade(log: &Log) -> Result<TradeEvent> {
    let event = market::TradeExecuted::decode_log_data(&log.inner.data)?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| AppError::Chain("trade log without transaction hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| AppError::Chain("trade log without block number".to_string()))?;
    Ok(TradeEvent {
        market: log.inner.address,
        user: event.user,
        outcome: event.outcome,
        amount: event.amount,
        shares: event.shares,
        platform_fee: event.platformFee,
        creator_fee: event.creatorFee,
        tx_hash,
        block_number,
    })
}

pub fn decode_resolution(log: &Log) -> Result<ResolutionEvent> {
    market::MarketResolved::decode_log_data(&log.inner.data)?;
    Ok(ResolutionEvent { market: log.inner.address, block_number: log.block_number })
}

pub fn decode_market_created(log: &Log) -> Result<MarketCreatedEvent> {
    let event = IPredictionFactory::MarketCreated::decode_log_data(&log.inner.data)?;
    Ok(MarketCreatedEvent {
        market: event.market,
        prediction_id: event.predictionId,
        creator: event.creator,
    })
}
