//! Bit-exact decoding of the three exchange event types into typed records.
//!
//! `OrderFilled` layout:
//!   topics: [topic0, orderHash, maker, taker]
//!   data:   [makerAssetId, takerAssetId, makerAmountFilled,
//!            takerAmountFilled, fee] (five 32-byte slots)
//!
//! `PositionSplit` / `PositionsMerge` layout:
//!   topics: [topic0, stakeholder, parentCollectionId, conditionId]
//!   data:   [collateral, partition_offset, amount, partition_len, ...]
//!
//! Malformed events are rejected with a decode error; callers count and
//! drop them, never abort.

use alloy::primitives::{Address, B256, U256};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{AppError, Result};
use crate::model::{PositionEvent, PositionEventKind, Side, Trade};
use crate::onchain::abi;

/// A log stripped down to the parts decoding needs. Extracted once from the
/// RPC type so the decoders stay transport-agnostic and easy to test.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl RawLog {
    /// Convert an RPC log, rejecting pending logs without block/tx metadata.
    pub fn from_rpc(log: &alloy::rpc::types::Log) -> Option<RawLog> {
        Some(RawLog {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.to_vec(),
            block_number: log.block_number?,
            tx_hash: log.transaction_hash?,
            log_index: log.log_index?,
        })
    }

    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

fn slot(data: &[u8], i: usize) -> Result<[u8; 32]> {
    let start = i * 32;
    data.get(start..start + 32)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| AppError::Decode(format!("data slot {i} out of range ({} bytes)", data.len())))
}

fn slot_u256(data: &[u8], i: usize) -> Result<U256> {
    Ok(U256::from_be_bytes(slot(data, i)?))
}

fn slot_u128(data: &[u8], i: usize) -> Result<u128> {
    slot_u256(data, i)?
        .try_into()
        .map_err(|_| AppError::Decode(format!("data slot {i} exceeds u128")))
}

fn topic_address(topics: &[B256], i: usize) -> Result<Address> {
    let t = topics
        .get(i)
        .ok_or_else(|| AppError::Decode(format!("missing topic {i}")))?;
    Ok(Address::from_slice(&t.0[12..]))
}

/// Decode one `OrderFilled` log into a [`Trade`].
///
/// Exactly one of the asset ids must be zero (the collateral side); logs
/// violating that, or with a zero token amount, are rejected.
pub fn decode_order_filled(log: &RawLog, timestamp: i64, gas_price: u128) -> Result<Trade> {
    let order_hash = log
        .topics
        .get(1)
        .copied()
        .ok_or_else(|| AppError::Decode("missing orderHash topic".into()))?;
    let maker = topic_address(&log.topics, 2)?;
    let taker = topic_address(&log.topics, 3)?;

    let maker_asset_id = slot_u256(&log.data, 0)?;
    let taker_asset_id = slot_u256(&log.data, 1)?;
    let maker_amount = slot_u128(&log.data, 2)?;
    let taker_amount = slot_u128(&log.data, 3)?;
    let fee = slot_u128(&log.data, 4)?;

    // Exactly one side is collateral (asset id zero).
    let (side, token_id, usdc_amount, token_amount) =
        match (maker_asset_id.is_zero(), taker_asset_id.is_zero()) {
            (true, false) => (Side::Buy, taker_asset_id, maker_amount, taker_amount),
            (false, true) => (Side::Sell, maker_asset_id, taker_amount, maker_amount),
            (true, true) => {
                return Err(AppError::Decode("both asset ids are zero".into()));
            }
            (false, false) => {
                return Err(AppError::Decode("both asset ids are non-zero".into()));
            }
        };

    if token_amount == 0 {
        return Err(AppError::Decode("zero token amount".into()));
    }

    // 6-decimal USDC-scale amounts fit comfortably in u64; anything larger
    // is garbage data.
    let usdc: u64 = usdc_amount
        .try_into()
        .map_err(|_| AppError::Decode("collateral amount exceeds u64".into()))?;
    let token: u64 = token_amount
        .try_into()
        .map_err(|_| AppError::Decode("token amount exceeds u64".into()))?;

    let mut price = (Decimal::from(usdc) / Decimal::from(token))
        .round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven);
    price.rescale(4);

    let mut size = Decimal::from_i128_with_scale(token as i128, 6);
    size.rescale(6);

    let mut volume = (size * price).round_dp(6);
    volume.rescale(6);

    if price > Decimal::ONE {
        tracing::warn!(
            tx = %log.tx_hash,
            log_index = log.log_index,
            price = %price,
            "outcome token priced above 1.0 collateral unit"
        );
    }

    Ok(Trade {
        tx_hash: log.tx_hash,
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
        exchange: log.address,
        order_hash,
        maker,
        taker,
        token_id,
        side,
        price,
        size,
        volume,
        fee,
        gas_price,
        is_wash: false,
        wash_kind: None,
        wash_confidence: 0.0,
    })
}

/// Decode a `PositionSplit` or `PositionsMerge` log.
pub fn decode_position_event(
    log: &RawLog,
    kind: PositionEventKind,
    timestamp: i64,
) -> Result<PositionEvent> {
    let stakeholder = topic_address(&log.topics, 1)?;
    let parent_collection_id = log
        .topics
        .get(2)
        .copied()
        .ok_or_else(|| AppError::Decode("missing parentCollectionId topic".into()))?;
    let condition_id = log
        .topics
        .get(3)
        .copied()
        .ok_or_else(|| AppError::Decode("missing conditionId topic".into()))?;

    let collateral = Address::from_slice(&slot(&log.data, 0)?[12..]);
    let partition_offset: usize = slot_u256(&log.data, 1)?
        .try_into()
        .map_err(|_| AppError::Decode("partition offset exceeds usize".into()))?;
    let amount = slot_u128(&log.data, 2)?;

    // Dynamic uint256[] partition: length word at the offset, elements after.
    let mut partition = Vec::new();
    if partition_offset + 32 <= log.data.len() {
        let len_word = partition_offset / 32;
        let len: usize = slot_u256(&log.data, len_word)?
            .try_into()
            .map_err(|_| AppError::Decode("partition length exceeds usize".into()))?;
        for i in 0..len {
            partition.push(slot_u256(&log.data, len_word + 1 + i)?);
        }
    }

    Ok(PositionEvent {
        tx_hash: log.tx_hash,
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
        kind,
        stakeholder,
        collateral,
        parent_collection_id,
        condition_id,
        partition,
        amount,
    })
}

/// Which decoder a log belongs to, by topic0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTopic {
    OrderFilled,
    PositionSplit,
    PositionsMerge,
}

pub fn classify_topic(topic0: B256) -> Option<EventTopic> {
    if topic0 == abi::ORDER_FILLED_TOPIC {
        Some(EventTopic::OrderFilled)
    } else if topic0 == abi::POSITION_SPLIT_TOPIC {
        Some(EventTopic::PositionSplit)
    } else if topic0 == abi::POSITIONS_MERGE_TOPIC {
        Some(EventTopic::PositionsMerge)
    } else {
        None
    }
}
