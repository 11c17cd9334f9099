//! On-chain access layer: event ABI constants, log decoding, and the
//! retrying RPC client.

pub mod abi;
pub mod decode;
pub mod rpc;

pub use decode::{classify_topic, EventTopic, RawLog};
pub use rpc::RpcClient;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use std::future::Future;

use crate::error::Result;

/// The narrow chain-access contract the stream controller drives. One real
/// implementation ([`RpcClient`]); tests substitute a scripted source.
pub trait ChainSource: Send + Sync + 'static {
    fn get_block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> impl Future<Output = Result<Vec<Log>>> + Send;

    fn get_block_timestamp(&self, block_number: u64)
        -> impl Future<Output = Result<i64>> + Send;

    fn get_gas_price(&self, tx_hash: B256) -> impl Future<Output = u128> + Send;
}

impl ChainSource for RpcClient {
    fn get_block_number(&self) -> impl Future<Output = Result<u64>> + Send {
        RpcClient::get_block_number(self)
    }

    fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> impl Future<Output = Result<Vec<Log>>> + Send {
        RpcClient::get_logs(self, from_block, to_block, addresses, topics)
    }

    fn get_block_timestamp(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<i64>> + Send {
        RpcClient::get_block_timestamp(self, block_number)
    }

    fn get_gas_price(&self, tx_hash: B256) -> impl Future<Output = u128> + Send {
        RpcClient::get_gas_price(self, tx_hash)
    }
}

/// The three event topics the pipeline subscribes to.
pub fn subscribed_topics() -> Vec<B256> {
    vec![
        abi::ORDER_FILLED_TOPIC,
        abi::POSITION_SPLIT_TOPIC,
        abi::POSITIONS_MERGE_TOPIC,
    ]
}
