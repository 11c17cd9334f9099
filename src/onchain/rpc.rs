//! Polygon JSON-RPC access: block-range log retrieval with retry and
//! automatic range halving, plus LRU-cached block-timestamp and
//! effective-gas-price lookups.

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 6;

/// Largest block span we hand to `eth_getLogs` before halving kicks in.
const MAX_LOG_SPAN: u64 = 1_000;

const TIMESTAMP_CACHE_SIZE: usize = 4_096;
const GAS_CACHE_SIZE: usize = 4_096;

/// HTTP RPC client for the Polygon upstream.
pub struct RpcClient {
    provider: DynProvider,
    block_timestamps: Mutex<LruCache<u64, i64>>,
    gas_prices: Mutex<LruCache<B256, u128>>,
}

impl RpcClient {
    pub fn connect(rpc_url: &str) -> Result<Self> {
        let url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("invalid POLYGON_RPC_URL: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            provider,
            block_timestamps: Mutex::new(LruCache::new(
                NonZeroUsize::new(TIMESTAMP_CACHE_SIZE).unwrap(),
            )),
            gas_prices: Mutex::new(LruCache::new(NonZeroUsize::new(GAS_CACHE_SIZE).unwrap())),
        })
    }

    /// Current chain head.
    pub async fn get_block_number(&self) -> Result<u64> {
        self.with_backoff("eth_blockNumber", || async {
            self.provider.get_block_number().await
        })
        .await
    }

    /// Logs matching `topics` on `addresses` over an inclusive block range.
    ///
    /// Oversized ranges are halved and refetched until every sub-range is at
    /// most [`MAX_LOG_SPAN`] blocks or the upstream accepts it. Results come
    /// back in ascending block order.
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>> {
        let mut out = Vec::new();
        // LIFO of pending sub-ranges; push the upper half first so the lower
        // half is fetched first and ordering stays ascending.
        let mut pending = vec![(from_block, to_block)];

        while let Some((from, to)) = pending.pop() {
            let span = to.saturating_sub(from) + 1;
            if span > MAX_LOG_SPAN && from < to {
                let mid = from + (to - from) / 2;
                pending.push((mid + 1, to));
                pending.push((from, mid));
                continue;
            }

            let filter = Filter::new()
                .address(addresses.to_vec())
                .event_signature(topics.to_vec())
                .from_block(from)
                .to_block(to);

            match self
                .with_backoff("eth_getLogs", || async {
                    self.provider.get_logs(&filter).await
                })
                .await
            {
                Ok(mut logs) => out.append(&mut logs),
                Err(e) if from < to => {
                    // Some providers reject smaller spans than our cap;
                    // halve and retry rather than failing the whole batch.
                    warn!(from, to, error = %e, "log fetch failed, halving range");
                    let mid = from + (to - from) / 2;
                    pending.push((mid + 1, to));
                    pending.push((from, mid));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    /// Block timestamp in unix seconds, LRU-cached.
    pub async fn get_block_timestamp(&self, block_number: u64) -> Result<i64> {
        if let Some(ts) = self
            .block_timestamps
            .lock()
            .expect("timestamp cache poisoned")
            .get(&block_number)
        {
            return Ok(*ts);
        }

        let block = self
            .with_backoff("eth_getBlockByNumber", || async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
            })
            .await?
            .ok_or_else(|| AppError::Upstream(format!("block {block_number} not found")))?;

        let ts = block.header.timestamp as i64;
        self.block_timestamps
            .lock()
            .expect("timestamp cache poisoned")
            .put(block_number, ts);
        Ok(ts)
    }

    /// Effective gas price paid by a transaction, in wei. Best-effort:
    /// lookup failures yield 0 and are never fatal to ingestion.
    pub async fn get_gas_price(&self, tx_hash: B256) -> u128 {
        if let Some(gp) = self
            .gas_prices
            .lock()
            .expect("gas cache poisoned")
            .get(&tx_hash)
        {
            return *gp;
        }

        match self.provider.get_transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => {
                let gp = receipt.effective_gas_price;
                self.gas_prices
                    .lock()
                    .expect("gas cache poisoned")
                    .put(tx_hash, gp);
                gp
            }
            Ok(None) => 0,
            Err(e) => {
                debug!(tx = %tx_hash, error = %e, "gas price lookup failed");
                0
            }
        }
    }

    /// Run an RPC call with exponential backoff: 500 ms initial, factor 2,
    /// 30 s cap, 6 attempts. Exhaustion surfaces as an upstream error.
    async fn with_backoff<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = alloy::transports::TransportResult<T>>,
    {
        let mut delay = BACKOFF_INITIAL;
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        debug!(
                            op,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_err,
                            "RPC call failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }

        warn!(op, error = %last_err, "RPC call exhausted retries");
        Err(AppError::Upstream(format!("{op}: {last_err}")))
    }
}
