//! Detector suite: eight analyzers, each a pure function over a read-only
//! store snapshot producing zero or more evidence items.
//!
//! Detectors are modeled as a tagged set of `{kind, scan(snapshot)}` behind
//! one trait. All of them are deterministic for a fixed snapshot: trades
//! arrive chain-ordered, every grouping structure iterates in sorted order,
//! and evidence ids are derived from content. Cancellation is honoured at
//! 1,000-trade boundaries; a cancelled run returns what it found so far.

mod atomic;
mod circular;
mod gas;
mod insider;
mod self_trade;
mod sybil;
mod volume;
mod winrate;

pub use atomic::AtomicWashDetector;
pub use circular::CircularTradeDetector;
pub use gas::GasAnomalyDetector;
pub use insider::NewWalletInsiderDetector;
pub use self_trade::SelfTradeDetector;
pub use sybil::SybilClusterDetector;
pub use volume::VolumeSpikeDetector;
pub use winrate::HighWinRateDetector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::Evidence;
use crate::onchain::abi;
use crate::store::Snapshot;

/// Incremental re-scan window: last 60 minutes.
pub const WINDOW_SECS: i64 = 3_600;
/// Incremental re-scan window: last 5,000 trades.
pub const WINDOW_TRADES: usize = 5_000;

/// Cancellation checkpoint spacing, in processed trades.
const CANCEL_STRIDE: usize = 1_000;

/// Shared per-run context. Detectors poll `checkpoint` as they walk trades.
#[derive(Clone, Default)]
pub struct ScanCtx {
    cancel: Arc<AtomicBool>,
}

impl ScanCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// True when the run should stop. Only consults the flag every
    /// [`CANCEL_STRIDE`] processed items.
    pub fn checkpoint(&self, processed: usize) -> bool {
        processed % CANCEL_STRIDE == 0 && self.cancel.load(Ordering::Relaxed)
    }
}

/// One analyzer in the suite.
pub trait Detector: Send + Sync {
    /// Stable name used in API routing and run summaries.
    fn name(&self) -> &'static str;

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence>;
}

/// The three analyzers ported from the first-generation tooling.
pub fn basic_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(NewWalletInsiderDetector),
        Box::new(HighWinRateDetector),
        Box::new(GasAnomalyDetector),
    ]
}

/// The five graph/pattern analyzers.
pub fn advanced_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(SelfTradeDetector),
        Box::new(CircularTradeDetector),
        Box::new(AtomicWashDetector),
        Box::new(VolumeSpikeDetector),
        Box::new(SybilClusterDetector),
    ]
}

pub fn all_detectors() -> Vec<Box<dyn Detector>> {
    let mut all = basic_detectors();
    all.extend(advanced_detectors());
    all
}

/// Run every detector over one snapshot, returning findings plus a
/// per-detector count summary (used for the `analysis_stats` bus event).
pub fn run_all(snapshot: &Snapshot, ctx: &ScanCtx) -> (Vec<Evidence>, Vec<(&'static str, usize)>) {
    let mut evidence = Vec::new();
    let mut summary = Vec::new();
    for detector in all_detectors() {
        let found = detector.scan(snapshot, ctx);
        summary.push((detector.name(), found.len()));
        evidence.extend(found);
    }
    (evidence, summary)
}

/// Content-derived evidence id: short keccak over the kind tag and the
/// identifying parts, so identical findings across re-scans share an id.
pub(crate) fn evidence_id(tag: &str, parts: &[&str]) -> String {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(tag.as_bytes());
    for p in parts {
        buf.push(0);
        buf.extend_from_slice(p.as_bytes());
    }
    let hash = abi::keccak256(&buf);
    format!("{tag}_{}", hex_prefix(&hash.0, 12))
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use alloy::primitives::{Address, B256, U256};
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    use crate::model::{PositionEvent, Side, Trade};
    use crate::store::Snapshot;

    pub fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    pub fn tx(n: u64) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        B256::from(bytes)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn trade(
        block: u64,
        log_index: u64,
        timestamp: i64,
        maker: Address,
        taker: Address,
        token: u64,
        side: Side,
        price: &str,
        size: &str,
    ) -> Trade {
        let price: Decimal = price.parse().unwrap();
        let size: Decimal = size.parse().unwrap();
        let mut volume = (size * price).round_dp(6);
        volume.rescale(6);
        Trade {
            tx_hash: tx(block * 1_000 + log_index),
            log_index,
            block_number: block,
            timestamp,
            exchange: addr(0xEE),
            order_hash: B256::ZERO,
            maker,
            taker,
            token_id: U256::from(token),
            side,
            price,
            size,
            volume,
            fee: 0,
            gas_price: 0,
            is_wash: false,
            wash_kind: None,
            wash_confidence: 0.0,
        }
    }

    /// Build a snapshot the way the store would: chain-ordered trades,
    /// first-seen times, and per-market rolling mean sizes.
    pub fn snapshot(mut trades: Vec<Trade>, position_events: Vec<PositionEvent>) -> Snapshot {
        trades.sort_by_key(|t| t.ord_key());

        let mut first_seen: HashMap<Address, i64> = HashMap::new();
        for t in &trades {
            for a in [t.maker, t.taker] {
                first_seen
                    .entry(a)
                    .and_modify(|v| *v = (*v).min(t.timestamp))
                    .or_insert(t.timestamp);
            }
        }

        let mut sums: HashMap<U256, (Decimal, u32)> = HashMap::new();
        for t in &trades {
            let e = sums.entry(t.token_id).or_insert((Decimal::ZERO, 0));
            e.0 += t.size;
            e.1 += 1;
        }
        let market_mean_size = sums
            .into_iter()
            .map(|(k, (sum, n))| (k, sum / Decimal::from(n)))
            .collect();

        Snapshot {
            trades,
            position_events,
            first_seen,
            market_mean_size,
        }
    }
}
