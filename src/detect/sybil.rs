//! Sybil-cluster detection: bursts of same-sized bets from distinct wallets
//! on the same market and side inside a sliding 10-second window.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::Address;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind, Side};
use crate::store::Snapshot;

const WINDOW_SECS: i64 = 10;
const MIN_CLUSTER: usize = 3;
/// Member size tolerance around the group mean.
const SIZE_TOLERANCE: f64 = 0.2;
/// Fraction of members that must sit inside the tolerance band.
const MIN_SIMILAR_FRACTION: f64 = 0.6;

pub struct SybilClusterDetector;

impl Detector for SybilClusterDetector {
    fn name(&self) -> &'static str {
        "sybil-clusters"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        // Per (market, side) trade index lists, already chain-ordered.
        let mut lanes: BTreeMap<(alloy::primitives::U256, Side), Vec<usize>> = BTreeMap::new();
        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                return Vec::new();
            }
            lanes.entry((t.token_id, t.side)).or_default().push(processed);
        }

        let mut out = Vec::new();
        let mut emitted: BTreeSet<String> = BTreeSet::new();

        for ((token, side), idxs) in &lanes {
            if idxs.len() < MIN_CLUSTER {
                continue;
            }
            // Maximal sliding windows via two pointers over timestamps;
            // a window ending where its predecessor ended is a subset and
            // is skipped.
            let mut hi = 0usize;
            let mut prev_hi = usize::MAX;
            for lo in 0..idxs.len() {
                let start_ts = snapshot.trades[idxs[lo]].timestamp;
                if hi < lo {
                    hi = lo;
                }
                while hi + 1 < idxs.len()
                    && snapshot.trades[idxs[hi + 1]].timestamp - start_ts <= WINDOW_SECS
                {
                    hi += 1;
                }
                if lo > 0 && hi == prev_hi {
                    continue;
                }
                prev_hi = hi;
                let window = &idxs[lo..=hi];
                if let Some(evidence) = evaluate_window(snapshot, *token, *side, window) {
                    if emitted.insert(evidence.id.clone()) {
                        out.push(evidence);
                    }
                }
            }
        }
        out
    }
}

fn evaluate_window(
    snapshot: &Snapshot,
    token: alloy::primitives::U256,
    side: Side,
    window: &[usize],
) -> Option<Evidence> {
    if window.len() < MIN_CLUSTER {
        return None;
    }

    // One member per trading wallet (the taker); member size is the mean of
    // its fills inside the window.
    let mut member_sizes: BTreeMap<Address, (Decimal, u32)> = BTreeMap::new();
    let mut volume = Decimal::ZERO;
    let mut tx_hashes = BTreeSet::new();
    let mut first_ts = i64::MAX;
    for &i in window {
        let t = &snapshot.trades[i];
        let e = member_sizes.entry(t.taker).or_insert((Decimal::ZERO, 0));
        e.0 += t.size;
        e.1 += 1;
        volume += t.volume;
        tx_hashes.insert(t.tx_hash);
        first_ts = first_ts.min(t.timestamp);
    }
    if member_sizes.len() < MIN_CLUSTER {
        return None;
    }

    let sizes: Vec<f64> = member_sizes
        .values()
        .map(|(sum, n)| (*sum / Decimal::from(*n)).to_f64().unwrap_or(0.0))
        .collect();
    let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let similar = sizes
        .iter()
        .filter(|s| ((*s - mean) / mean).abs() <= SIZE_TOLERANCE)
        .count();
    if (similar as f64) / (sizes.len() as f64) < MIN_SIMILAR_FRACTION {
        return None;
    }

    let cluster_size = member_sizes.len();
    let confidence = (0.6 + 0.1 * (cluster_size as f64 - MIN_CLUSTER as f64)).min(0.9);

    let addresses: Vec<Address> = member_sizes.keys().copied().collect();
    let id_parts: Vec<String> = std::iter::once(token.to_string())
        .chain(std::iter::once(side.as_str().to_string()))
        .chain(addresses.iter().map(|a| a.to_string()))
        .collect();
    let id_refs: Vec<&str> = id_parts.iter().map(|s| s.as_str()).collect();

    Some(Evidence {
        id: evidence_id("SYBIL", &id_refs),
        kind: EvidenceKind::SybilCluster,
        confidence,
        timestamp: first_ts,
        addresses,
        tx_hashes: tx_hashes.into_iter().collect(),
        token_id: Some(token),
        volume,
        details: serde_json::json!({
            "side": side.as_str(),
            "cluster_size": cluster_size,
            "trade_count": window.len(),
            "mean_size": mean,
            "window_seconds": WINDOW_SECS,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};

    #[test]
    fn three_wallets_same_size_within_ten_seconds_fire() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(9), addr(1), 7, Side::Buy, "0.5000", "100.000000"),
                trade(10, 1, 1_003, addr(9), addr(2), 7, Side::Buy, "0.5000", "105.000000"),
                trade(10, 2, 1_008, addr(9), addr(3), 7, Side::Buy, "0.5000", "95.000000"),
            ],
            vec![],
        );
        let found = SybilClusterDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        assert_eq!(e.kind, EvidenceKind::SybilCluster);
        // Cluster of exactly 3: floor confidence.
        assert!((e.confidence - 0.6).abs() < 1e-9);
        assert_eq!(e.addresses.len(), 3);
    }

    #[test]
    fn spread_out_trades_do_not_cluster() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(9), addr(1), 7, Side::Buy, "0.5000", "100.000000"),
                trade(11, 0, 1_020, addr(9), addr(2), 7, Side::Buy, "0.5000", "100.000000"),
                trade(12, 0, 1_040, addr(9), addr(3), 7, Side::Buy, "0.5000", "100.000000"),
            ],
            vec![],
        );
        assert!(SybilClusterDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn mixed_sides_split_into_lanes() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(9), addr(1), 7, Side::Buy, "0.5000", "100.000000"),
                trade(10, 1, 1_002, addr(9), addr(2), 7, Side::Sell, "0.5000", "100.000000"),
                trade(10, 2, 1_004, addr(9), addr(3), 7, Side::Buy, "0.5000", "100.000000"),
            ],
            vec![],
        );
        // Two buys and one sell: neither lane reaches three wallets.
        assert!(SybilClusterDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn dissimilar_sizes_do_not_cluster() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(9), addr(1), 7, Side::Buy, "0.5000", "10.000000"),
                trade(10, 1, 1_002, addr(9), addr(2), 7, Side::Buy, "0.5000", "500.000000"),
                trade(10, 2, 1_004, addr(9), addr(3), 7, Side::Buy, "0.5000", "2000.000000"),
            ],
            vec![],
        );
        assert!(SybilClusterDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn larger_clusters_raise_confidence() {
        let trades: Vec<_> = (0..5)
            .map(|i| {
                trade(
                    10,
                    i,
                    1_000 + i as i64,
                    addr(9),
                    addr(1 + i as u8),
                    7,
                    Side::Buy,
                    "0.5000",
                    "100.000000",
                )
            })
            .collect();
        let found = SybilClusterDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        // Only the maximal 5-member window is emitted.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addresses.len(), 5);
        assert!((found[0].confidence - 0.8).abs() < 1e-9);
    }
}
