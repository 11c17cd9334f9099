//! Self-trade detection: direct (maker == taker) and coordinated groups of
//! identically shaped fills inside the same minute.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::U256;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind};
use crate::store::Snapshot;

pub struct SelfTradeDetector;

impl Detector for SelfTradeDetector {
    fn name(&self) -> &'static str {
        "self-trades"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        let mut out = Vec::new();

        // Direct: one wallet on both sides of the fill.
        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                return out;
            }
            if t.maker != t.taker {
                continue;
            }
            let id = evidence_id(
                "SELF",
                &[&t.tx_hash.to_string(), &t.log_index.to_string()],
            );
            out.push(Evidence {
                id,
                kind: EvidenceKind::SelfTrade,
                confidence: 1.0,
                timestamp: t.timestamp,
                addresses: vec![t.maker],
                tx_hashes: vec![t.tx_hash],
                token_id: Some(t.token_id),
                volume: t.volume,
                details: serde_json::json!({
                    "pattern": "direct_self_trade",
                    "price": t.price.to_string(),
                    "size": t.size.to_string(),
                    "log_index": t.log_index,
                }),
            });
        }

        // Coordinated: same market, size (6 dp), price (4 dp), and minute
        // bucket, with an address reused across distinct fills.
        let mut groups: BTreeMap<(U256, String, String, i64), Vec<usize>> = BTreeMap::new();
        for (i, t) in snapshot.trades.iter().enumerate() {
            let key = (
                t.token_id,
                t.size.to_string(),
                t.price.to_string(),
                t.timestamp.div_euclid(60),
            );
            groups.entry(key).or_default().push(i);
        }

        for ((token, size, price, bucket), idxs) in groups {
            if idxs.len() < 2 {
                continue;
            }
            // Overlap: some address participates in at least two of the
            // group's fills.
            let mut seen = BTreeMap::new();
            for &i in &idxs {
                let t = &snapshot.trades[i];
                for a in BTreeSet::from([t.maker, t.taker]) {
                    *seen.entry(a).or_insert(0u32) += 1;
                }
            }
            if !seen.values().any(|&n| n >= 2) {
                continue;
            }

            let mut addresses = BTreeSet::new();
            let mut tx_hashes = BTreeSet::new();
            let mut volume = Decimal::ZERO;
            let mut first_ts = i64::MAX;
            for &i in &idxs {
                let t = &snapshot.trades[i];
                addresses.insert(t.maker);
                addresses.insert(t.taker);
                tx_hashes.insert(t.tx_hash);
                volume += t.volume;
                first_ts = first_ts.min(t.timestamp);
            }

            let id = evidence_id(
                "COORD",
                &[&token.to_string(), &size, &price, &bucket.to_string()],
            );
            out.push(Evidence {
                id,
                kind: EvidenceKind::CoordinatedSelfTrade,
                confidence: 0.9,
                timestamp: first_ts,
                addresses: addresses.into_iter().collect(),
                tx_hashes: tx_hashes.into_iter().collect(),
                token_id: Some(token),
                volume,
                details: serde_json::json!({
                    "pattern": "coordinated_self_trade",
                    "trade_count": idxs.len(),
                    "size": size,
                    "price": price,
                    "minute_bucket": bucket,
                }),
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};
    use crate::model::Side;

    #[test]
    fn direct_self_trade_fires_with_full_confidence() {
        let w = addr(1);
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, w, w, 7, Side::Buy, "0.5000", "100.000000"),
                trade(11, 0, 1_002, w, w, 7, Side::Buy, "0.5000", "200.000000"),
            ],
            vec![],
        );
        let found = SelfTradeDetector.scan(&snap, &ScanCtx::new());
        let direct: Vec<_> = found
            .iter()
            .filter(|e| e.kind == EvidenceKind::SelfTrade)
            .collect();
        assert_eq!(direct.len(), 2);
        assert!(direct.iter().all(|e| e.confidence == 1.0));
        assert!(direct.iter().all(|e| e.addresses == vec![w]));
    }

    #[test]
    fn arms_length_trades_do_not_fire_direct() {
        let snap = snapshot(
            vec![trade(
                10,
                0,
                1_000,
                addr(1),
                addr(2),
                7,
                Side::Buy,
                "0.5000",
                "100.000000",
            )],
            vec![],
        );
        let found = SelfTradeDetector.scan(&snap, &ScanCtx::new());
        assert!(found.is_empty());
    }

    #[test]
    fn coordinated_group_requires_address_overlap() {
        // Two identically shaped fills in the same minute sharing wallet B.
        let a = addr(1);
        let b = addr(2);
        let c = addr(3);
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, a, b, 7, Side::Buy, "0.4000", "50.000000"),
                trade(10, 1, 1_030, b, c, 7, Side::Buy, "0.4000", "50.000000"),
            ],
            vec![],
        );
        let found = SelfTradeDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        assert_eq!(e.kind, EvidenceKind::CoordinatedSelfTrade);
        assert_eq!(e.confidence, 0.9);
        assert_eq!(e.addresses.len(), 3);
        assert_eq!(e.tx_hashes.len(), 2);
    }

    #[test]
    fn identical_shape_without_overlap_stays_quiet() {
        let snap = snapshot(
            vec![
                trade(10, 0, 1_000, addr(1), addr(2), 7, Side::Buy, "0.4000", "50.000000"),
                trade(10, 1, 1_030, addr(3), addr(4), 7, Side::Buy, "0.4000", "50.000000"),
            ],
            vec![],
        );
        assert!(SelfTradeDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn deterministic_output_for_fixed_snapshot() {
        let w = addr(1);
        let snap = snapshot(
            vec![trade(10, 0, 1_000, w, w, 7, Side::Buy, "0.5000", "100.000000")],
            vec![],
        );
        let a = serde_json::to_string(&SelfTradeDetector.scan(&snap, &ScanCtx::new())).unwrap();
        let b = serde_json::to_string(&SelfTradeDetector.scan(&snap, &ScanCtx::new())).unwrap();
        assert_eq!(a, b);
    }
}
