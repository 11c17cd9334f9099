//! Atomic wash detection: split → fill → merge inside one transaction, and
//! the block-level hedge heuristic (near-equal buy and sell volume by one
//! address in one market in one block).

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, B256, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind, PositionEventKind, Side};
use crate::store::Snapshot;

/// Buy/sell volume divergence under which a hedge counts as wash.
const HEDGE_TOLERANCE: f64 = 0.2;

pub struct AtomicWashDetector;

impl Detector for AtomicWashDetector {
    fn name(&self) -> &'static str {
        "atomic-wash"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        let mut out = Vec::new();
        let mut flagged_txs: BTreeSet<B256> = BTreeSet::new();

        // Pattern 1: PositionSplit + OrderFilled + PositionsMerge in one
        // transaction, sharing a collateral account.
        let mut fills_by_tx: BTreeMap<B256, Vec<usize>> = BTreeMap::new();
        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                return out;
            }
            fills_by_tx.entry(t.tx_hash).or_default().push(processed);
        }

        let mut splits_by_tx: BTreeMap<B256, Vec<usize>> = BTreeMap::new();
        let mut merges_by_tx: BTreeMap<B256, Vec<usize>> = BTreeMap::new();
        for (i, ev) in snapshot.position_events.iter().enumerate() {
            match ev.kind {
                PositionEventKind::Split => splits_by_tx.entry(ev.tx_hash).or_default().push(i),
                PositionEventKind::Merge => merges_by_tx.entry(ev.tx_hash).or_default().push(i),
            }
        }

        for (tx_hash, fill_idxs) in &fills_by_tx {
            let (Some(split_idxs), Some(merge_idxs)) =
                (splits_by_tx.get(tx_hash), merges_by_tx.get(tx_hash))
            else {
                continue;
            };

            let stakeholders: BTreeSet<Address> = split_idxs
                .iter()
                .chain(merge_idxs.iter())
                .map(|&i| snapshot.position_events[i].stakeholder)
                .collect();
            let shared_account = fill_idxs.iter().any(|&i| {
                let t = &snapshot.trades[i];
                stakeholders.contains(&t.maker) || stakeholders.contains(&t.taker)
            });
            if !shared_account {
                continue;
            }

            let mut addresses: BTreeSet<Address> = stakeholders;
            let mut volume = Decimal::ZERO;
            let mut tokens: BTreeSet<U256> = BTreeSet::new();
            let mut timestamp = i64::MAX;
            for &i in fill_idxs {
                let t = &snapshot.trades[i];
                addresses.insert(t.maker);
                addresses.insert(t.taker);
                volume += t.volume;
                tokens.insert(t.token_id);
                timestamp = timestamp.min(t.timestamp);
            }

            flagged_txs.insert(*tx_hash);
            out.push(Evidence {
                id: evidence_id("ATOM", &[&tx_hash.to_string()]),
                kind: EvidenceKind::AtomicWash,
                confidence: 0.98,
                timestamp,
                addresses: addresses.into_iter().collect(),
                tx_hashes: vec![*tx_hash],
                token_id: single(&tokens),
                volume,
                details: serde_json::json!({
                    "pattern": "split_trade_merge",
                    "split_count": split_idxs.len(),
                    "fill_count": fill_idxs.len(),
                    "merge_count": merge_idxs.len(),
                }),
            });
        }

        // Pattern 2: near-offsetting buy/sell volume by one address in one
        // (block, market). Confidence interpolates 0.98 → 0.90 as the
        // divergence approaches the tolerance.
        let mut hedges: BTreeMap<(u64, Address, U256), (Decimal, Decimal, Vec<usize>)> =
            BTreeMap::new();
        for (i, t) in snapshot.trades.iter().enumerate() {
            let entry = hedges
                .entry((t.block_number, t.maker, t.token_id))
                .or_insert((Decimal::ZERO, Decimal::ZERO, Vec::new()));
            match t.side {
                Side::Buy => entry.0 += t.volume,
                Side::Sell => entry.1 += t.volume,
            }
            entry.2.push(i);
        }

        for ((block, address, token), (buy, sell, idxs)) in hedges {
            if buy.is_zero() || sell.is_zero() {
                continue;
            }
            let max = buy.max(sell);
            let ratio = ((buy - sell).abs() / max).to_f64().unwrap_or(1.0);
            if ratio >= HEDGE_TOLERANCE {
                continue;
            }
            // Skip hedges already explained by a split-trade-merge tx.
            if idxs
                .iter()
                .all(|&i| flagged_txs.contains(&snapshot.trades[i].tx_hash))
            {
                continue;
            }

            let confidence = 0.98 - 0.08 * (ratio / HEDGE_TOLERANCE);
            let mut tx_hashes = BTreeSet::new();
            let mut timestamp = i64::MAX;
            for &i in &idxs {
                tx_hashes.insert(snapshot.trades[i].tx_hash);
                timestamp = timestamp.min(snapshot.trades[i].timestamp);
            }

            out.push(Evidence {
                id: evidence_id(
                    "ATOMB",
                    &[
                        &block.to_string(),
                        &address.to_string(),
                        &token.to_string(),
                    ],
                ),
                kind: EvidenceKind::AtomicWash,
                confidence,
                timestamp,
                addresses: vec![address],
                tx_hashes: tx_hashes.into_iter().collect(),
                token_id: Some(token),
                volume: buy + sell,
                details: serde_json::json!({
                    "pattern": "buy_sell_hedge",
                    "block_number": block,
                    "buy_volume": buy.to_string(),
                    "sell_volume": sell.to_string(),
                    "divergence": ratio,
                }),
            });
        }

        out
    }
}

fn single(tokens: &BTreeSet<U256>) -> Option<U256> {
    if tokens.len() == 1 {
        tokens.iter().next().copied()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};
    use crate::model::PositionEvent;

    fn position_event(
        tx_hash: B256,
        log_index: u64,
        kind: PositionEventKind,
        stakeholder: Address,
        amount: u128,
    ) -> PositionEvent {
        PositionEvent {
            tx_hash,
            log_index,
            block_number: 10,
            timestamp: 1_000,
            kind,
            stakeholder,
            collateral: addr(0xCC),
            parent_collection_id: B256::ZERO,
            condition_id: B256::ZERO,
            partition: vec![U256::from(1u64), U256::from(2u64)],
            amount,
        }
    }

    #[test]
    fn split_trade_merge_in_one_tx_fires_high() {
        let w = addr(1);
        let counter = addr(2);
        // Two fills (both sides of the book) plus split and merge, all in
        // the same transaction, stakeholder == maker of the fills.
        let mut t1 = trade(10, 1, 1_000, w, counter, 7, Side::Buy, "0.5000", "1.000000");
        let mut t2 = trade(10, 2, 1_000, w, counter, 7, Side::Sell, "0.5000", "1.000000");
        let tx_hash = t1.tx_hash;
        t2.tx_hash = tx_hash;

        let events = vec![
            position_event(tx_hash, 0, PositionEventKind::Split, w, 1_000_000),
            position_event(tx_hash, 3, PositionEventKind::Merge, w, 1_000_000),
        ];
        t1.log_index = 1;
        t2.log_index = 2;

        let snap = snapshot(vec![t1, t2], events);
        let found = AtomicWashDetector.scan(&snap, &ScanCtx::new());
        let atom: Vec<_> = found
            .iter()
            .filter(|e| e.details["pattern"] == "split_trade_merge")
            .collect();
        assert_eq!(atom.len(), 1);
        assert_eq!(atom[0].confidence, 0.98);
        assert_eq!(atom[0].tx_hashes, vec![tx_hash]);
        assert!(atom[0].addresses.contains(&w));
    }

    #[test]
    fn split_and_merge_without_shared_account_is_ignored() {
        let stranger = addr(9);
        let mut t1 = trade(10, 1, 1_000, addr(1), addr(2), 7, Side::Buy, "0.5000", "1.000000");
        let tx_hash = t1.tx_hash;
        t1.log_index = 1;
        let events = vec![
            position_event(tx_hash, 0, PositionEventKind::Split, stranger, 1_000_000),
            position_event(tx_hash, 2, PositionEventKind::Merge, stranger, 1_000_000),
        ];
        let snap = snapshot(vec![t1], events);
        let found = AtomicWashDetector.scan(&snap, &ScanCtx::new());
        assert!(found
            .iter()
            .all(|e| e.details["pattern"] != "split_trade_merge"));
    }

    #[test]
    fn balanced_hedge_fires_with_interpolated_confidence() {
        let w = addr(1);
        // Same block, same maker, same market: buys 100, sells 90.
        // divergence = 10/100 = 0.1 → confidence 0.98 - 0.08*0.5 = 0.94.
        let snap = snapshot(
            vec![
                trade(20, 0, 2_000, w, addr(2), 7, Side::Buy, "1.0000", "100.000000"),
                trade(20, 1, 2_000, w, addr(3), 7, Side::Sell, "1.0000", "90.000000"),
            ],
            vec![],
        );
        let found = AtomicWashDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        assert_eq!(e.details["pattern"], "buy_sell_hedge");
        assert!((e.confidence - 0.94).abs() < 1e-9);
        assert_eq!(e.addresses, vec![w]);
    }

    #[test]
    fn lopsided_volumes_do_not_fire_hedge() {
        let w = addr(1);
        // divergence = 60/100 = 0.6 ≥ 0.2.
        let snap = snapshot(
            vec![
                trade(20, 0, 2_000, w, addr(2), 7, Side::Buy, "1.0000", "100.000000"),
                trade(20, 1, 2_000, w, addr(3), 7, Side::Sell, "1.0000", "40.000000"),
            ],
            vec![],
        );
        assert!(AtomicWashDetector.scan(&snap, &ScanCtx::new()).is_empty());
    }

    #[test]
    fn perfectly_offsetting_hedge_hits_ceiling() {
        let w = addr(1);
        let snap = snapshot(
            vec![
                trade(20, 0, 2_000, w, addr(2), 7, Side::Buy, "0.5000", "100.000000"),
                trade(20, 1, 2_000, w, addr(3), 7, Side::Sell, "0.5000", "100.000000"),
            ],
            vec![],
        );
        let found = AtomicWashDetector.scan(&snap, &ScanCtx::new());
        assert_eq!(found.len(), 1);
        assert!((found[0].confidence - 0.98).abs() < 1e-9);
    }
}
