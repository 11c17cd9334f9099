//! New-wallet insider detection: freshly seen wallets placing outsized bets
//! relative to the market's rolling mean trade size.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind};
use crate::store::Snapshot;

/// Wallets younger than this are "new".
const MAX_ACCOUNT_AGE_SECS: i64 = 24 * 3_600;
/// Trade size multiple over the market mean that trips the detector.
const SIZE_MULTIPLIER: f64 = 5.0;

pub struct NewWalletInsiderDetector;

impl Detector for NewWalletInsiderDetector {
    fn name(&self) -> &'static str {
        "insider"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        let mut out = Vec::new();

        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                return out;
            }
            let Some(mean) = snapshot.market_mean_size.get(&t.token_id) else {
                continue;
            };
            if *mean <= Decimal::ZERO {
                continue;
            }
            let size_ratio = (t.size / mean).to_f64().unwrap_or(0.0);
            if size_ratio <= SIZE_MULTIPLIER {
                continue;
            }

            for wallet in [t.maker, t.taker] {
                // First-seen times span the whole store, not just the
                // detector window.
                let Some(first_seen) = snapshot.first_seen.get(&wallet) else {
                    continue;
                };
                let account_age = t.timestamp - first_seen;
                if account_age < 0 || account_age >= MAX_ACCOUNT_AGE_SECS {
                    continue;
                }

                let confidence = (size_ratio / 10.0).min(1.0);
                out.push(Evidence {
                    id: evidence_id(
                        "INSIDER",
                        &[
                            &t.tx_hash.to_string(),
                            &t.log_index.to_string(),
                            &wallet.to_string(),
                        ],
                    ),
                    kind: EvidenceKind::NewWalletInsider,
                    confidence,
                    timestamp: t.timestamp,
                    addresses: vec![wallet],
                    tx_hashes: vec![t.tx_hash],
                    token_id: Some(t.token_id),
                    volume: t.volume,
                    details: serde_json::json!({
                        "account_age_hours": account_age as f64 / 3600.0,
                        "trade_size": t.size.to_string(),
                        "market_mean_size": mean.to_string(),
                        "size_ratio": size_ratio,
                    }),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};
    use crate::model::Side;

    /// Market background: many small trades from long-lived wallets.
    fn background(n: u64, base_ts: i64) -> Vec<crate::model::Trade> {
        (0..n)
            .map(|i| {
                trade(
                    100 + i,
                    0,
                    base_ts + i as i64,
                    addr(10),
                    addr(11),
                    7,
                    Side::Buy,
                    "0.5000",
                    "10.000000",
                )
            })
            .collect()
    }

    #[test]
    fn fresh_wallet_with_outsized_bet_fires() {
        let base = 1_700_000_000;
        let mut trades = background(20, base);
        // New wallet 0x33.. appears once with a trade far above the mean.
        trades.push(trade(
            200,
            0,
            base + 100,
            addr(10),
            addr(0x33),
            7,
            Side::Buy,
            "0.5000",
            "1000.000000",
        ));

        let found = NewWalletInsiderDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        let hits: Vec<_> = found
            .iter()
            .filter(|e| e.addresses == vec![addr(0x33)])
            .collect();
        assert_eq!(hits.len(), 1);
        let e = hits[0];
        assert_eq!(e.kind, EvidenceKind::NewWalletInsider);
        // mean ≈ (20*10 + 1000)/21 ≈ 57.14 → ratio ≈ 17.5 → capped at 1.0.
        assert!((e.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn old_wallets_do_not_fire() {
        let base = 1_700_000_000;
        let mut trades = background(20, base);
        // Wallet 10/11 have a day of history before the big trade.
        trades.push(trade(
            200,
            0,
            base + MAX_ACCOUNT_AGE_SECS + 10,
            addr(10),
            addr(11),
            7,
            Side::Buy,
            "0.5000",
            "1000.000000",
        ));
        let found = NewWalletInsiderDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        assert!(found.is_empty());
    }

    #[test]
    fn normal_sized_trades_from_new_wallets_do_not_fire() {
        let base = 1_700_000_000;
        let mut trades = background(20, base);
        trades.push(trade(
            200,
            0,
            base + 100,
            addr(10),
            addr(0x33),
            7,
            Side::Buy,
            "0.5000",
            "12.000000",
        ));
        let found = NewWalletInsiderDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        assert!(found.is_empty());
    }

    #[test]
    fn confidence_scales_with_size_ratio() {
        let base = 1_700_000_000;
        let mut trades = background(99, base);
        trades.push(trade(
            200,
            0,
            base + 100,
            addr(10),
            addr(0x33),
            7,
            Side::Buy,
            "0.5000",
            "80.000000",
        ));
        let found = NewWalletInsiderDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        let hits: Vec<_> = found
            .iter()
            .filter(|e| e.addresses == vec![addr(0x33)])
            .collect();
        assert_eq!(hits.len(), 1);
        // mean = (99*10 + 80)/100 = 10.7 → ratio ≈ 7.48 → conf ≈ 0.748.
        let expected = (80.0 / 10.7) / 10.0;
        assert!((hits[0].confidence - expected).abs() < 1e-6);
    }
}
