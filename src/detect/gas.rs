//! Gas-anomaly (front-running) detection: trades paying more than twice the
//! median gas price of the preceding 256 blocks' trades.

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind};
use crate::store::Snapshot;

/// Look-back span for the gas median, in blocks.
const BLOCK_WINDOW: u64 = 256;
const GAS_MULTIPLIER: f64 = 2.0;

pub struct GasAnomalyDetector;

impl Detector for GasAnomalyDetector {
    fn name(&self) -> &'static str {
        "gas-anomaly"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        // Trades arrive chain-ordered; maintain the preceding-window slice
        // with two pointers. Trades without a gas observation neither feed
        // the median nor get judged.
        let trades = &snapshot.trades;
        let mut out = Vec::new();
        let mut window_lo = 0usize;

        for (i, t) in trades.iter().enumerate() {
            if ctx.checkpoint(i) {
                return out;
            }
            if t.gas_price == 0 {
                continue;
            }
            let window_start_block = t.block_number.saturating_sub(BLOCK_WINDOW);
            while window_lo < i && trades[window_lo].block_number < window_start_block {
                window_lo += 1;
            }

            let mut window_gas: Vec<u128> = trades[window_lo..i]
                .iter()
                .filter(|w| w.block_number < t.block_number && w.gas_price > 0)
                .map(|w| w.gas_price)
                .collect();
            if window_gas.is_empty() {
                continue;
            }
            window_gas.sort_unstable();
            let median = median_of(&window_gas);
            if median <= 0.0 {
                continue;
            }

            let ratio = t.gas_price as f64 / median;
            if ratio <= GAS_MULTIPLIER {
                continue;
            }

            let confidence = (0.4 + 0.1 * ratio.log2()).min(0.8);
            out.push(Evidence {
                id: evidence_id(
                    "GAS",
                    &[&t.tx_hash.to_string(), &t.log_index.to_string()],
                ),
                kind: EvidenceKind::GasAnomaly,
                confidence,
                timestamp: t.timestamp,
                addresses: vec![t.maker, t.taker],
                tx_hashes: vec![t.tx_hash],
                token_id: Some(t.token_id),
                volume: t.volume,
                details: serde_json::json!({
                    "gas_price_wei": t.gas_price.to_string(),
                    "median_gas_wei": median,
                    "gas_ratio": ratio,
                    "block_number": t.block_number,
                }),
            });
        }
        out
    }
}

fn median_of(sorted: &[u128]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::testutil::{addr, snapshot, trade};
    use crate::model::{Side, Trade};

    fn with_gas(mut t: Trade, gas: u128) -> Trade {
        t.gas_price = gas;
        t
    }

    /// Baseline trades at 30 gwei, one per block.
    fn baseline(n: u64) -> Vec<Trade> {
        (0..n)
            .map(|i| {
                with_gas(
                    trade(
                        1_000 + i,
                        0,
                        1_700_000_000 + i as i64 * 2,
                        addr(1),
                        addr(2),
                        7,
                        Side::Buy,
                        "0.5000",
                        "10.000000",
                    ),
                    30_000_000_000,
                )
            })
            .collect()
    }

    #[test]
    fn overpaying_trade_fires_with_log_confidence() {
        let mut trades = baseline(10);
        // 240 gwei against a 30 gwei median: ratio 8 → 0.4 + 0.1*3 = 0.7.
        trades.push(with_gas(
            trade(
                1_020,
                0,
                1_700_000_100,
                addr(3),
                addr(4),
                7,
                Side::Buy,
                "0.5000",
                "10.000000",
            ),
            240_000_000_000,
        ));
        let found = GasAnomalyDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        assert_eq!(found.len(), 1);
        assert!((found[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(found[0].kind, EvidenceKind::GasAnomaly);
    }

    #[test]
    fn confidence_caps_at_point_eight() {
        let mut trades = baseline(10);
        // Ratio 1024 → 0.4 + 0.1*10 = 1.4 → capped.
        trades.push(with_gas(
            trade(
                1_020,
                0,
                1_700_000_100,
                addr(3),
                addr(4),
                7,
                Side::Buy,
                "0.5000",
                "10.000000",
            ),
            30_000_000_000 * 1024,
        ));
        let found = GasAnomalyDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        assert_eq!(found.len(), 1);
        assert!((found[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn normal_gas_does_not_fire() {
        let mut trades = baseline(10);
        trades.push(with_gas(
            trade(
                1_020,
                0,
                1_700_000_100,
                addr(3),
                addr(4),
                7,
                Side::Buy,
                "0.5000",
                "10.000000",
            ),
            45_000_000_000, // 1.5x median
        ));
        assert!(GasAnomalyDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }

    #[test]
    fn unknown_gas_is_skipped_entirely() {
        let mut trades = baseline(10);
        for t in &mut trades {
            t.gas_price = 0;
        }
        trades.push(with_gas(
            trade(
                1_020,
                0,
                1_700_000_100,
                addr(3),
                addr(4),
                7,
                Side::Buy,
                "0.5000",
                "10.000000",
            ),
            240_000_000_000,
        ));
        // No observable median → nothing to judge against.
        assert!(GasAnomalyDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }

    #[test]
    fn median_ignores_blocks_beyond_the_window() {
        // Ancient cheap trades fall outside the 256-block window; recent
        // median is high so the probe is unremarkable.
        let mut trades: Vec<Trade> = (0..5)
            .map(|i| {
                with_gas(
                    trade(
                        10 + i,
                        0,
                        1_700_000_000 + i as i64,
                        addr(1),
                        addr(2),
                        7,
                        Side::Buy,
                        "0.5000",
                        "10.000000",
                    ),
                    1_000_000_000,
                )
            })
            .collect();
        for i in 0..5u64 {
            trades.push(with_gas(
                trade(
                    1_000 + i,
                    0,
                    1_700_002_000 + i as i64,
                    addr(1),
                    addr(2),
                    7,
                    Side::Buy,
                    "0.5000",
                    "10.000000",
                ),
                100_000_000_000,
            ));
        }
        trades.push(with_gas(
            trade(
                1_010,
                0,
                1_700_002_100,
                addr(3),
                addr(4),
                7,
                Side::Buy,
                "0.5000",
                "10.000000",
            ),
            150_000_000_000,
        ));
        assert!(GasAnomalyDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }
}
