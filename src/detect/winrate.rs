//! High-win-rate detection.
//!
//! A trade "wins" when the market's subsequently observed price moves at
//! least 5% in the trade's favour within 24 hours (exit price = the last
//! trade price seen in that window). Wallets with ten or more judged trades
//! and a win rate above 90% are flagged.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind, Side};
use crate::store::Snapshot;

const EXIT_WINDOW_SECS: i64 = 24 * 3_600;
const FAVOURABLE_MOVE: f64 = 0.05;
const MIN_JUDGED_TRADES: usize = 10;
const WIN_RATE_THRESHOLD: f64 = 0.9;

#[derive(Default)]
struct WalletTally {
    wins: usize,
    judged: usize,
    total: usize,
    tx_hashes: Vec<B256>,
    last_ts: i64,
}

pub struct HighWinRateDetector;

impl Detector for HighWinRateDetector {
    fn name(&self) -> &'static str {
        "high-winrate"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        // Per-market price series in chain order.
        let mut series: BTreeMap<U256, Vec<(i64, Decimal)>> = BTreeMap::new();
        for t in &snapshot.trades {
            series.entry(t.token_id).or_default().push((t.timestamp, t.price));
        }

        let mut tallies: BTreeMap<Address, WalletTally> = BTreeMap::new();
        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                break;
            }
            let outcome = judge(&series[&t.token_id], t.timestamp, t.price, t.side);
            for wallet in [t.maker, t.taker] {
                let tally = tallies.entry(wallet).or_default();
                tally.total += 1;
                tally.tx_hashes.push(t.tx_hash);
                tally.last_ts = tally.last_ts.max(t.timestamp);
                if let Some(won) = outcome {
                    tally.judged += 1;
                    if won {
                        tally.wins += 1;
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (wallet, tally) in tallies {
            if tally.judged < MIN_JUDGED_TRADES {
                continue;
            }
            let win_rate = tally.wins as f64 / tally.judged as f64;
            if win_rate <= WIN_RATE_THRESHOLD {
                continue;
            }
            let confidence = (0.5 + 0.5 * (win_rate - 0.9) / 0.1).clamp(0.5, 1.0);

            let mut tx_hashes = tally.tx_hashes;
            tx_hashes.sort_unstable();
            tx_hashes.dedup();

            out.push(Evidence {
                id: evidence_id(
                    "WINRATE",
                    &[
                        &wallet.to_string(),
                        &tally.wins.to_string(),
                        &tally.judged.to_string(),
                    ],
                ),
                kind: EvidenceKind::HighWinRate,
                confidence,
                timestamp: tally.last_ts,
                addresses: vec![wallet],
                tx_hashes,
                token_id: None,
                volume: Decimal::ZERO,
                details: serde_json::json!({
                    "win_rate": win_rate,
                    "wins": tally.wins,
                    "judged_trades": tally.judged,
                    "total_trades": tally.total,
                }),
            });
        }
        out
    }
}

/// Judge one trade against the market's last observed price within the exit
/// window. `None` when no later observation exists.
fn judge(series: &[(i64, Decimal)], entry_ts: i64, entry_price: Decimal, side: Side) -> Option<bool> {
    let deadline = entry_ts + EXIT_WINDOW_SECS;
    let exit_price = series
        .iter()
        .filter(|(ts, _)| *ts > entry_ts && *ts <= deadline)
        .map(|(_, p)| *p)
        .last()?;

    let entry = entry_price.to_f64()?;
    let exit = exit_price.to_f64()?;
    if entry <= 0.0 {
        return None;
    }
    let change = (exit - entry) / entry;
    Some(match side {
        Side::Buy => change >= FAVOURABLE_MOVE,
        Side::Sell => change <= -FAVOURABLE_MOVE,
    })
}
