//! Volume-spike detection: 5-minute buckets per market against a rolling
//! one-hour baseline.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{B256, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{evidence_id, Detector, ScanCtx};
use crate::model::{Evidence, EvidenceKind};
use crate::store::Snapshot;

const BUCKET_SECS: i64 = 300;
const BASELINE_SECS: i64 = 3_600;
const BUCKETS_PER_BASELINE: i64 = BASELINE_SECS / BUCKET_SECS;
/// Spike multiple over the rolling mean.
const SPIKE_RATIO: f64 = 10.0;
/// Rolling mean must reach this volume before a spike is meaningful.
const MIN_BASELINE: f64 = 500.0;

struct Bucket {
    volume: Decimal,
    trade_count: u32,
    tx_hashes: BTreeSet<B256>,
}

pub struct VolumeSpikeDetector;

impl Detector for VolumeSpikeDetector {
    fn name(&self) -> &'static str {
        "volume-spikes"
    }

    fn scan(&self, snapshot: &Snapshot, ctx: &ScanCtx) -> Vec<Evidence> {
        // market → bucket start ts → aggregate.
        let mut markets: BTreeMap<U256, BTreeMap<i64, Bucket>> = BTreeMap::new();
        for (processed, t) in snapshot.trades.iter().enumerate() {
            if ctx.checkpoint(processed) {
                return Vec::new();
            }
            let bucket_ts = t.timestamp.div_euclid(BUCKET_SECS) * BUCKET_SECS;
            let bucket = markets
                .entry(t.token_id)
                .or_default()
                .entry(bucket_ts)
                .or_insert_with(|| Bucket {
                    volume: Decimal::ZERO,
                    trade_count: 0,
                    tx_hashes: BTreeSet::new(),
                });
            bucket.volume += t.volume;
            bucket.trade_count += 1;
            bucket.tx_hashes.insert(t.tx_hash);
        }

        let mut out = Vec::new();
        for (token, buckets) in &markets {
            for (&bucket_ts, bucket) in buckets {
                // Mean bucket volume over the preceding hour; empty buckets
                // count as zero.
                let window_start = bucket_ts - BASELINE_SECS;
                let preceding: Decimal = buckets
                    .range(window_start..bucket_ts)
                    .map(|(_, b)| b.volume)
                    .sum();
                let baseline =
                    (preceding / Decimal::from(BUCKETS_PER_BASELINE)).to_f64().unwrap_or(0.0);

                if baseline < MIN_BASELINE {
                    continue;
                }
                let volume = bucket.volume.to_f64().unwrap_or(0.0);
                let ratio = volume / baseline;
                if ratio <= SPIKE_RATIO {
                    continue;
                }

                let confidence = (0.3 + 0.05 * ratio.log10()).min(0.7);
                out.push(Evidence {
                    id: evidence_id(
                        "SPIKE",
                        &[&token.to_string(), &bucket_ts.to_string()],
                    ),
                    kind: EvidenceKind::VolumeSpike,
                    confidence,
                    timestamp: bucket_ts,
                    addresses: Vec::new(),
                    tx_hashes: bucket.tx_hashes.iter().copied().collect(),
                    token_id: Some(*token),
                    volume: bucket.volume,
                    details: serde_json::json!({
                        "bucket_start": bucket_ts,
                        "bucket_volume": bucket.volume.to_string(),
                        "baseline_volume": baseline,
                        "spike_ratio": ratio,
                        "trade_count": bucket.trade_count,
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
    use crate::model::{Side, Trade};

    /// One trade of `volume` dollars at price 1.0 in each 5-minute bucket of
    /// the hour before `spike_ts`.
    fn steady_hour(token: u64, spike_ts: i64, volume_per_bucket: &str) -> Vec<Trade> {
        let mut trades = Vec::new();
        for i in 0..12 {
            let ts = spike_ts - BASELINE_SECS + i * BUCKET_SECS;
            trades.push(trade(
                (1_000 + i) as u64,
                0,
                ts,
                addr(1),
                addr(2),
                token,
                Side::Buy,
                "1.0000",
                volume_per_bucket,
            ));
        }
        trades
    }

    #[test]
    fn twelve_x_spike_fires_with_log_confidence() {
        // Rolling-hour mean $1,000/bucket; current bucket $12,000.
        let spike_ts = 1_700_000_000_i64.div_euclid(BUCKET_SECS) * BUCKET_SECS;
        let mut trades = steady_hour(7, spike_ts, "1000.000000");
        trades.push(trade(
            2_000,
            0,
            spike_ts,
            addr(3),
            addr(4),
            7,
            Side::Buy,
            "1.0000",
            "12000.000000",
        ));

        let found = VolumeSpikeDetector.scan(&snapshot(trades, vec![]), &ScanCtx::new());
        assert_eq!(found.len(), 1);
        let e = &found[0];
        // 0.3 + 0.05 * log10(12) ≈ 0.354.
        assert!((e.confidence - (0.3 + 0.05 * 12.0_f64.log10())).abs() < 1e-9);
        assert!((e.confidence - 0.354).abs() < 0.001);
        assert_eq!(e.token_id, Some(U256::from(7u64)));
    }

    #[test]
    fn thin_baseline_never_fires() {
        // $10/bucket baseline is under MIN_BASELINE; even a 100x bucket
        // stays quiet.
        let spike_ts = 1_700_000_000_i64.div_euclid(BUCKET_SECS) * BUCKET_SECS;
        let mut trades = steady_hour(7, spike_ts, "10.000000");
        trades.push(trade(
            2_000,
            0,
            spike_ts,
            addr(3),
            addr(4),
            7,
            Side::Buy,
            "1.0000",
            "1000.000000",
        ));
        assert!(VolumeSpikeDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }

    #[test]
    fn steady_volume_never_fires() {
        let spike_ts = 1_700_000_000_i64.div_euclid(BUCKET_SECS) * BUCKET_SECS;
        let mut trades = steady_hour(7, spike_ts, "1000.000000");
        trades.push(trade(
            2_000,
            0,
            spike_ts,
            addr(3),
            addr(4),
            7,
            Side::Buy,
            "1.0000",
            "2000.000000",
        ));
        assert!(VolumeSpikeDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }

    #[test]
    fn markets_are_independent() {
        let spike_ts = 1_700_000_000_i64.div_euclid(BUCKET_SECS) * BUCKET_SECS;
        let mut trades = steady_hour(7, spike_ts, "1000.000000");
        // The spike lands in a different market with no baseline.
        trades.push(trade(
            2_000,
            0,
            spike_ts,
            addr(3),
            addr(4),
            8,
            Side::Buy,
            "1.0000",
            "50000.000000",
        ));
        assert!(VolumeSpikeDetector
            .scan(&snapshot(trades, vec![]), &ScanCtx::new())
            .is_empty());
    }
}
