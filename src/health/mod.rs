//! Per-market health rollup: composes stored evidence into a 0–100 score
//! with diminishing per-type penalties, a risk band, and a suspicious-
//! address ranking.

use alloy::primitives::{Address, U256};
use std::collections::BTreeMap;

use crate::model::{
    Evidence, MarketHealthReport, RiskLevel, SuspiciousAddress,
};
use crate::resolver::MarketResolver;
use crate::store::{EvidenceStore, MarketAggregate};

/// Markets with fewer trades than this are not scored.
pub const MIN_TRADES: u64 = 20;

/// Number of ranked suspicious addresses returned per market.
const TOP_ADDRESSES: usize = 50;

/// Penalty applied by the n-th occurrence (1-based) of one evidence kind.
fn penalty(e: &Evidence, occurrence: u64) -> f64 {
    e.kind.base_weight() * e.confidence / (occurrence as f64).sqrt()
}

/// Score one market's evidence list. Returns the clamped score and the
/// per-address contribution map used for the suspicious ranking.
fn score_evidence(evidence: &[Evidence]) -> (f64, BTreeMap<Address, (f64, u64)>) {
    // Stable occurrence order: evidence sorted by (timestamp, id).
    let mut ordered: Vec<&Evidence> = evidence.iter().collect();
    ordered.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

    let mut occurrences: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut contributions: BTreeMap<Address, (f64, u64)> = BTreeMap::new();
    let mut total_penalty = 0.0;

    for e in ordered {
        let n = occurrences.entry(e.kind.as_str()).or_insert(0);
        *n += 1;
        let p = penalty(e, *n);
        total_penalty += p;
        for addr in &e.addresses {
            let entry = contributions.entry(*addr).or_insert((0.0, 0));
            entry.0 += p;
            entry.1 += 1;
        }
    }

    ((100.0 - total_penalty).clamp(0.0, 100.0), contributions)
}

/// Build the health report for one market from its trades and evidence.
pub fn report_for_market(
    aggregate: &MarketAggregate,
    evidence: &[Evidence],
    market_name: Option<String>,
) -> MarketHealthReport {
    let (score, contributions) = score_evidence(evidence);

    let mut evidence_counts: BTreeMap<String, u64> = BTreeMap::new();
    for e in evidence {
        *evidence_counts.entry(e.kind.as_str().to_string()).or_insert(0) += 1;
    }

    let mut ranked: Vec<SuspiciousAddress> = contributions
        .into_iter()
        .map(|(address, (risk_score, evidence_count))| SuspiciousAddress {
            address,
            risk_score,
            evidence_count,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.risk_score
            .partial_cmp(&a.risk_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.address.cmp(&b.address))
    });
    ranked.truncate(TOP_ADDRESSES);

    MarketHealthReport {
        token_id: aggregate.token_id,
        market_name,
        health_score: score,
        risk_level: RiskLevel::from_score(score),
        total_trades: aggregate.trade_count,
        total_volume: aggregate.volume,
        evidence_counts,
        top_suspicious_addresses: ranked,
    }
}

/// Reports for every market meeting the trade floor, riskiest first.
pub fn all_reports(
    store: &EvidenceStore,
    resolver: Option<&MarketResolver>,
    min_trades: u64,
) -> Vec<MarketHealthReport> {
    let evidence = store.evidence_all();
    let mut by_market: BTreeMap<U256, Vec<Evidence>> = BTreeMap::new();
    for e in evidence {
        if let Some(token) = e.token_id {
            by_market.entry(token).or_default().push(e);
        }
    }

    let empty: Vec<Evidence> = Vec::new();
    let mut reports: Vec<MarketHealthReport> = store
        .market_aggregates()
        .iter()
        .filter(|agg| agg.trade_count >= min_trades)
        .map(|agg| {
            let market_evidence = by_market.get(&agg.token_id).unwrap_or(&empty);
            let name = resolver.map(|r| r.display_name(agg.token_id));
            report_for_market(agg, market_evidence, name)
        })
        .collect();

    reports.sort_by(|a, b| {
        a.health_score
            .partial_cmp(&b.health_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.token_id.cmp(&b.token_id))
    });
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvidenceKind;
    use rust_decimal::Decimal;

    fn evidence(kind: EvidenceKind, confidence: f64, ts: i64, id: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            kind,
            confidence,
            timestamp: ts,
            addresses: vec![Address::from([1u8; 20])],
            tx_hashes: vec![],
            token_id: Some(U256::from(7u64)),
            volume: Decimal::ZERO,
            details: serde_json::json!({}),
        }
    }

    fn aggregate() -> MarketAggregate {
        MarketAggregate {
            token_id: U256::from(7u64),
            trade_count: 50,
            volume: Decimal::from(1_000),
            wash_count: 2,
            wash_volume: Decimal::from(100),
            unique_traders: 10,
        }
    }

    #[test]
    fn two_self_trades_apply_diminishing_penalty() {
        let ev = vec![
            evidence(EvidenceKind::SelfTrade, 1.0, 1_000, "S1"),
            evidence(EvidenceKind::SelfTrade, 1.0, 1_001, "S2"),
        ];
        let report = report_for_market(&aggregate(), &ev, None);
        // 100 - (15 + 15/√2) ≈ 74.39.
        let expected = 100.0 - (15.0 + 15.0 / 2.0_f64.sqrt());
        assert!((report.health_score - expected).abs() < 1e-9);
        assert!((100.0 - report.health_score - 25.6).abs() < 0.1);
        assert_eq!(report.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn clean_market_scores_hundred() {
        let report = report_for_market(&aggregate(), &[], None);
        assert_eq!(report.health_score, 100.0);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(report.top_suspicious_addresses.is_empty());
    }

    #[test]
    fn adding_evidence_never_increases_score() {
        let mut ev = Vec::new();
        let mut last = 100.0;
        for i in 0..30 {
            ev.push(evidence(
                EvidenceKind::GasAnomaly,
                0.5,
                1_000 + i,
                &format!("G{i}"),
            ));
            let score = report_for_market(&aggregate(), &ev, None).health_score;
            assert!(score <= last);
            last = score;
        }
    }

    #[test]
    fn score_clamps_at_zero() {
        let ev: Vec<Evidence> = (0..40)
            .map(|i| evidence(EvidenceKind::SelfTrade, 1.0, 1_000 + i, &format!("S{i}")))
            .collect();
        let report = report_for_market(&aggregate(), &ev, None);
        assert_eq!(report.health_score, 0.0);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn suspicious_addresses_accumulate_contributions() {
        let ev = vec![
            evidence(EvidenceKind::SelfTrade, 1.0, 1_000, "S1"),
            evidence(EvidenceKind::AtomicWash, 0.98, 1_001, "A1"),
        ];
        let report = report_for_market(&aggregate(), &ev, None);
        assert_eq!(report.top_suspicious_addresses.len(), 1);
        let top = &report.top_suspicious_addresses[0];
        assert_eq!(top.evidence_count, 2);
        assert!((top.risk_score - (15.0 + 12.0 * 0.98)).abs() < 1e-9);
        assert_eq!(report.evidence_counts["SELF_TRADE"], 1);
        assert_eq!(report.evidence_counts["ATOMIC_WASH"], 1);
    }

    #[test]
    fn occurrence_order_is_timestamp_stable() {
        // Same evidence set in different vec orders produces one score.
        let a = vec![
            evidence(EvidenceKind::SelfTrade, 1.0, 1_000, "S1"),
            evidence(EvidenceKind::SelfTrade, 0.5, 1_001, "S2"),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        let ra = report_for_market(&aggregate(), &a, None);
        let rb = report_for_market(&aggregate(), &b, None);
        assert_eq!(ra.health_score, rb.health_score);
    }
}
