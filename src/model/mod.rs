//! Core data model: trades, position events, evidence, alerts, and the
//! per-market health rollup.
//!
//! All monetary quantities use `rust_decimal::Decimal` — price at 4 decimal
//! places, size and volume at 6 (USDC scale). Chain identifiers keep their
//! alloy types; `token_id` serializes as a decimal string to match the
//! venue's API convention.

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialize a `U256` token id as a decimal string (venue convention),
/// accepting either decimal or 0x-hex on the way in.
pub mod u256_dec {
    use alloy::primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(d)?;
        U256::from_str(&raw).map_err(Error::custom)
    }
}

/// Same as [`u256_dec`] but for `Option<U256>`.
pub mod u256_dec_opt {
    use alloy::primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &Option<U256>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_some(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| U256::from_str(&r).map_err(Error::custom))
            .transpose()
    }
}

/// Direction of a fill, from the taker's perspective on the outcome token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(()),
        }
    }
}

/// Chain-order key: trades sort by (block, log index), ties broken by tx hash.
pub type OrdKey = (u64, u64, B256);

/// One decoded `OrderFilled` occurrence. Identity is `(tx_hash, log_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub exchange: Address,
    pub order_hash: B256,
    pub maker: Address,
    pub taker: Address,
    #[serde(with = "u256_dec")]
    pub token_id: U256,
    pub side: Side,
    /// Collateral per share, scale 4, half-even rounded.
    pub price: Decimal,
    /// Outcome-token amount, scale 6.
    pub size: Decimal,
    /// `round(size * price, 6)`.
    pub volume: Decimal,
    pub fee: u128,
    /// Effective gas price in wei; 0 when unknown.
    pub gas_price: u128,
    pub is_wash: bool,
    pub wash_kind: Option<EvidenceKind>,
    pub wash_confidence: f64,
}

impl Trade {
    pub fn key(&self) -> (B256, u64) {
        (self.tx_hash, self.log_index)
    }

    pub fn ord_key(&self) -> OrdKey {
        (self.block_number, self.log_index, self.tx_hash)
    }
}

/// Whether a position event minted or burned a YES+NO pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionEventKind {
    Split,
    Merge,
}

/// A decoded `PositionSplit` / `PositionsMerge` occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: i64,
    pub kind: PositionEventKind,
    pub stakeholder: Address,
    pub collateral: Address,
    pub parent_collection_id: B256,
    pub condition_id: B256,
    pub partition: Vec<U256>,
    /// Collateral amount, 6-decimal fixed point.
    pub amount: u128,
}

impl PositionEvent {
    pub fn ord_key(&self) -> OrdKey {
        (self.block_number, self.log_index, self.tx_hash)
    }
}

/// The nine enumerated detection finding kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceKind {
    SelfTrade,
    CoordinatedSelfTrade,
    CircularTrade,
    AtomicWash,
    SybilCluster,
    NewWalletInsider,
    VolumeSpike,
    HighWinRate,
    GasAnomaly,
}

impl EvidenceKind {
    pub const ALL: [EvidenceKind; 9] = [
        EvidenceKind::SelfTrade,
        EvidenceKind::CoordinatedSelfTrade,
        EvidenceKind::CircularTrade,
        EvidenceKind::AtomicWash,
        EvidenceKind::SybilCluster,
        EvidenceKind::NewWalletInsider,
        EvidenceKind::VolumeSpike,
        EvidenceKind::HighWinRate,
        EvidenceKind::GasAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::SelfTrade => "SELF_TRADE",
            EvidenceKind::CoordinatedSelfTrade => "COORDINATED_SELF_TRADE",
            EvidenceKind::CircularTrade => "CIRCULAR_TRADE",
            EvidenceKind::AtomicWash => "ATOMIC_WASH",
            EvidenceKind::SybilCluster => "SYBIL_CLUSTER",
            EvidenceKind::NewWalletInsider => "NEW_WALLET_INSIDER",
            EvidenceKind::VolumeSpike => "VOLUME_SPIKE",
            EvidenceKind::HighWinRate => "HIGH_WIN_RATE",
            EvidenceKind::GasAnomaly => "GAS_ANOMALY",
        }
    }

    /// Health-score base penalty weight.
    pub fn base_weight(&self) -> f64 {
        match self {
            EvidenceKind::SelfTrade | EvidenceKind::CoordinatedSelfTrade => 15.0,
            EvidenceKind::CircularTrade => 12.0,
            EvidenceKind::AtomicWash => 12.0,
            EvidenceKind::SybilCluster => 10.0,
            EvidenceKind::NewWalletInsider => 8.0,
            EvidenceKind::HighWinRate => 6.0,
            EvidenceKind::VolumeSpike => 5.0,
            EvidenceKind::GasAnomaly => 3.0,
        }
    }

    /// Minimum confidence at which evidence of this kind becomes an alert.
    pub fn alert_threshold(&self) -> f64 {
        match self {
            EvidenceKind::SelfTrade => 0.95,
            EvidenceKind::CoordinatedSelfTrade => 0.85,
            EvidenceKind::AtomicWash => 0.90,
            EvidenceKind::CircularTrade => 0.60,
            EvidenceKind::SybilCluster => 0.60,
            EvidenceKind::NewWalletInsider => 0.80,
            EvidenceKind::HighWinRate => 0.50,
            EvidenceKind::VolumeSpike => 0.35,
            EvidenceKind::GasAnomaly => 0.50,
        }
    }

    pub fn base_severity(&self) -> Severity {
        match self {
            EvidenceKind::AtomicWash => Severity::Critical,
            EvidenceKind::SelfTrade
            | EvidenceKind::CoordinatedSelfTrade
            | EvidenceKind::NewWalletInsider => Severity::High,
            EvidenceKind::CircularTrade
            | EvidenceKind::SybilCluster
            | EvidenceKind::HighWinRate => Severity::Medium,
            EvidenceKind::VolumeSpike | EvidenceKind::GasAnomaly => Severity::Low,
        }
    }

    /// Kinds whose single-trade evidence marks the trade itself as wash.
    pub fn marks_trades_wash(&self) -> bool {
        matches!(
            self,
            EvidenceKind::SelfTrade
                | EvidenceKind::CoordinatedSelfTrade
                | EvidenceKind::CircularTrade
                | EvidenceKind::AtomicWash
        )
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvidenceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvidenceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// One detection finding. Never mutated after creation; the id is derived
/// from content so overlapping re-scans are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub kind: EvidenceKind,
    /// In [0, 1].
    pub confidence: f64,
    pub timestamp: i64,
    /// Sorted, deduplicated.
    pub addresses: Vec<Address>,
    /// Sorted, deduplicated.
    pub tx_hashes: Vec<B256>,
    #[serde(with = "u256_dec_opt")]
    pub token_id: Option<U256>,
    pub volume: Decimal,
    /// Kind-specific key/value payload (sorted-key object).
    pub details: serde_json::Value,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn escalate(self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            _ => Severity::Critical,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification-worthy evidence item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub timestamp: i64,
    pub kind: EvidenceKind,
    pub severity: Severity,
    pub tx_hash: Option<B256>,
    #[serde(with = "u256_dec_opt")]
    pub token_id: Option<U256>,
    pub trade_count: u32,
    pub volume: Decimal,
    pub confidence: f64,
    pub addresses: Vec<Address>,
    /// Back-reference to the originating evidence.
    pub evidence_id: String,
    pub acknowledged: bool,
}

impl Alert {
    /// Promote evidence to an alert when it clears the per-kind threshold.
    pub fn from_evidence(e: &Evidence) -> Option<Alert> {
        if e.confidence < e.kind.alert_threshold() {
            return None;
        }
        let mut severity = e.kind.base_severity();
        if e.confidence >= 0.97 {
            severity = severity.escalate();
        }
        Some(Alert {
            alert_id: format!("AL_{}", e.id),
            timestamp: e.timestamp,
            kind: e.kind,
            severity,
            tx_hash: e.tx_hashes.first().copied(),
            token_id: e.token_id,
            trade_count: e.tx_hashes.len().max(1) as u32,
            volume: e.volume,
            confidence: e.confidence,
            addresses: e.addresses.clone(),
            evidence_id: e.id.clone(),
            acknowledged: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> RiskLevel {
        if score >= 80.0 {
            RiskLevel::Low
        } else if score >= 60.0 {
            RiskLevel::Medium
        } else if score >= 40.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// A suspicious address ranked inside a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousAddress {
    pub address: Address,
    pub risk_score: f64,
    pub evidence_count: u64,
}

/// Per-market rollup, recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHealthReport {
    #[serde(with = "u256_dec")]
    pub token_id: U256,
    pub market_name: Option<String>,
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub total_trades: u64,
    pub total_volume: Decimal,
    pub evidence_counts: BTreeMap<String, u64>,
    pub top_suspicious_addresses: Vec<SuspiciousAddress>,
}

/// System-wide counters surfaced via `/api/system/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_trades: u64,
    pub total_volume: Decimal,
    pub wash_trade_count: u64,
    pub wash_volume: Decimal,
    pub total_alerts: u64,
    pub total_evidence: u64,
    pub unique_markets: u64,
    pub unique_traders: u64,
    pub decoded_events: u64,
    pub malformed_events: u64,
    pub dropped_subscriber_events: u64,
    pub last_block: u64,
    pub is_streaming: bool,
}
