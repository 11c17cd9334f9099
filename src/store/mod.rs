//! Bounded, indexed, in-memory evidence store with a durable spill.
//!
//! Layout:
//! - trade ring keyed by (block, log_index, tx_hash) so iteration and
//!   eviction follow chain order; capacity 50,000 by default
//! - secondary indices: tx-hash, address, token-id → ordered key sets,
//!   maintained atomically with insert/evict
//! - alert ring (1,000) and evidence ring with content-derived ids
//! - pending queues drained every sync tick into SQLite (see `db`)
//!
//! Writers serialize through the inner RwLock; readers clone bounded
//! snapshots and never hold the lock across await points.

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::bus::{AlertBus, BusEvent};
use crate::model::{
    Alert, Evidence, EvidenceKind, OrdKey, PositionEvent, Side, SystemStats, Trade,
};

/// Bounded ring for decoded split/merge events.
const POSITION_RING: usize = 10_000;

/// Filter for trade queries; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub token_id: Option<U256>,
    pub address: Option<Address>,
    pub is_wash: Option<bool>,
    pub side: Option<Side>,
    /// Unix seconds, inclusive.
    pub since: Option<i64>,
    /// Unix seconds, inclusive.
    pub until: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

/// Filter for alert queries.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub kind: Option<EvidenceKind>,
    pub severity: Option<crate::model::Severity>,
    pub token_id: Option<U256>,
    pub since: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

/// Read-only view handed to the detector suite: chain-ordered trades and
/// position events plus store-lifetime first-seen times.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub trades: Vec<Trade>,
    pub position_events: Vec<PositionEvent>,
    /// Earliest timestamp each address was ever seen at (never evicted).
    pub first_seen: HashMap<Address, i64>,
    /// Rolling mean trade size per market over its last 1,000 trades.
    pub market_mean_size: HashMap<U256, Decimal>,
}

/// Batch drained for the durable spill. Handed back on failure so the next
/// tick retries.
#[derive(Debug, Default)]
pub struct PendingBatch {
    pub trades: Vec<Trade>,
    pub alerts: Vec<Alert>,
    pub evidence: Vec<Evidence>,
    /// (tx_hash, log_index, kind, confidence) wash re-marks.
    pub wash_marks: Vec<(B256, u64, EvidenceKind, f64)>,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
            && self.alerts.is_empty()
            && self.evidence.is_empty()
            && self.wash_marks.is_empty()
    }
}

/// Per-market aggregate used by the market listing endpoints.
#[derive(Debug, Clone)]
pub struct MarketAggregate {
    pub token_id: U256,
    pub trade_count: u64,
    pub volume: Decimal,
    pub wash_count: u64,
    pub wash_volume: Decimal,
    pub unique_traders: u64,
}

struct Inner {
    trades: BTreeMap<OrdKey, Trade>,
    key_index: HashMap<(B256, u64), OrdKey>,
    by_tx: HashMap<B256, BTreeSet<OrdKey>>,
    by_address: HashMap<Address, BTreeSet<OrdKey>>,
    by_token: HashMap<U256, BTreeSet<OrdKey>>,

    position_events: BTreeMap<OrdKey, PositionEvent>,

    alerts: VecDeque<Alert>,
    alert_ids: HashSet<String>,

    evidence: VecDeque<Evidence>,
    evidence_ids: HashSet<String>,

    first_seen: HashMap<Address, i64>,

    total_trades: u64,
    total_volume: Decimal,
    wash_count: u64,
    wash_volume: Decimal,
    last_block: u64,
    decoded_events: u64,
    malformed_events: u64,

    pending_trades: Vec<Trade>,
    pending_alerts: Vec<Alert>,
    pending_evidence: Vec<Evidence>,
    pending_wash_marks: Vec<(B256, u64, EvidenceKind, f64)>,
}

pub struct EvidenceStore {
    inner: RwLock<Inner>,
    bus: Arc<AlertBus>,
    trade_capacity: usize,
    alert_capacity: usize,
    streaming: AtomicBool,
}

impl EvidenceStore {
    pub fn new(trade_capacity: usize, alert_capacity: usize, bus: Arc<AlertBus>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                trades: BTreeMap::new(),
                key_index: HashMap::new(),
                by_tx: HashMap::new(),
                by_address: HashMap::new(),
                by_token: HashMap::new(),
                position_events: BTreeMap::new(),
                alerts: VecDeque::new(),
                alert_ids: HashSet::new(),
                evidence: VecDeque::new(),
                evidence_ids: HashSet::new(),
                first_seen: HashMap::new(),
                total_trades: 0,
                total_volume: Decimal::ZERO,
                wash_count: 0,
                wash_volume: Decimal::ZERO,
                last_block: 0,
                decoded_events: 0,
                malformed_events: 0,
                pending_trades: Vec::new(),
                pending_alerts: Vec::new(),
                pending_evidence: Vec::new(),
                pending_wash_marks: Vec::new(),
            }),
            bus,
            trade_capacity,
            alert_capacity,
            streaming: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &AlertBus {
        &self.bus
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Append a trade. Duplicate `(tx_hash, log_index)` is a no-op.
    /// Returns true when the trade was actually inserted.
    pub fn add_trade(&self, trade: Trade, notify: bool) -> bool {
        let inserted = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            if inner.key_index.contains_key(&trade.key()) {
                return false;
            }

            let ord = trade.ord_key();
            inner.key_index.insert(trade.key(), ord);
            inner.by_tx.entry(trade.tx_hash).or_default().insert(ord);
            inner.by_address.entry(trade.maker).or_default().insert(ord);
            inner.by_address.entry(trade.taker).or_default().insert(ord);
            inner.by_token.entry(trade.token_id).or_default().insert(ord);

            for addr in [trade.maker, trade.taker] {
                inner
                    .first_seen
                    .entry(addr)
                    .and_modify(|t| *t = (*t).min(trade.timestamp))
                    .or_insert(trade.timestamp);
            }

            inner.total_trades += 1;
            inner.total_volume += trade.volume;
            if trade.is_wash {
                inner.wash_count += 1;
                inner.wash_volume += trade.volume;
            }
            if trade.block_number > inner.last_block {
                inner.last_block = trade.block_number;
            }

            inner.pending_trades.push(trade.clone());
            inner.trades.insert(ord, trade.clone());

            while inner.trades.len() > self.trade_capacity {
                if let Some((old_key, old)) = inner.trades.pop_first() {
                    evict_indices(&mut inner, &old, old_key);
                }
            }
            true
        };

        if inserted && notify {
            self.bus.publish(BusEvent::NewTrade(Box::new(trade)));
        }
        inserted
    }

    pub fn add_position_event(&self, event: PositionEvent) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.position_events.insert(event.ord_key(), event);
        while inner.position_events.len() > POSITION_RING {
            inner.position_events.pop_first();
        }
    }

    /// Store one evidence item (idempotent by id). Wash-marking kinds also
    /// flag the referenced trades; newly marked trades are returned so the
    /// caller can emit `suspicious_trade` events.
    pub fn add_evidence(&self, evidence: Evidence) -> (bool, Vec<Trade>) {
        let mut marked = Vec::new();
        let inserted = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            if inner.evidence_ids.contains(&evidence.id) {
                return (false, marked);
            }
            inner.evidence_ids.insert(evidence.id.clone());
            inner.pending_evidence.push(evidence.clone());

            if evidence.kind.marks_trades_wash() {
                marked = mark_wash(&mut inner, &evidence);
            }

            inner.evidence.push_back(evidence);
            while inner.evidence.len() > self.trade_capacity {
                if let Some(old) = inner.evidence.pop_front() {
                    inner.evidence_ids.remove(&old.id);
                }
            }
            true
        };

        for t in &marked {
            self.bus.publish(BusEvent::SuspiciousTrade(
                serde_json::to_value(t).unwrap_or_default(),
            ));
        }
        (inserted, marked)
    }

    /// Store an alert (idempotent by alert id).
    pub fn add_alert(&self, alert: Alert, notify: bool) -> bool {
        let inserted = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            if inner.alert_ids.contains(&alert.alert_id) {
                return false;
            }
            inner.alert_ids.insert(alert.alert_id.clone());
            inner.pending_alerts.push(alert.clone());
            inner.alerts.push_back(alert.clone());
            while inner.alerts.len() > self.alert_capacity {
                if let Some(old) = inner.alerts.pop_front() {
                    inner.alert_ids.remove(&old.alert_id);
                }
            }
            true
        };

        if inserted && notify {
            self.bus.publish(BusEvent::NewAlert(Box::new(alert)));
        }
        inserted
    }

    /// Flip the acknowledged flag on a ring-resident alert.
    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        for alert in inner.alerts.iter_mut() {
            if alert.alert_id == alert_id {
                alert.acknowledged = true;
                return true;
            }
        }
        false
    }

    pub fn record_decode_stats(&self, decoded: u64, malformed: u64) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.decoded_events += decoded;
        inner.malformed_events += malformed;
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Earliest trade timestamp still inside the ring, if any. Queries with
    /// `since` older than this must fall through to the durable store.
    pub fn ring_window_start(&self) -> Option<i64> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.trades.values().map(|t| t.timestamp).min()
    }

    /// Query trades from memory, newest first.
    pub fn query_trades(&self, filter: &TradeFilter) -> Vec<Trade> {
        let inner = self.inner.read().expect("store lock poisoned");
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        // Walk newest-to-oldest, using the narrowest index available.
        let mut out = Vec::new();
        let mut skipped = 0usize;

        let keys: Vec<OrdKey> = if let Some(token) = filter.token_id {
            inner
                .by_token
                .get(&token)
                .map(|s| s.iter().rev().copied().collect())
                .unwrap_or_default()
        } else if let Some(addr) = filter.address {
            inner
                .by_address
                .get(&addr)
                .map(|s| s.iter().rev().copied().collect())
                .unwrap_or_default()
        } else {
            inner.trades.keys().rev().copied().collect()
        };

        for key in keys {
            let Some(t) = inner.trades.get(&key) else {
                continue;
            };
            if !matches_filter(t, filter) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            out.push(t.clone());
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    pub fn trades_by_hash(&self, tx_hash: B256) -> Vec<Trade> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .by_tx
            .get(&tx_hash)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| inner.trades.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn query_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let inner = self.inner.read().expect("store lock poisoned");
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        inner
            .alerts
            .iter()
            .rev()
            .filter(|a| {
                filter.kind.map_or(true, |k| a.kind == k)
                    && filter.severity.map_or(true, |s| a.severity == s)
                    && filter.token_id.map_or(true, |t| a.token_id == Some(t))
                    && filter.since.map_or(true, |s| a.timestamp >= s)
            })
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn evidence_all(&self) -> Vec<Evidence> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.evidence.iter().cloned().collect()
    }

    /// Evidence filtered by kind, oldest first.
    pub fn evidence_by_kind(&self, kind: EvidenceKind) -> Vec<Evidence> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .evidence
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Immutable view for a detector run. `window` bounds the trade set to
    /// the last N seconds / K trades (whichever is smaller); `None` snapshots
    /// the whole ring.
    pub fn snapshot(&self, window: Option<(i64, usize)>) -> Snapshot {
        let inner = self.inner.read().expect("store lock poisoned");

        let trades: Vec<Trade> = match window {
            None => inner.trades.values().cloned().collect(),
            Some((min_ts, max_trades)) => {
                let mut recent: Vec<Trade> = inner
                    .trades
                    .values()
                    .rev()
                    .filter(|t| t.timestamp >= min_ts)
                    .take(max_trades)
                    .cloned()
                    .collect();
                recent.reverse();
                recent
            }
        };

        let position_events: Vec<PositionEvent> = match window {
            None => inner.position_events.values().cloned().collect(),
            Some((min_ts, _)) => inner
                .position_events
                .values()
                .filter(|e| e.timestamp >= min_ts)
                .cloned()
                .collect(),
        };

        // Rolling mean over each market's last 1,000 trades, computed from
        // the full ring regardless of the detector window.
        let mut market_mean_size = HashMap::new();
        for (token, keys) in inner.by_token.iter() {
            let mut sum = Decimal::ZERO;
            let mut n = 0u32;
            for key in keys.iter().rev().take(1_000) {
                if let Some(t) = inner.trades.get(key) {
                    sum += t.size;
                    n += 1;
                }
            }
            if n > 0 {
                market_mean_size.insert(*token, sum / Decimal::from(n));
            }
        }

        Snapshot {
            trades,
            position_events,
            first_seen: inner.first_seen.clone(),
            market_mean_size,
        }
    }

    pub fn stats(&self) -> SystemStats {
        let inner = self.inner.read().expect("store lock poisoned");
        SystemStats {
            total_trades: inner.total_trades,
            total_volume: inner.total_volume,
            wash_trade_count: inner.wash_count,
            wash_volume: inner.wash_volume,
            total_alerts: inner.alerts.len() as u64,
            total_evidence: inner.evidence.len() as u64,
            unique_markets: inner.by_token.len() as u64,
            unique_traders: inner.by_address.len() as u64,
            decoded_events: inner.decoded_events,
            malformed_events: inner.malformed_events,
            dropped_subscriber_events: self.bus.total_dropped(),
            last_block: inner.last_block,
            is_streaming: self.is_streaming(),
        }
    }

    /// Per-market aggregates, largest volume first.
    pub fn market_aggregates(&self) -> Vec<MarketAggregate> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut out: Vec<MarketAggregate> = inner
            .by_token
            .iter()
            .map(|(token, keys)| {
                let mut agg = MarketAggregate {
                    token_id: *token,
                    trade_count: 0,
                    volume: Decimal::ZERO,
                    wash_count: 0,
                    wash_volume: Decimal::ZERO,
                    unique_traders: 0,
                };
                let mut traders = HashSet::new();
                for key in keys {
                    if let Some(t) = inner.trades.get(key) {
                        agg.trade_count += 1;
                        agg.volume += t.volume;
                        if t.is_wash {
                            agg.wash_count += 1;
                            agg.wash_volume += t.volume;
                        }
                        traders.insert(t.maker);
                        traders.insert(t.taker);
                    }
                }
                agg.unique_traders = traders.len() as u64;
                agg
            })
            .filter(|a| a.trade_count > 0)
            .collect();
        out.sort_by(|a, b| b.volume.cmp(&a.volume).then(a.token_id.cmp(&b.token_id)));
        out
    }

    pub fn trade_count(&self) -> usize {
        self.inner.read().expect("store lock poisoned").trades.len()
    }

    pub fn last_block(&self) -> u64 {
        self.inner.read().expect("store lock poisoned").last_block
    }

    // ── Durable spill ───────────────────────────────────────────────────

    /// Drain everything queued for the durable store.
    pub fn take_pending(&self) -> PendingBatch {
        let mut inner = self.inner.write().expect("store lock poisoned");
        PendingBatch {
            trades: std::mem::take(&mut inner.pending_trades),
            alerts: std::mem::take(&mut inner.pending_alerts),
            evidence: std::mem::take(&mut inner.pending_evidence),
            wash_marks: std::mem::take(&mut inner.pending_wash_marks),
        }
    }

    /// Re-queue a batch whose spill failed; the next tick retries it.
    pub fn restore_pending(&self, batch: PendingBatch) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let mut trades = batch.trades;
        trades.append(&mut inner.pending_trades);
        inner.pending_trades = trades;

        let mut alerts = batch.alerts;
        alerts.append(&mut inner.pending_alerts);
        inner.pending_alerts = alerts;

        let mut evidence = batch.evidence;
        evidence.append(&mut inner.pending_evidence);
        inner.pending_evidence = evidence;

        let mut marks = batch.wash_marks;
        marks.append(&mut inner.pending_wash_marks);
        inner.pending_wash_marks = marks;
        debug!("spill batch restored for retry");
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            trades = stats.total_trades,
            volume = %stats.total_volume,
            wash = stats.wash_trade_count,
            alerts = stats.total_alerts,
            markets = stats.unique_markets,
            "store summary"
        );
    }
}

fn evict_indices(inner: &mut Inner, old: &Trade, old_key: OrdKey) {
    inner.key_index.remove(&old.key());
    prune_index(&mut inner.by_tx, &old.tx_hash, old_key);
    prune_index(&mut inner.by_address, &old.maker, old_key);
    prune_index(&mut inner.by_address, &old.taker, old_key);
    prune_index(&mut inner.by_token, &old.token_id, old_key);
}

// Emptied sets stay in place: by_address/by_token keys double as the
// lifetime unique-trader and unique-market counters.
fn prune_index<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<OrdKey>>,
    key: &K,
    ord: OrdKey,
) {
    if let Some(set) = index.get_mut(key) {
        set.remove(&ord);
    }
}

/// Flag every ring trade referenced by wash-marking evidence: transaction
/// listed, participant overlap, and (when known) the same market.
fn mark_wash(inner: &mut Inner, evidence: &Evidence) -> Vec<Trade> {
    let mut marked = Vec::new();
    for tx in &evidence.tx_hashes {
        let Some(keys) = inner.by_tx.get(tx).cloned() else {
            continue;
        };
        for key in keys {
            let Some(t) = inner.trades.get_mut(&key) else {
                continue;
            };
            if t.is_wash {
                continue;
            }
            if let Some(token) = evidence.token_id {
                if t.token_id != token {
                    continue;
                }
            }
            if !evidence.addresses.is_empty()
                && !evidence.addresses.contains(&t.maker)
                && !evidence.addresses.contains(&t.taker)
            {
                continue;
            }
            t.is_wash = true;
            t.wash_kind = Some(evidence.kind);
            t.wash_confidence = evidence.confidence;
            inner.wash_count += 1;
            inner.wash_volume += t.volume;
            inner
                .pending_wash_marks
                .push((t.tx_hash, t.log_index, evidence.kind, evidence.confidence));
            marked.push(t.clone());
        }
    }
    marked
}

fn matches_filter(t: &Trade, f: &TradeFilter) -> bool {
    f.token_id.map_or(true, |v| t.token_id == v)
        && f.address.map_or(true, |a| t.maker == a || t.taker == a)
        && f.is_wash.map_or(true, |w| t.is_wash == w)
        && f.side.map_or(true, |s| t.side == s)
        && f.since.map_or(true, |s| t.timestamp >= s)
        && f.until.map_or(true, |u| t.timestamp <= u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::str::FromStr;

    fn test_trade(block: u64, log_index: u64, n: u8) -> Trade {
        let mut tx = [0u8; 32];
        tx[0] = n;
        tx[31] = log_index as u8;
        Trade {
            tx_hash: B256::from(tx),
            log_index,
            block_number: block,
            timestamp: 1_700_000_000 + block as i64,
            exchange: address!("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E"),
            order_hash: B256::ZERO,
            maker: address!("1111111111111111111111111111111111111111"),
            taker: address!("2222222222222222222222222222222222222222"),
            token_id: U256::from(77u64),
            side: Side::Buy,
            price: Decimal::from_str("0.5000").unwrap(),
            size: Decimal::from_str("2.000000").unwrap(),
            volume: Decimal::from_str("1.000000").unwrap(),
            fee: 0,
            gas_price: 0,
            is_wash: false,
            wash_kind: None,
            wash_confidence: 0.0,
        }
    }

    fn store(cap: usize) -> EvidenceStore {
        EvidenceStore::new(cap, 10, Arc::new(AlertBus::new()))
    }

    #[test]
    fn add_trade_is_idempotent_with_single_notification() {
        let s = store(100);
        let mut sub = s.bus().subscribe();

        let t = test_trade(1, 0, 1);
        assert!(s.add_trade(t.clone(), true));
        assert!(!s.add_trade(t, true));

        assert_eq!(s.trade_count(), 1);
        assert_eq!(s.stats().total_trades, 1);
        assert!(sub.rx.try_recv().is_ok());
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn ring_evicts_eldest_by_block_and_log_index() {
        let s = store(3);
        // Insert out of chain order; eviction must still drop the eldest.
        s.add_trade(test_trade(5, 0, 5), false);
        s.add_trade(test_trade(2, 0, 2), false);
        s.add_trade(test_trade(9, 0, 9), false);
        s.add_trade(test_trade(7, 0, 7), false);

        assert_eq!(s.trade_count(), 3);
        let remaining: Vec<u64> = s
            .query_trades(&TradeFilter {
                limit: 10,
                ..Default::default()
            })
            .iter()
            .map(|t| t.block_number)
            .collect();
        // Newest first; block 2 was evicted.
        assert_eq!(remaining, vec![9, 7, 5]);
    }

    #[test]
    fn stored_count_is_min_of_n_and_capacity() {
        let s = store(5);
        for b in 0..12u64 {
            s.add_trade(test_trade(b, 0, b as u8), false);
        }
        assert_eq!(s.trade_count(), 5);
        // Lifetime counter keeps counting past eviction.
        assert_eq!(s.stats().total_trades, 12);
    }

    #[test]
    fn query_filters_compose() {
        let s = store(100);
        let mut t1 = test_trade(1, 0, 1);
        t1.side = Side::Sell;
        s.add_trade(t1, false);
        s.add_trade(test_trade(2, 0, 2), false);

        let sells = s.query_trades(&TradeFilter {
            side: Some(Side::Sell),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].block_number, 1);

        let by_token = s.query_trades(&TradeFilter {
            token_id: Some(U256::from(77u64)),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(by_token.len(), 2);

        let none = s.query_trades(&TradeFilter {
            token_id: Some(U256::from(1u64)),
            limit: 10,
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn wash_marking_updates_trade_and_counters() {
        let s = store(100);
        let t = test_trade(1, 0, 1);
        let tx = t.tx_hash;
        s.add_trade(t, false);

        let evidence = Evidence {
            id: "SELF_test".to_string(),
            kind: EvidenceKind::SelfTrade,
            confidence: 1.0,
            timestamp: 1_700_000_001,
            addresses: vec![address!("1111111111111111111111111111111111111111")],
            tx_hashes: vec![tx],
            token_id: Some(U256::from(77u64)),
            volume: Decimal::ONE,
            details: serde_json::json!({}),
        };
        let (inserted, marked) = s.add_evidence(evidence.clone());
        assert!(inserted);
        assert_eq!(marked.len(), 1);
        assert!(marked[0].is_wash);

        // Idempotent: same evidence id marks nothing twice.
        let (inserted2, marked2) = s.add_evidence(evidence);
        assert!(!inserted2);
        assert!(marked2.is_empty());

        let stats = s.stats();
        assert_eq!(stats.wash_trade_count, 1);
        assert_eq!(stats.wash_volume, Decimal::ONE);
    }

    #[test]
    fn alert_ring_is_bounded_and_idempotent() {
        let s = store(100);
        for n in 0..15u64 {
            let alert = Alert {
                alert_id: format!("AL_{n}"),
                timestamp: n as i64,
                kind: EvidenceKind::SelfTrade,
                severity: crate::model::Severity::High,
                tx_hash: None,
                token_id: None,
                trade_count: 1,
                volume: Decimal::ZERO,
                confidence: 1.0,
                addresses: vec![],
                evidence_id: format!("E_{n}"),
                acknowledged: false,
            };
            assert!(s.add_alert(alert.clone(), false));
            assert!(!s.add_alert(alert, false));
        }
        // alert capacity is 10 in the fixture
        assert_eq!(s.stats().total_alerts, 10);
    }

    #[test]
    fn snapshot_window_bounds_trades() {
        let s = store(100);
        for b in 0..10u64 {
            s.add_trade(test_trade(b, 0, b as u8), false);
        }
        let full = s.snapshot(None);
        assert_eq!(full.trades.len(), 10);
        // Ascending chain order.
        assert!(full
            .trades
            .windows(2)
            .all(|w| w[0].ord_key() < w[1].ord_key()));

        let recent = s.snapshot(Some((1_700_000_007, 100)));
        assert_eq!(recent.trades.len(), 3);

        let capped = s.snapshot(Some((0, 4)));
        assert_eq!(capped.trades.len(), 4);
        assert_eq!(capped.trades[0].block_number, 6);
    }

    #[test]
    fn pending_batch_roundtrip_for_retry() {
        let s = store(100);
        s.add_trade(test_trade(1, 0, 1), false);
        let batch = s.take_pending();
        assert_eq!(batch.trades.len(), 1);
        assert!(s.take_pending().is_empty());

        s.restore_pending(batch);
        let retried = s.take_pending();
        assert_eq!(retried.trades.len(), 1);
    }

    #[test]
    fn first_seen_survives_eviction() {
        let s = store(2);
        for b in 0..5u64 {
            s.add_trade(test_trade(b, 0, b as u8), false);
        }
        let snap = s.snapshot(None);
        let earliest = snap
            .first_seen
            .get(&address!("1111111111111111111111111111111111111111"))
            .copied()
            .unwrap();
        assert_eq!(earliest, 1_700_000_000);
    }
}
