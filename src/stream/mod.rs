//! Stream controller: the poll loop that walks the chain head, ingests
//! exchange logs, runs the incremental detector pass, and checkpoints sync
//! state only after a batch commits.
//!
//! Lifecycle is `Idle → Streaming → Stopping → Idle` with a cooperative
//! cancellation flag; `start` is idempotent and `stop` bounds at two
//! seconds. A failed tick logs and leaves the checkpoint untouched; the
//! next tick re-scans the same range.

use alloy::primitives::Address;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{AlertBus, BusEvent};
use crate::config::Config;
use crate::db;
use crate::detect::{self, ScanCtx};
use crate::error::{AppError, Result};
use crate::model::{Alert, PositionEventKind};
use crate::onchain::{self, classify_topic, ChainSource, EventTopic, RawLog};
use crate::resolver::MarketResolver;
use crate::store::EvidenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Streaming,
    Stopping,
}

/// Outcome of one ingest pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestReport {
    pub trades: usize,
    pub position_events: usize,
    pub malformed: usize,
}

pub struct StreamController<C: ChainSource> {
    chain: Arc<C>,
    store: Arc<EvidenceStore>,
    resolver: Arc<MarketResolver>,
    bus: Arc<AlertBus>,
    pool: SqlitePool,

    watch_addresses: Vec<Address>,
    confirmations: u64,

    state: Mutex<Lifecycle>,
    cancel: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_block: AtomicU64,
}

impl<C: ChainSource> StreamController<C> {
    pub fn new(
        config: &Config,
        chain: Arc<C>,
        store: Arc<EvidenceStore>,
        resolver: Arc<MarketResolver>,
        bus: Arc<AlertBus>,
        pool: SqlitePool,
    ) -> Result<Self> {
        let mut watch_addresses = Vec::new();
        for raw in config
            .chain
            .exchange_addresses
            .iter()
            .chain(std::iter::once(&config.chain.ctf_address))
        {
            let addr = Address::from_str(raw)
                .map_err(|e| AppError::Config(format!("bad contract address {raw}: {e}")))?;
            if !watch_addresses.contains(&addr) {
                watch_addresses.push(addr);
            }
        }

        Ok(Self {
            chain,
            store,
            resolver,
            bus,
            pool,
            watch_addresses,
            confirmations: config.stream.confirmations,
            state: Mutex::new(Lifecycle::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            last_block: AtomicU64::new(0),
        })
    }

    pub fn chain_ref(&self) -> &C {
        &self.chain
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_streaming(&self) -> bool {
        self.lifecycle() == Lifecycle::Streaming
    }

    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::SeqCst)
    }

    /// Start the poll loop. Idempotent: a second call while streaming is a
    /// no-op returning false.
    pub fn start(
        self: &Arc<Self>,
        poll_interval: Duration,
        blocks_per_poll: u64,
    ) -> bool {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != Lifecycle::Idle {
                return false;
            }
            *state = Lifecycle::Streaming;
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.store.set_streaming(true);

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            controller.run_loop(poll_interval, blocks_per_poll).await;
        });
        *self.task.lock().expect("task lock poisoned") = Some(handle);

        info!(
            poll_secs = poll_interval.as_secs_f64(),
            blocks_per_poll, "streaming started"
        );
        true
    }

    /// Signal the loop to stop and wait for it, bounded at two seconds.
    pub async fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != Lifecycle::Streaming {
                return false;
            }
            *state = Lifecycle::Stopping;
        }
        self.cancel.store(true, Ordering::SeqCst);

        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!("stream task did not wind down within 2s, detaching");
            }
        }

        *self.state.lock().expect("state lock poisoned") = Lifecycle::Idle;
        self.store.set_streaming(false);
        info!("streaming stopped");
        true
    }

    async fn run_loop(self: Arc<Self>, poll_interval: Duration, blocks_per_poll: u64) {
        // Resume from the durable checkpoint; otherwise start at the
        // confirmed head.
        let start_block = match db::get_sync_state(&self.pool, db::SYNC_KEY_STREAM).await {
            Ok(Some(block)) => block,
            Ok(None) => match self.chain.get_block_number().await {
                Ok(head) => head.saturating_sub(self.confirmations),
                Err(e) => {
                    error!(error = %e, "cannot read chain head, streaming aborts");
                    *self.state.lock().expect("state lock poisoned") = Lifecycle::Idle;
                    self.store.set_streaming(false);
                    return;
                }
            },
            Err(e) => {
                error!(error = %e, "cannot read sync state, streaming aborts");
                *self.state.lock().expect("state lock poisoned") = Lifecycle::Idle;
                self.store.set_streaming(false);
                return;
            }
        };
        self.last_block.store(start_block, Ordering::SeqCst);
        info!(block = start_block, "stream loop resuming");

        while !self.cancel.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = cancelled(&self.cancel) => break,
            }
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            // Fail-soft: one bad tick never stops the controller.
            if let Err(e) = self.tick(blocks_per_poll).await {
                warn!(error = %e, "stream tick failed");
            }
        }

        *self.state.lock().expect("state lock poisoned") = Lifecycle::Idle;
        self.store.set_streaming(false);
        debug!("stream loop exited");
    }

    /// One poll cycle: confirmed head, bounded fetch, ingest, detect,
    /// checkpoint. The checkpoint only advances when every step committed.
    pub async fn tick(&self, blocks_per_poll: u64) -> Result<IngestReport> {
        let head = self.chain.get_block_number().await?;
        let confirmed = head.saturating_sub(self.confirmations);
        let last = self.last_block.load(Ordering::SeqCst);
        if confirmed <= last {
            return Ok(IngestReport::default());
        }

        let from = last + 1;
        let to = confirmed.min(last + blocks_per_poll);

        let report = self.ingest_range(from, to, true).await?;
        if report.trades > 0 || report.position_events > 0 {
            self.run_detection(true).await;
        }

        db::set_sync_state(&self.pool, db::SYNC_KEY_STREAM, to).await?;
        self.last_block.store(to, Ordering::SeqCst);

        if report.trades > 0 {
            info!(
                from,
                to,
                trades = report.trades,
                splits_merges = report.position_events,
                malformed = report.malformed,
                "batch committed"
            );
            self.publish_stats();
        }
        Ok(report)
    }

    /// One-shot backfill over the last `num_blocks` below the confirmed
    /// head, followed by a full-ring detector pass. Does not move the
    /// streaming checkpoint.
    pub async fn backfill(&self, num_blocks: u64) -> Result<IngestReport> {
        let head = self.chain.get_block_number().await?;
        let to = head.saturating_sub(self.confirmations);
        let from = to.saturating_sub(num_blocks);
        info!(from, to, "one-shot backfill");

        // Backfill floods the ring; per-trade notifications stay quiet and
        // subscribers get one stats event at the end.
        let report = self.ingest_range(from, to, false).await?;
        self.run_detection(false).await;
        self.publish_stats();
        Ok(report)
    }

    /// Fetch, decode, and store everything in an inclusive block range.
    async fn ingest_range(&self, from: u64, to: u64, notify: bool) -> Result<IngestReport> {
        let topics = onchain::subscribed_topics();
        let logs = self
            .chain
            .get_logs(from, to, &self.watch_addresses, &topics)
            .await?;

        let mut raw: Vec<RawLog> = logs.iter().filter_map(RawLog::from_rpc).collect();
        raw.sort_by_key(|l| (l.block_number, l.log_index));

        let mut report = IngestReport::default();
        let now = chrono::Utc::now().timestamp();

        for log in &raw {
            let Some(topic0) = log.topic0() else {
                report.malformed += 1;
                continue;
            };
            let Some(event) = classify_topic(topic0) else {
                continue;
            };
            let timestamp = self
                .chain
                .get_block_timestamp(log.block_number)
                .await
                .unwrap_or(now);

            match event {
                EventTopic::OrderFilled => {
                    let gas_price = self.chain.get_gas_price(log.tx_hash).await;
                    match crate::onchain::decode::decode_order_filled(log, timestamp, gas_price) {
                        Ok(trade) => {
                            let token_id = trade.token_id;
                            if self.store.add_trade(trade, notify) {
                                report.trades += 1;
                                self.resolver.schedule_resolve(token_id);
                            }
                        }
                        Err(e) => {
                            report.malformed += 1;
                            debug!(tx = %log.tx_hash, error = %e, "dropped malformed fill");
                        }
                    }
                }
                EventTopic::PositionSplit | EventTopic::PositionsMerge => {
                    let kind = if event == EventTopic::PositionSplit {
                        PositionEventKind::Split
                    } else {
                        PositionEventKind::Merge
                    };
                    match crate::onchain::decode::decode_position_event(log, kind, timestamp) {
                        Ok(ev) => {
                            self.store.add_position_event(ev);
                            report.position_events += 1;
                        }
                        Err(e) => {
                            report.malformed += 1;
                            debug!(tx = %log.tx_hash, error = %e, "dropped malformed position event");
                        }
                    }
                }
            }
        }

        self.store
            .record_decode_stats((report.trades + report.position_events) as u64, report.malformed as u64);
        Ok(report)
    }

    /// Detector pass: incremental window when `windowed`, full ring
    /// otherwise. New evidence is promoted to alerts through the per-kind
    /// thresholds.
    pub async fn run_detection(&self, windowed: bool) {
        let window = if windowed {
            let now = chrono::Utc::now().timestamp();
            Some((now - detect::WINDOW_SECS, detect::WINDOW_TRADES))
        } else {
            None
        };
        let snapshot = self.store.snapshot(window);
        if snapshot.trades.is_empty() {
            return;
        }

        let ctx = ScanCtx::new();
        let (evidence, summary) = detect::run_all(&snapshot, &ctx);

        let mut new_evidence = 0usize;
        let mut new_alerts = 0usize;
        for e in evidence {
            let alert = Alert::from_evidence(&e);
            let (inserted, _) = self.store.add_evidence(e);
            if !inserted {
                continue;
            }
            new_evidence += 1;
            if let Some(alert) = alert {
                if self.store.add_alert(alert, true) {
                    new_alerts += 1;
                }
            }
        }

        if new_evidence > 0 {
            info!(evidence = new_evidence, alerts = new_alerts, "detector pass");
        }
        let detail: serde_json::Value = summary
            .iter()
            .map(|(name, count)| ((*name).to_string(), serde_json::json!(count)))
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();
        self.bus.publish(BusEvent::AnalysisStats(serde_json::json!({
            "scanned_trades": snapshot.trades.len(),
            "new_evidence": new_evidence,
            "new_alerts": new_alerts,
            "by_detector": detail,
        })));
    }

    fn publish_stats(&self) {
        self.bus
            .publish(BusEvent::Stats(Box::new(self.store.stats())));
    }
}

async fn cancelled(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};
    use alloy::rpc::types::Log;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::onchain::abi;

    /// Scripted chain for controller tests.
    struct MockChain {
        head: AtomicU64,
        logs: StdMutex<HashMap<(u64, u64), Vec<Log>>>,
        timestamps: StdMutex<HashMap<u64, i64>>,
    }

    impl MockChain {
        fn new(head: u64) -> Self {
            Self {
                head: AtomicU64::new(head),
                logs: StdMutex::new(HashMap::new()),
                timestamps: StdMutex::new(HashMap::new()),
            }
        }

        fn put_logs(&self, from: u64, to: u64, logs: Vec<Log>) {
            self.logs.lock().unwrap().insert((from, to), logs);
        }
    }

    impl ChainSource for MockChain {
        async fn get_block_number(&self) -> Result<u64> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_logs(
            &self,
            from_block: u64,
            to_block: u64,
            _addresses: &[Address],
            _topics: &[B256],
        ) -> Result<Vec<Log>> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .get(&(from_block, to_block))
                .cloned()
                .unwrap_or_default())
        }

        async fn get_block_timestamp(&self, block_number: u64) -> Result<i64> {
            Ok(self
                .timestamps
                .lock()
                .unwrap()
                .get(&block_number)
                .copied()
                .unwrap_or(1_700_000_000))
        }

        async fn get_gas_price(&self, _tx_hash: B256) -> u128 {
            30_000_000_000
        }
    }

    fn order_filled_rpc_log(block: u64, log_index: u64, token: u64, amount: u128) -> Log {
        let mut data = Vec::new();
        data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(token).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(amount).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(amount).to_be_bytes::<32>());
        data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());

        let maker = Address::from([0x11; 20]);
        let taker = Address::from([0x22; 20]);
        let pad = |a: Address| {
            let mut out = [0u8; 32];
            out[12..].copy_from_slice(a.as_slice());
            B256::from(out)
        };
        let mut tx = [0u8; 32];
        tx[24..].copy_from_slice(&(block * 1_000 + log_index).to_be_bytes());

        Log {
            inner: alloy::primitives::Log {
                address: Address::from([0xEE; 20]),
                data: alloy::primitives::LogData::new_unchecked(
                    vec![abi::ORDER_FILLED_TOPIC, B256::ZERO, pad(maker), pad(taker)],
                    data.into(),
                ),
            },
            block_hash: None,
            block_number: Some(block),
            block_timestamp: None,
            transaction_hash: Some(B256::from(tx)),
            transaction_index: Some(0),
            log_index: Some(log_index),
            removed: false,
        }
    }

    async fn fixture(head: u64) -> (Arc<StreamController<MockChain>>, Arc<MockChain>, SqlitePool) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let bus = Arc::new(AlertBus::new());
        let store = Arc::new(EvidenceStore::new(10_000, 1_000, Arc::clone(&bus)));
        let resolver = Arc::new(MarketResolver::new(
            "http://localhost".to_string(),
            Address::ZERO,
            None,
        ));
        let chain = Arc::new(MockChain::new(head));

        let mut config = Config::default();
        config.chain.rpc_url = "http://localhost".to_string();

        let controller = Arc::new(
            StreamController::new(&config, Arc::clone(&chain), store, resolver, bus, pool.clone())
                .unwrap(),
        );
        (controller, chain, pool)
    }

    #[tokio::test]
    async fn tick_stops_below_confirmed_head() {
        // Head 100, confirmations 3: nothing past block 97 is committed.
        let (controller, _chain, pool) = fixture(100).await;
        controller.last_block.store(0, Ordering::SeqCst);

        controller.tick(200).await.unwrap();
        assert_eq!(controller.last_block(), 97);
        assert_eq!(
            db::get_sync_state(&pool, db::SYNC_KEY_STREAM).await.unwrap(),
            Some(97)
        );
    }

    #[tokio::test]
    async fn tick_is_bounded_by_blocks_per_poll() {
        let (controller, _chain, _pool) = fixture(1_000).await;
        controller.last_block.store(500, Ordering::SeqCst);

        controller.tick(20).await.unwrap();
        assert_eq!(controller.last_block(), 520);
    }

    #[tokio::test]
    async fn tick_ingests_and_checkpoints() {
        let (controller, chain, pool) = fixture(100).await;
        controller.last_block.store(90, Ordering::SeqCst);
        chain.put_logs(
            91,
            97,
            vec![
                order_filled_rpc_log(92, 0, 7, 3_000_000),
                order_filled_rpc_log(93, 1, 7, 5_000_000),
            ],
        );

        let report = controller.tick(50).await.unwrap();
        assert_eq!(report.trades, 2);
        assert_eq!(report.malformed, 0);
        assert_eq!(controller.last_block(), 97);
        assert_eq!(controller.store.trade_count(), 2);
        assert_eq!(
            db::get_sync_state(&pool, db::SYNC_KEY_STREAM).await.unwrap(),
            Some(97)
        );
    }

    #[tokio::test]
    async fn malformed_logs_are_counted_and_dropped() {
        let (controller, chain, _pool) = fixture(100).await;
        controller.last_block.store(90, Ordering::SeqCst);

        let mut bad = order_filled_rpc_log(92, 0, 7, 3_000_000);
        // Token amount zero: decoder must reject.
        bad = {
            let mut data = Vec::new();
            data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
            data.extend_from_slice(&U256::from(7u64).to_be_bytes::<32>());
            data.extend_from_slice(&U256::from(1_000_000u64).to_be_bytes::<32>());
            data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
            data.extend_from_slice(&U256::ZERO.to_be_bytes::<32>());
            Log {
                inner: alloy::primitives::Log {
                    address: bad.inner.address,
                    data: alloy::primitives::LogData::new_unchecked(
                        bad.inner.data.topics().to_vec(),
                        data.into(),
                    ),
                },
                ..bad
            }
        };
        chain.put_logs(91, 97, vec![bad, order_filled_rpc_log(93, 1, 7, 5_000_000)]);

        let report = controller.tick(50).await.unwrap();
        assert_eq!(report.trades, 1);
        assert_eq!(report.malformed, 1);
        // The batch still commits.
        assert_eq!(controller.last_block(), 97);
        assert_eq!(controller.store.stats().malformed_events, 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_winds_down() {
        let (controller, _chain, _pool) = fixture(100).await;

        assert!(controller.start(Duration::from_millis(50), 10));
        assert!(!controller.start(Duration::from_millis(50), 10));
        assert!(controller.is_streaming());

        assert!(controller.stop().await);
        assert_eq!(controller.lifecycle(), Lifecycle::Idle);
        assert!(!controller.stop().await);
    }

    #[tokio::test]
    async fn failed_upstream_leaves_checkpoint_untouched() {
        let (controller, chain, pool) = fixture(100).await;
        controller.last_block.store(90, Ordering::SeqCst);
        db::set_sync_state(&pool, db::SYNC_KEY_STREAM, 90).await.unwrap();

        // Simulate an upstream outage by making head read fail: drop to a
        // head below the checkpoint so the tick is a no-op.
        chain.head.store(80, Ordering::SeqCst);
        controller.tick(50).await.unwrap();
        assert_eq!(controller.last_block(), 90);
        assert_eq!(
            db::get_sync_state(&pool, db::SYNC_KEY_STREAM).await.unwrap(),
            Some(90)
        );
    }
}
