//! SQLite durable store: spill target for the in-memory rings, fallthrough
//! source for queries older than the ring window, and the sync-state row
//! the stream controller checkpoints into.
//!
//! The spill task drains the store's pending queues every sync tick inside
//! one transaction with insert-or-ignore semantics; a failed batch is handed
//! back for retry and never stalls the rings.

use alloy::primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};
use crate::model::{EvidenceKind, Side, Trade};
use crate::resolver::MarketInfo;
use crate::store::{EvidenceStore, PendingBatch, TradeFilter};

/// Sync-state key used by the stream controller.
pub const SYNC_KEY_STREAM: &str = "stream";

/// Open (creating if needed) the SQLite database and run migrations.
pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
        .map_err(AppError::Persistence)?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Persistence(e.into()))?;
    info!(path = db_path, "durable store ready");
    Ok(pool)
}

/// Persist one drained batch inside a single transaction.
pub async fn spill_batch(pool: &SqlitePool, batch: &PendingBatch) -> Result<()> {
    let mut tx = pool.begin().await?;

    for t in &batch.trades {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades (
                tx_hash, log_index, block_number, timestamp, exchange,
                order_hash, maker, taker, token_id, side,
                price, size, volume, fee, gas_price,
                is_wash, wash_kind, wash_confidence
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(t.tx_hash.to_string())
        .bind(t.log_index as i64)
        .bind(t.block_number as i64)
        .bind(t.timestamp)
        .bind(t.exchange.to_string())
        .bind(t.order_hash.to_string())
        .bind(t.maker.to_string())
        .bind(t.taker.to_string())
        .bind(t.token_id.to_string())
        .bind(t.side.as_str())
        .bind(t.price.to_string())
        .bind(t.size.to_string())
        .bind(t.volume.to_string())
        .bind(t.fee.to_string())
        .bind(t.gas_price.to_string())
        .bind(t.is_wash as i64)
        .bind(t.wash_kind.map(|k| k.as_str()))
        .bind(t.wash_confidence)
        .execute(&mut *tx)
        .await?;
    }

    for (tx_hash, log_index, kind, confidence) in &batch.wash_marks {
        sqlx::query(
            r#"
            UPDATE trades
            SET is_wash = 1, wash_kind = ?, wash_confidence = ?
            WHERE tx_hash = ? AND log_index = ? AND is_wash = 0
            "#,
        )
        .bind(kind.as_str())
        .bind(confidence)
        .bind(tx_hash.to_string())
        .bind(*log_index as i64)
        .execute(&mut *tx)
        .await?;
    }

    for a in &batch.alerts {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO alerts (
                alert_id, timestamp, alert_type, severity, tx_hash, token_id,
                trade_count, volume, confidence, addresses, details, acknowledged
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&a.alert_id)
        .bind(a.timestamp)
        .bind(a.kind.as_str())
        .bind(a.severity.as_str())
        .bind(a.tx_hash.map(|h| h.to_string()))
        .bind(a.token_id.map(|t| t.to_string()))
        .bind(a.trade_count as i64)
        .bind(a.volume.to_string())
        .bind(a.confidence)
        .bind(serde_json::to_string(&a.addresses)?)
        .bind(serde_json::json!({ "evidence_id": a.evidence_id }).to_string())
        .bind(a.acknowledged as i64)
        .execute(&mut *tx)
        .await?;
    }

    for e in &batch.evidence {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO evidence (
                evidence_id, kind, confidence, timestamp, token_id,
                volume, addresses, tx_hashes, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.id)
        .bind(e.kind.as_str())
        .bind(e.confidence)
        .bind(e.timestamp)
        .bind(e.token_id.map(|t| t.to_string()))
        .bind(e.volume.to_string())
        .bind(serde_json::to_string(&e.addresses)?)
        .bind(serde_json::to_string(&e.tx_hashes)?)
        .bind(e.details.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Fallthrough query for trades older than the ring window, newest first.
pub async fn query_trades(pool: &SqlitePool, filter: &TradeFilter) -> Result<Vec<Trade>> {
    let mut qb = sqlx::QueryBuilder::new(
        "SELECT tx_hash, log_index, block_number, timestamp, exchange, order_hash, \
         maker, taker, token_id, side, price, size, volume, fee, gas_price, \
         is_wash, wash_kind, wash_confidence FROM trades WHERE 1 = 1",
    );
    if let Some(token) = filter.token_id {
        qb.push(" AND token_id = ").push_bind(token.to_string());
    }
    if let Some(addr) = filter.address {
        let a = addr.to_string();
        qb.push(" AND (maker = ")
            .push_bind(a.clone())
            .push(" OR taker = ")
            .push_bind(a)
            .push(")");
    }
    if let Some(wash) = filter.is_wash {
        qb.push(" AND is_wash = ").push_bind(wash as i64);
    }
    if let Some(side) = filter.side {
        qb.push(" AND side = ").push_bind(side.as_str());
    }
    if let Some(since) = filter.since {
        qb.push(" AND timestamp >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND timestamp <= ").push_bind(until);
    }
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    qb.push(" ORDER BY timestamp DESC, block_number DESC, log_index DESC LIMIT ")
        .push_bind(limit as i64)
        .push(" OFFSET ")
        .push_bind(filter.offset as i64);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(trade_from_row).collect()
}

fn trade_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Trade> {
    let parse = |what: &str, e: String| AppError::Decode(format!("bad {what} in durable row: {e}"));

    let tx_hash: String = row.get("tx_hash");
    let exchange: String = row.get("exchange");
    let order_hash: String = row.get("order_hash");
    let maker: String = row.get("maker");
    let taker: String = row.get("taker");
    let token_id: String = row.get("token_id");
    let side: String = row.get("side");
    let price: String = row.get("price");
    let size: String = row.get("size");
    let volume: String = row.get("volume");
    let fee: String = row.get("fee");
    let gas_price: String = row.get("gas_price");
    let wash_kind: Option<String> = row.get("wash_kind");

    Ok(Trade {
        tx_hash: B256::from_str(&tx_hash).map_err(|e| parse("tx_hash", e.to_string()))?,
        log_index: row.get::<i64, _>("log_index") as u64,
        block_number: row.get::<i64, _>("block_number") as u64,
        timestamp: row.get::<i64, _>("timestamp"),
        exchange: Address::from_str(&exchange).map_err(|e| parse("exchange", e.to_string()))?,
        order_hash: B256::from_str(&order_hash).map_err(|e| parse("order_hash", e.to_string()))?,
        maker: Address::from_str(&maker).map_err(|e| parse("maker", e.to_string()))?,
        taker: Address::from_str(&taker).map_err(|e| parse("taker", e.to_string()))?,
        token_id: U256::from_str(&token_id).map_err(|e| parse("token_id", e.to_string()))?,
        side: Side::from_str(&side).map_err(|_| parse("side", side.clone()))?,
        price: Decimal::from_str(&price).map_err(|e| parse("price", e.to_string()))?,
        size: Decimal::from_str(&size).map_err(|e| parse("size", e.to_string()))?,
        volume: Decimal::from_str(&volume).map_err(|e| parse("volume", e.to_string()))?,
        fee: fee.parse().map_err(|_| parse("fee", fee.clone()))?,
        gas_price: gas_price
            .parse()
            .map_err(|_| parse("gas_price", gas_price.clone()))?,
        is_wash: row.get::<i64, _>("is_wash") != 0,
        wash_kind: wash_kind.and_then(|k| EvidenceKind::from_str(&k).ok()),
        wash_confidence: row.get::<f64, _>("wash_confidence"),
    })
}

// ── Market cache table ───────────────────────────────────────────────────

pub async fn upsert_market(pool: &SqlitePool, market: &MarketInfo) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO markets (token_id, condition_id, question_id, oracle,
                             outcome, question, slug, status, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (token_id) DO UPDATE SET
            condition_id = excluded.condition_id,
            question_id = excluded.question_id,
            oracle = excluded.oracle,
            outcome = excluded.outcome,
            question = excluded.question,
            slug = excluded.slug,
            status = excluded.status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(market.token_id.to_string())
    .bind(market.condition_id.map(|c| c.to_string()))
    .bind(market.question_id.map(|q| q.to_string()))
    .bind(market.oracle.map(|o| o.to_string()))
    .bind(&market.outcome)
    .bind(&market.question)
    .bind(&market.slug)
    .bind(&market.status)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_markets(pool: &SqlitePool) -> Result<Vec<MarketInfo>> {
    let rows = sqlx::query(
        "SELECT token_id, condition_id, question_id, oracle, outcome, question, slug, status \
         FROM markets",
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let token_id: String = row.get("token_id");
        let Ok(token_id) = U256::from_str(&token_id) else {
            continue;
        };
        let condition_id: Option<String> = row.get("condition_id");
        let question_id: Option<String> = row.get("question_id");
        let oracle: Option<String> = row.get("oracle");
        out.push(MarketInfo {
            token_id,
            condition_id: condition_id.and_then(|c| B256::from_str(&c).ok()),
            question_id: question_id.and_then(|q| B256::from_str(&q).ok()),
            oracle: oracle.and_then(|o| Address::from_str(&o).ok()),
            yes_token_id: None,
            no_token_id: None,
            outcome: row.get("outcome"),
            question: row.get("question"),
            slug: row.get("slug"),
            status: row.get("status"),
        });
    }
    Ok(out)
}

// ── Sync state ───────────────────────────────────────────────────────────

pub async fn get_sync_state(pool: &SqlitePool, key: &str) -> Result<Option<u64>> {
    let row = sqlx::query("SELECT last_block FROM sync_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("last_block") as u64))
}

pub async fn set_sync_state(pool: &SqlitePool, key: &str, last_block: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (key, last_block, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            last_block = excluded.last_block,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(last_block as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Count of acknowledged alerts mirrored into the durable store.
pub async fn acknowledge_alert(pool: &SqlitePool, alert_id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE alerts SET acknowledged = 1 WHERE alert_id = ?")
        .bind(alert_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Spill task ───────────────────────────────────────────────────────────

/// Drains the store's pending queues into SQLite on a fixed interval.
/// Runs as a dedicated background task; never blocks the ingest path.
pub struct SpillTask {
    pool: SqlitePool,
    store: Arc<EvidenceStore>,
    interval: Duration,
}

impl SpillTask {
    pub fn new(pool: SqlitePool, store: Arc<EvidenceStore>, interval: Duration) -> Self {
        Self {
            pool,
            store,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush_once().await;
        }
    }

    pub async fn flush_once(&self) {
        let batch = self.store.take_pending();
        if batch.is_empty() {
            return;
        }
        let counts = (
            batch.trades.len(),
            batch.alerts.len(),
            batch.evidence.len(),
        );
        match spill_batch(&self.pool, &batch).await {
            Ok(()) => {
                debug!(
                    trades = counts.0,
                    alerts = counts.1,
                    evidence = counts.2,
                    "spill batch committed"
                );
            }
            Err(e) => {
                error!(error = %e, "spill failed, batch requeued");
                self.store.restore_pending(batch);
            }
        }
    }
}
