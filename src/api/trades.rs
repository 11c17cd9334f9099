//! Trade query and analysis endpoints.

use alloy::primitives::{Address, B256};
use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::{
    parse_token_id, run_detectors_on_ring, trade_view, AnalysisResponse, AppState, TradeView,
    QUERY_DEADLINE, SCAN_DEADLINE,
};
use crate::error::{AppError, Result};
use crate::health;
use crate::model::Side;
use crate::store::TradeFilter;

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub token_id: Option<String>,
    pub address: Option<String>,
    pub is_wash: Option<bool>,
    pub side: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

fn build_filter(q: &TradesQuery) -> Result<TradeFilter> {
    let limit = q.limit.unwrap_or(100);
    if !(1..=5_000).contains(&limit) {
        return Err(AppError::InvalidRequest("limit must be in 1..=5000".into()));
    }
    let address = match &q.address {
        None => None,
        Some(raw) => Some(
            Address::from_str(raw)
                .map_err(|e| AppError::InvalidRequest(format!("bad address: {e}")))?,
        ),
    };
    let side = match &q.side {
        None => None,
        Some(raw) => Some(
            Side::from_str(raw)
                .map_err(|_| AppError::InvalidRequest(format!("bad side: {raw}")))?,
        ),
    };
    Ok(TradeFilter {
        token_id: parse_token_id(&q.token_id)?,
        address,
        is_wash: q.is_wash,
        side,
        since: q.since,
        until: q.until,
        limit,
        offset: q.offset.unwrap_or(0),
    })
}

/// GET /api/trades — served from memory when the requested window is inside
/// the ring, otherwise from the durable store.
pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<TradesQuery>,
) -> Result<Json<Vec<TradeView>>> {
    let filter = build_filter(&q)?;

    let in_ring = match (filter.since, state.store.ring_window_start()) {
        (None, _) => true,
        (Some(since), Some(ring_start)) => since >= ring_start,
        (Some(_), None) => false,
    };

    let trades = if in_ring {
        state.store.query_trades(&filter)
    } else {
        crate::db::query_trades(&state.pool, &filter).await?
    };

    Ok(Json(
        trades
            .into_iter()
            .map(|t| trade_view(t, &state.resolver))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub hours: Option<i64>,
    /// Bucket width in seconds.
    pub interval: Option<i64>,
    pub token_id: Option<String>,
}

/// GET /api/trades/timeline — aggregated buckets for charting.
pub async fn timeline(
    State(state): State<AppState>,
    Query(q): Query<TimelineQuery>,
) -> Result<Json<Vec<serde_json::Value>>> {
    let hours = q.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return Err(AppError::InvalidRequest("hours must be in 1..=168".into()));
    }
    let interval = q.interval.unwrap_or(300);
    if !(1..=86_400).contains(&interval) {
        return Err(AppError::InvalidRequest(
            "interval must be in 1..=86400 seconds".into(),
        ));
    }
    let token_id = parse_token_id(&q.token_id)?;
    let since = chrono::Utc::now().timestamp() - hours * 3_600;

    let trades = state.store.query_trades(&TradeFilter {
        token_id,
        since: Some(since),
        limit: usize::MAX,
        ..Default::default()
    });

    #[derive(Default)]
    struct Bucket {
        total_count: u64,
        wash_count: u64,
        total_volume: Decimal,
        wash_volume: Decimal,
    }

    let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
    for t in trades {
        let key = t.timestamp.div_euclid(interval) * interval;
        let b = buckets.entry(key).or_default();
        b.total_count += 1;
        b.total_volume += t.volume;
        if t.is_wash {
            b.wash_count += 1;
            b.wash_volume += t.volume;
        }
    }

    Ok(Json(
        buckets
            .into_iter()
            .map(|(ts, b)| {
                serde_json::json!({
                    "timestamp": ts,
                    "total_count": b.total_count,
                    "wash_count": b.wash_count,
                    "total_volume": b.total_volume,
                    "wash_volume": b.wash_volume,
                })
            })
            .collect(),
    ))
}

/// GET /api/trades/by-hash/:tx_hash
pub async fn by_hash(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<Vec<TradeView>>> {
    let hash = B256::from_str(&tx_hash)
        .map_err(|e| AppError::InvalidRequest(format!("bad tx hash: {e}")))?;
    let trades = state.store.trades_by_hash(hash);
    if trades.is_empty() {
        return Err(AppError::NotFound(format!("no trades for {tx_hash}")));
    }
    Ok(Json(
        trades
            .into_iter()
            .map(|t| trade_view(t, &state.resolver))
            .collect(),
    ))
}

/// GET /api/trades/by-address/:address
pub async fn by_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<TradesQuery>,
) -> Result<Json<serde_json::Value>> {
    let addr = Address::from_str(&address)
        .map_err(|e| AppError::InvalidRequest(format!("bad address: {e}")))?;
    let limit = q.limit.unwrap_or(100).clamp(1, 1_000);

    let trades = state.store.query_trades(&TradeFilter {
        address: Some(addr),
        is_wash: q.is_wash,
        limit,
        ..Default::default()
    });

    let total_volume: Decimal = trades.iter().map(|t| t.volume).sum();
    let buy_count = trades.iter().filter(|t| t.side == Side::Buy).count();
    let sell_count = trades.iter().filter(|t| t.side == Side::Sell).count();
    let wash_count = trades.iter().filter(|t| t.is_wash).count();
    let count = trades.len();

    let views: Vec<TradeView> = trades
        .into_iter()
        .map(|t| trade_view(t, &state.resolver))
        .collect();

    Ok(Json(serde_json::json!({
        "address": addr,
        "trades": views,
        "stats": {
            "total_trades": count,
            "total_volume": total_volume,
            "buy_count": buy_count,
            "sell_count": sell_count,
            "wash_count": wash_count,
        },
    })))
}

async fn analysis(state: &AppState, name: &'static str) -> Json<AnalysisResponse> {
    let evidence = run_detectors_on_ring(&state.store, &[name], SCAN_DEADLINE).await;
    Json(AnalysisResponse {
        analysis_type: name.to_string(),
        count: evidence.len(),
        evidence,
    })
}

pub async fn analysis_insider(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "insider").await
}

pub async fn analysis_high_winrate(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "high-winrate").await
}

pub async fn analysis_gas_anomaly(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "gas-anomaly").await
}

pub async fn analysis_self_trades(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "self-trades").await
}

pub async fn analysis_circular_trades(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "circular-trades").await
}

pub async fn analysis_atomic_wash(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "atomic-wash").await
}

pub async fn analysis_volume_spikes(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "volume-spikes").await
}

pub async fn analysis_sybil_clusters(State(state): State<AppState>) -> Json<AnalysisResponse> {
    analysis(&state, "sybil-clusters").await
}

/// GET /api/trades/analysis/full — the three basic detectors in one pass.
pub async fn analysis_full(State(state): State<AppState>) -> Json<serde_json::Value> {
    let names = ["insider", "high-winrate", "gas-anomaly"];
    let evidence = run_detectors_on_ring(&state.store, &names, SCAN_DEADLINE).await;

    let mut by_type: BTreeMap<String, Vec<&crate::model::Evidence>> = BTreeMap::new();
    for e in &evidence {
        by_type.entry(e.kind.as_str().to_string()).or_default().push(e);
    }
    Json(serde_json::json!({
        "total": evidence.len(),
        "by_type": by_type,
    }))
}

/// GET /api/trades/analysis/advanced/market-health
pub async fn analysis_market_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let reports = health::all_reports(&state.store, Some(&state.resolver), health::MIN_TRADES);
    Json(serde_json::json!({
        "markets": reports.len(),
        "reports": reports,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FlaggedTxQuery {
    pub analysis_type: String,
}

/// GET /api/trades/analysis/flagged-tx — flat list of flagged transactions
/// with the addresses behind them.
pub async fn flagged_tx(
    State(state): State<AppState>,
    Query(q): Query<FlaggedTxQuery>,
) -> Result<Json<serde_json::Value>> {
    let known: Vec<&'static str> = crate::detect::all_detectors()
        .iter()
        .map(|d| d.name())
        .collect();
    let Some(name) = known.iter().find(|n| **n == q.analysis_type).copied() else {
        return Err(AppError::InvalidRequest(format!(
            "unknown analysis_type {:?}; expected one of {}",
            q.analysis_type,
            known.join(", ")
        )));
    };

    let evidence = run_detectors_on_ring(&state.store, &[name], QUERY_DEADLINE).await;
    let mut flagged: BTreeMap<B256, std::collections::BTreeSet<Address>> = BTreeMap::new();
    for e in &evidence {
        for tx in &e.tx_hashes {
            flagged.entry(*tx).or_default().extend(e.addresses.iter().copied());
        }
    }

    Ok(Json(serde_json::json!({
        "analysis_type": name,
        "count": flagged.len(),
        "flagged": flagged
            .into_iter()
            .map(|(tx, addrs)| serde_json::json!({
                "tx_hash": tx,
                "addresses": addrs,
            }))
            .collect::<Vec<_>>(),
    })))
}
