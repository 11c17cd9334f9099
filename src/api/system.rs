//! System endpoints: counters, health probe, one-shot backfill, and the
//! stream controller lifecycle.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use std::time::Duration;

use super::AppState;
use crate::error::{AppError, Result};
use crate::model::SystemStats;

/// GET /api/system/stats
pub async fn stats(State(state): State<AppState>) -> Json<SystemStats> {
    let mut stats = state.store.stats();
    stats.is_streaming = state.controller.is_streaming();
    Json(stats)
}

/// GET /api/system/health — includes a live head probe with a short
/// timeout so a dead upstream cannot hang the endpoint.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let head = tokio::time::timeout(
        Duration::from_secs(5),
        state.controller.chain_ref().get_block_number(),
    )
    .await
    .ok()
    .and_then(|r| r.ok());

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "chain_connected": head.is_some(),
        "current_block": head.unwrap_or(0),
        "last_processed_block": state.controller.last_block(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    pub blocks: Option<u64>,
}

/// POST /api/system/fetch — one-shot backfill of the last N blocks.
pub async fn fetch(
    State(state): State<AppState>,
    Query(q): Query<FetchQuery>,
) -> Result<Json<serde_json::Value>> {
    let blocks = q.blocks.unwrap_or(100);
    if !(10..=1_000).contains(&blocks) {
        return Err(AppError::InvalidRequest("blocks must be in 10..=1000".into()));
    }

    let report = state.controller.backfill(blocks).await?;
    let stats = state.store.stats();

    Ok(Json(serde_json::json!({
        "success": true,
        "fetched_trades": report.trades,
        "position_events": report.position_events,
        "malformed": report.malformed,
        "current_stats": {
            "total_trades": stats.total_trades,
            "total_alerts": stats.total_alerts,
            "wash_trade_count": stats.wash_trade_count,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct StreamStartQuery {
    pub poll_interval: Option<f64>,
    pub blocks_per_poll: Option<u64>,
}

/// POST /api/system/stream/start
pub async fn stream_start(
    State(state): State<AppState>,
    Query(q): Query<StreamStartQuery>,
) -> Result<Json<serde_json::Value>> {
    let poll_interval = q.poll_interval.unwrap_or(15.0);
    if !(1.0..=300.0).contains(&poll_interval) {
        return Err(AppError::InvalidRequest(
            "poll_interval must be in 1..=300 seconds".into(),
        ));
    }
    let blocks_per_poll = q.blocks_per_poll.unwrap_or(20);
    if !(1..=1_000).contains(&blocks_per_poll) {
        return Err(AppError::InvalidRequest(
            "blocks_per_poll must be in 1..=1000".into(),
        ));
    }

    let started = state
        .controller
        .start(Duration::from_secs_f64(poll_interval), blocks_per_poll);

    Ok(Json(serde_json::json!({
        "status": if started { "started" } else { "already_streaming" },
        "poll_interval": poll_interval,
        "blocks_per_poll": blocks_per_poll,
    })))
}

/// POST /api/system/stream/stop
pub async fn stream_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stopped = state.controller.stop().await;
    Json(serde_json::json!({
        "status": if stopped { "stopped" } else { "not_streaming" },
    }))
}

/// GET /api/system/stream/status
pub async fn stream_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "lifecycle": state.controller.lifecycle(),
        "is_streaming": state.controller.is_streaming(),
        "last_processed_block": state.controller.last_block(),
    }))
}
