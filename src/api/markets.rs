//! Market listing endpoints: store aggregates joined with resolver
//! metadata.

use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::AppState;
use crate::error::{AppError, Result};
use crate::health;
use crate::model::u256_dec;
use crate::store::MarketAggregate;

#[derive(Debug, Serialize)]
pub struct MarketSummary {
    #[serde(with = "u256_dec")]
    pub token_id: alloy::primitives::U256,
    pub question: String,
    pub outcome: String,
    pub slug: Option<String>,
    pub polymarket_url: Option<String>,
    pub status: String,
    pub total_trades: u64,
    pub wash_trades: u64,
    pub total_volume: Decimal,
    pub wash_volume: Decimal,
    pub wash_ratio: f64,
    pub unique_traders: u64,
}

fn summarize(state: &AppState, agg: &MarketAggregate) -> MarketSummary {
    let market = state.resolver.get(agg.token_id);
    let (question, outcome, slug, status) = match &market {
        Some(m) if m.is_resolved() => (
            m.question.clone(),
            m.outcome.clone(),
            if m.slug.is_empty() {
                None
            } else {
                Some(m.slug.clone())
            },
            m.status.clone(),
        ),
        _ => (
            crate::resolver::MarketInfo::unknown(agg.token_id).display_name(),
            String::new(),
            None,
            "unknown".to_string(),
        ),
    };
    MarketSummary {
        token_id: agg.token_id,
        question,
        outcome,
        polymarket_url: slug
            .as_ref()
            .map(|s| format!("https://polymarket.com/event/{s}")),
        slug,
        status,
        total_trades: agg.trade_count,
        wash_trades: agg.wash_count,
        total_volume: agg.volume,
        wash_volume: agg.wash_volume,
        wash_ratio: if agg.trade_count > 0 {
            agg.wash_count as f64 / agg.trade_count as f64
        } else {
            0.0
        },
        unique_traders: agg.unique_traders,
    }
}

#[derive(Debug, Deserialize)]
pub struct MarketsQuery {
    pub limit: Option<usize>,
}

/// GET /api/markets — every market seen by the store, largest volume first.
pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<MarketsQuery>,
) -> Json<Vec<MarketSummary>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1_000);
    Json(
        state
            .store
            .market_aggregates()
            .iter()
            .take(limit)
            .map(|agg| summarize(&state, agg))
            .collect(),
    )
}

/// GET /api/markets/hot — top markets by traded volume.
pub async fn hot(State(state): State<AppState>) -> Json<Vec<MarketSummary>> {
    Json(
        state
            .store
            .market_aggregates()
            .iter()
            .take(10)
            .map(|agg| summarize(&state, agg))
            .collect(),
    )
}

/// GET /api/markets/:token_id — detail plus health report.
pub async fn detail(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let token = alloy::primitives::U256::from_str(&token_id)
        .map_err(|e| AppError::InvalidRequest(format!("bad token_id: {e}")))?;

    let aggregates = state.store.market_aggregates();
    let aggregate = aggregates.iter().find(|a| a.token_id == token);
    let market = state.resolver.get(token);
    if aggregate.is_none() && market.is_none() {
        return Err(AppError::NotFound(format!("unknown market {token_id}")));
    }

    let summary = aggregate.map(|agg| summarize(&state, agg));
    let health_report = aggregate.map(|agg| {
        let evidence: Vec<_> = state
            .store
            .evidence_all()
            .into_iter()
            .filter(|e| e.token_id == Some(token))
            .collect();
        health::report_for_market(agg, &evidence, Some(state.resolver.display_name(token)))
    });

    Ok(Json(serde_json::json!({
        "token_id": token.to_string(),
        "market": market.map(|m| serde_json::json!({
            "question": m.question,
            "outcome": m.outcome,
            "slug": m.slug,
            "status": m.status,
            "condition_id": m.condition_id,
            "yes_token_id": m.yes_token_id.map(|t| t.to_string()),
            "no_token_id": m.no_token_id.map(|t| t.to_string()),
        })),
        "summary": summary,
        "health": health_report,
    })))
}
