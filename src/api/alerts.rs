//! Alert query endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::{parse_token_id, AppState};
use crate::error::{AppError, Result};
use crate::model::{Alert, EvidenceKind, Severity};
use crate::store::AlertFilter;

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub severity: Option<String>,
    pub alert_type: Option<String>,
    pub token_id: Option<String>,
    pub hours: Option<i64>,
}

fn build_filter(q: &AlertsQuery) -> Result<AlertFilter> {
    let kind = match &q.alert_type {
        None => None,
        Some(raw) => Some(
            EvidenceKind::from_str(raw)
                .map_err(|_| AppError::InvalidRequest(format!("bad alert_type: {raw}")))?,
        ),
    };
    let severity = match q.severity.as_deref() {
        None => None,
        Some("LOW") | Some("low") => Some(Severity::Low),
        Some("MEDIUM") | Some("medium") => Some(Severity::Medium),
        Some("HIGH") | Some("high") => Some(Severity::High),
        Some("CRITICAL") | Some("critical") => Some(Severity::Critical),
        Some(other) => {
            return Err(AppError::InvalidRequest(format!("bad severity: {other}")));
        }
    };
    let hours = q.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return Err(AppError::InvalidRequest("hours must be in 1..=168".into()));
    }
    Ok(AlertFilter {
        kind,
        severity,
        token_id: parse_token_id(&q.token_id)?,
        since: Some(chrono::Utc::now().timestamp() - hours * 3_600),
        limit: q.limit.unwrap_or(100).clamp(1, 1_000),
        offset: q.offset.unwrap_or(0),
    })
}

/// GET /api/alerts
pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>> {
    let filter = build_filter(&q)?;
    Ok(Json(state.store.query_alerts(&filter)))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// GET /api/alerts/recent — newest alerts for the dashboard feed.
pub async fn recent(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Json<Vec<Alert>> {
    let filter = AlertFilter {
        limit: q.limit.unwrap_or(10).clamp(1, 50),
        ..Default::default()
    };
    Json(state.store.query_alerts(&filter))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub hours: Option<i64>,
}

/// GET /api/alerts/stats — counts by type and severity plus an hourly
/// timeline.
pub async fn stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>> {
    let hours = q.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return Err(AppError::InvalidRequest("hours must be in 1..=168".into()));
    }
    let alerts = state.store.query_alerts(&AlertFilter {
        since: Some(chrono::Utc::now().timestamp() - hours * 3_600),
        limit: 10_000,
        ..Default::default()
    });

    #[derive(Default)]
    struct Tally {
        count: u64,
        volume: Decimal,
    }

    let mut by_type: BTreeMap<&'static str, Tally> = BTreeMap::new();
    let mut by_severity: BTreeMap<&'static str, Tally> = BTreeMap::new();
    let mut hourly: BTreeMap<i64, u64> = BTreeMap::new();
    let mut total_volume = Decimal::ZERO;

    for a in &alerts {
        let t = by_type.entry(a.kind.as_str()).or_default();
        t.count += 1;
        t.volume += a.volume;
        let s = by_severity.entry(a.severity.as_str()).or_default();
        s.count += 1;
        s.volume += a.volume;
        *hourly.entry(a.timestamp.div_euclid(3_600) * 3_600).or_insert(0) += 1;
        total_volume += a.volume;
    }

    let map_json = |m: BTreeMap<&'static str, Tally>| -> serde_json::Value {
        m.into_iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    serde_json::json!({ "count": v.count, "volume": v.volume }),
                )
            })
            .collect::<serde_json::Map<_, _>>()
            .into()
    };

    Ok(Json(serde_json::json!({
        "total_alerts": alerts.len(),
        "total_volume": total_volume,
        "by_type": map_json(by_type),
        "by_severity": map_json(by_severity),
        "hourly_timeline": hourly
            .into_iter()
            .map(|(ts, count)| serde_json::json!({ "timestamp": ts, "count": count }))
            .collect::<Vec<_>>(),
    })))
}

/// POST /api/alerts/:alert_id/acknowledge
pub async fn acknowledge(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let in_ring = state.store.acknowledge_alert(&alert_id);
    let in_db = crate::db::acknowledge_alert(&state.pool, &alert_id).await?;
    if !in_ring && !in_db {
        return Err(AppError::NotFound(format!("unknown alert {alert_id}")));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "alert_id": alert_id,
    })))
}
