//! Axum REST surface under `/api`, plus the `/ws` stream endpoint.
//!
//! Handlers are read-mostly: they query the store/resolver or run an
//! on-demand detector pass over the full ring, and never touch background
//! state. Errors map to JSON `{error, detail}` bodies via `AppError`.

mod alerts;
mod markets;
mod system;
mod trades;

use alloy::primitives::U256;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::bus::AlertBus;
use crate::detect::{self, ScanCtx};
use crate::error::{AppError, Result};
use crate::model::{Evidence, Trade};
use crate::onchain::RpcClient;
use crate::resolver::MarketResolver;
use crate::store::EvidenceStore;
use crate::stream::StreamController;

/// The concrete controller the service runs.
pub type Controller = StreamController<RpcClient>;

/// Deadline for simple queries.
pub(crate) const QUERY_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for full detector scans.
pub(crate) const SCAN_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EvidenceStore>,
    pub resolver: Arc<MarketResolver>,
    pub controller: Arc<Controller>,
    pub bus: Arc<AlertBus>,
    pub pool: SqlitePool,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/trades", get(trades::list))
        .route("/trades/timeline", get(trades::timeline))
        .route("/trades/by-hash/:tx_hash", get(trades::by_hash))
        .route("/trades/by-address/:address", get(trades::by_address))
        .route("/trades/analysis/insider", get(trades::analysis_insider))
        .route(
            "/trades/analysis/high-winrate",
            get(trades::analysis_high_winrate),
        )
        .route(
            "/trades/analysis/gas-anomaly",
            get(trades::analysis_gas_anomaly),
        )
        .route("/trades/analysis/full", get(trades::analysis_full))
        .route(
            "/trades/analysis/advanced/self-trades",
            get(trades::analysis_self_trades),
        )
        .route(
            "/trades/analysis/advanced/circular-trades",
            get(trades::analysis_circular_trades),
        )
        .route(
            "/trades/analysis/advanced/atomic-wash",
            get(trades::analysis_atomic_wash),
        )
        .route(
            "/trades/analysis/advanced/volume-spikes",
            get(trades::analysis_volume_spikes),
        )
        .route(
            "/trades/analysis/advanced/sybil-clusters",
            get(trades::analysis_sybil_clusters),
        )
        .route(
            "/trades/analysis/advanced/market-health",
            get(trades::analysis_market_health),
        )
        .route("/trades/analysis/flagged-tx", get(trades::flagged_tx))
        .route("/markets", get(markets::list))
        .route("/markets/hot", get(markets::hot))
        .route("/markets/:token_id", get(markets::detail))
        .route("/alerts", get(alerts::list))
        .route("/alerts/recent", get(alerts::recent))
        .route("/alerts/stats", get(alerts::stats))
        .route("/alerts/:alert_id/acknowledge", post(alerts::acknowledge))
        .route("/system/stats", get(system::stats))
        .route("/system/health", get(system::health))
        .route("/system/fetch", post(system::fetch))
        .route("/system/stream/start", post(system::stream_start))
        .route("/system/stream/stop", post(system::stream_stop))
        .route("/system/stream/status", get(system::stream_status));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(crate::ws::websocket_handler))
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Shared helpers ───────────────────────────────────────────────────────

pub(crate) fn parse_token_id(raw: &Option<String>) -> Result<Option<U256>> {
    match raw {
        None => Ok(None),
        Some(s) => U256::from_str(s)
            .map(Some)
            .map_err(|e| AppError::InvalidRequest(format!("bad token_id: {e}"))),
    }
}

/// A trade enriched with market metadata and explorer links for API
/// consumers.
#[derive(Debug, Serialize)]
pub(crate) struct TradeView {
    #[serde(flatten)]
    pub trade: Trade,
    pub market_name: String,
    pub market_slug: Option<String>,
    pub polymarket_url: Option<String>,
    pub polygonscan_url: String,
}

pub(crate) fn trade_view(trade: Trade, resolver: &MarketResolver) -> TradeView {
    let market = resolver.get(trade.token_id);
    let market_name = market
        .as_ref()
        .map(|m| m.display_name())
        .unwrap_or_else(|| {
            crate::resolver::MarketInfo::unknown(trade.token_id).display_name()
        });
    let slug = market.as_ref().and_then(|m| {
        if m.slug.is_empty() {
            None
        } else {
            Some(m.slug.clone())
        }
    });
    let polymarket_url = slug
        .as_ref()
        .map(|s| format!("https://polymarket.com/event/{s}"));
    let polygonscan_url = format!("https://polygonscan.com/tx/{}", trade.tx_hash);
    TradeView {
        trade,
        market_name,
        market_slug: slug,
        polymarket_url,
        polygonscan_url,
    }
}

/// Run the named detectors over a full-ring snapshot under a deadline.
/// A deadline hit cancels cooperatively and returns partial results.
pub(crate) async fn run_detectors_on_ring(
    store: &EvidenceStore,
    names: &[&str],
    deadline: Duration,
) -> Vec<Evidence> {
    let snapshot = store.snapshot(None);
    let ctx = ScanCtx::new();
    let cancel_ctx = ctx.clone();
    let wanted: Vec<String> = names.iter().map(|n| n.to_string()).collect();

    let worker = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for detector in detect::all_detectors() {
            if wanted.iter().any(|n| n == detector.name()) {
                out.extend(detector.scan(&snapshot, &ctx));
            }
        }
        out
    });

    tokio::pin!(worker);
    tokio::select! {
        joined = &mut worker => joined.unwrap_or_default(),
        _ = tokio::time::sleep(deadline) => {
            cancel_ctx.cancel();
            worker.await.unwrap_or_default()
        }
    }
}

/// Standard payload for the analysis endpoints.
#[derive(Debug, Serialize)]
pub(crate) struct AnalysisResponse {
    pub analysis_type: String,
    pub count: usize,
    pub evidence: Vec<Evidence>,
}
