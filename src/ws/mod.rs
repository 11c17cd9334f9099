//! WebSocket endpoint: pushes every bus event to the client as a
//! `{type, data, timestamp}` envelope and answers a small command set.
//!
//! Each connection owns one bus subscription. When the subscriber's bounded
//! queue overflowed while the client lagged, a `resync` marker is emitted
//! as soon as it catches up so the client knows to refetch via REST.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::AppState;
use crate::bus::BusEvent;
use crate::store::{AlertFilter, TradeFilter};

#[derive(Debug, Deserialize)]
struct ClientCommand {
    cmd: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn envelope(kind: &str, data: serde_json::Value) -> String {
    serde_json::json!({
        "type": kind,
        "data": data,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut subscription = state.bus.subscribe();
    let (mut sink, mut source) = socket.split();
    info!(subscriber = subscription.id, "websocket client connected");

    // Initial hello with current counters.
    let mut stats = state.store.stats();
    stats.is_streaming = state.controller.is_streaming();
    let hello = envelope(
        "connected",
        serde_json::json!({
            "message": "connected to the forensics stream",
            "stats": stats,
        }),
    );
    if sink.send(Message::Text(hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                if let Some(dropped) = subscription.pending_resync() {
                    let marker = envelope("resync", serde_json::json!({ "dropped": dropped }));
                    if sink.send(Message::Text(marker)).await.is_err() {
                        break;
                    }
                }
                let frame = envelope(event.kind(), event.data_json());
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_command(&state, &text) {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!(
        subscriber = subscription.id,
        dropped = subscription.dropped_total(),
        "websocket client disconnected"
    );
}

fn handle_command(state: &AppState, text: &str) -> Option<String> {
    let Ok(command) = serde_json::from_str::<ClientCommand>(text) else {
        return Some(envelope(
            "error",
            serde_json::json!({ "message": "invalid JSON command" }),
        ));
    };

    match command.cmd.as_str() {
        "ping" => Some(envelope("pong", BusEvent::Pong.data_json())),
        "get_stats" => {
            let mut stats = state.store.stats();
            stats.is_streaming = state.controller.is_streaming();
            Some(envelope(
                "stats",
                serde_json::to_value(stats).unwrap_or_default(),
            ))
        }
        "get_recent_trades" => {
            let trades = state.store.query_trades(&TradeFilter {
                limit: command.limit.unwrap_or(10).clamp(1, 100),
                ..Default::default()
            });
            Some(envelope(
                "recent_trades",
                serde_json::to_value(trades).unwrap_or_default(),
            ))
        }
        "get_recent_alerts" => {
            let alerts = state.store.query_alerts(&AlertFilter {
                limit: command.limit.unwrap_or(10).clamp(1, 100),
                ..Default::default()
            });
            Some(envelope(
                "recent_alerts",
                serde_json::to_value(alerts).unwrap_or_default(),
            ))
        }
        other => Some(envelope(
            "error",
            serde_json::json!({ "message": format!("unknown command {other:?}") }),
        )),
    }
}
