//! In-process broadcast of trade/alert/stats events to WebSocket
//! subscribers.
//!
//! Single producer side, many subscribers, each with its own bounded queue
//! of 64 slots. A full queue drops the event for that subscriber only and
//! bumps its dropped counter; the forwarder emits a `resync` marker once the
//! subscriber catches up so clients know to refetch. Per-kind FIFO holds
//! because each subscriber queue is FIFO.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{Alert, SystemStats, Trade};

/// Queue depth per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Events carried on the bus. `kind()` is the wire-level type tag.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BusEvent {
    NewTrade(Box<Trade>),
    NewAlert(Box<Alert>),
    Stats(Box<SystemStats>),
    AnalysisStats(serde_json::Value),
    SuspiciousTrade(serde_json::Value),
    Connected(serde_json::Value),
    Pong,
    /// Emitted to a subscriber whose queue overflowed; `dropped` is the
    /// number of events lost since the last marker.
    Resync { dropped: u64 },
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::NewTrade(_) => "new_trade",
            BusEvent::NewAlert(_) => "new_alert",
            BusEvent::Stats(_) => "stats",
            BusEvent::AnalysisStats(_) => "analysis_stats",
            BusEvent::SuspiciousTrade(_) => "suspicious_trade",
            BusEvent::Connected(_) => "connected",
            BusEvent::Pong => "pong",
            BusEvent::Resync { .. } => "resync",
        }
    }

    pub fn data_json(&self) -> serde_json::Value {
        match self {
            BusEvent::NewTrade(t) => serde_json::to_value(t).unwrap_or_default(),
            BusEvent::NewAlert(a) => serde_json::to_value(a).unwrap_or_default(),
            BusEvent::Stats(s) => serde_json::to_value(s).unwrap_or_default(),
            BusEvent::AnalysisStats(v)
            | BusEvent::SuspiciousTrade(v)
            | BusEvent::Connected(v) => v.clone(),
            BusEvent::Pong => serde_json::Value::Null,
            BusEvent::Resync { dropped } => serde_json::json!({ "dropped": dropped }),
        }
    }
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

/// One subscriber's end of the bus.
pub struct BusSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
    acknowledged_drops: u64,
}

impl BusSubscription {
    /// Number of events dropped since the last call; `Some` means a
    /// `resync` marker should be sent to the client.
    pub fn pending_resync(&mut self) -> Option<u64> {
        let total = self.dropped.load(Ordering::Relaxed);
        if total > self.acknowledged_drops {
            let delta = total - self.acknowledged_drops;
            self.acknowledged_drops = total;
            Some(delta)
        } else {
            None
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The fan-out hub.
pub struct AlertBus {
    subscribers: Mutex<Vec<SubscriberHandle>>,
    next_id: AtomicU64,
    total_dropped: AtomicU64,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .push(SubscriberHandle {
                id,
                tx,
                dropped: Arc::clone(&dropped),
            });
        debug!(subscriber = id, "bus subscriber attached");
        BusSubscription {
            id,
            rx,
            dropped,
            acknowledged_drops: 0,
        }
    }

    /// Deliver to every live subscriber; full queues drop instead of block.
    pub fn publish(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = sub.id, kind = event.kind(), "slow subscriber, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    /// Events dropped across all subscribers since startup.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}
