//! In-process pub/sub for durable anomalies.
//!
//! Publishers are the scheduler's detection loop; subscribers are websocket
//! handlers. The broadcast channel's bounded per-subscriber queue doubles as
//! slow-consumer detection: a receiver that lags is disconnected rather than
//! allowed to stall the publisher.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use headway_core::{Anomaly, AnomalyKind};

/// Per-subscriber queue depth; saturation means `slow_consumer`.
pub const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub enum BusEvent {
    Anomaly(Arc<Anomaly>),
    /// Process is draining; subscribers close with reason `shutdown`.
    Shutdown,
}

#[derive(Clone)]
pub struct AnomalyBus {
    tx: broadcast::Sender<BusEvent>,
    connections: Arc<AtomicU32>,
    max_connections: u32,
}

impl AnomalyBus {
    pub fn new(max_connections: u32) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        AnomalyBus {
            tx,
            connections: Arc::new(AtomicU32::new(0)),
            max_connections,
        }
    }

    /// Publish a durably-stored anomaly. Returns receiver count.
    pub fn publish(&self, anomaly: Arc<Anomaly>) -> usize {
        self.tx.send(BusEvent::Anomaly(anomaly)).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BusEvent::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Reserve a connection slot; None when at `WS_MAX_CONNECTIONS`.
    pub fn try_connect(&self) -> Option<ConnectionGuard> {
        let prev = self.connections.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_connections {
            self.connections.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ConnectionGuard {
            connections: Arc::clone(&self.connections),
        })
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Releases the connection slot on drop.
pub struct ConnectionGuard {
    connections: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Subscriber filters ────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberFilter {
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub severity_min: Option<f64>,
    #[serde(default)]
    pub kinds: Option<Vec<AnomalyKind>>,
}

impl SubscriberFilter {
    pub fn matches(&self, anomaly: &Anomaly) -> bool {
        if let Some(line) = &self.line {
            if anomaly.route_id.as_deref() != Some(line.as_str()) {
                return false;
            }
        }
        if let Some(station) = &self.station {
            if anomaly.station_id.as_deref() != Some(station.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.severity_min {
            if anomaly.severity < min {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&anomaly.kind) {
                return false;
            }
        }
        true
    }
}

// ── Wire envelope ─────────────────────────────────────────────

/// `{type, timestamp, data?}` envelope for every websocket message.
#[derive(Serialize)]
struct WsEnvelope<T: Serialize> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

pub fn ws_json<T: Serialize>(msg_type: &'static str, data: Option<T>) -> String {
    serde_json::to_string(&WsEnvelope {
        msg_type,
        timestamp: Utc::now(),
        data,
    })
    .unwrap_or_default()
}

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        filters: SubscriberFilter,
    },
    Ping,
}
