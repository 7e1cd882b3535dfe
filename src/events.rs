//! Event broadcast to live subscribers
//!
//! Delivery is best effort: a subscriber that lags or disconnects simply
//! misses events. New subscribers get a snapshot of the store first.

use crate::codec::{round2, UplinkEvent};
use crate::store::{DeviceState, DeviceStore, StoreSnapshot};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

/// Unit reported alongside flow and setpoint values.
pub const FLOW_UNIT: &str = "LN/min";

/// A decoded uplink as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    /// Device index the frame was routed to, if any
    pub device: Option<u8>,
    pub received_at: Option<DateTime<Utc>>,
    pub event: UplinkEvent,
}

impl GatewayEvent {
    /// JSON form used on the wire. Values are rounded to two decimals.
    pub fn to_json(&self) -> Value {
        let mut body = match self.event {
            UplinkEvent::Error { source, code } => json!({
                "type": "error",
                "errorSource": source,
                "errorCode": code,
            }),
            UplinkEvent::Heartbeat => json!({
                "type": "heartbeat",
                "message": "Device is alive",
            }),
            UplinkEvent::Status {
                device_index,
                setpoint,
                flow,
            } => json!({
                "type": "status",
                "mfcId": device_index,
                "setpoint": round2(setpoint),
                "flow": round2(flow),
                "unit": FLOW_UNIT,
            }),
        };

        if let Some(received_at) = self.received_at {
            body["receivedAt"] = json!(received_at.to_rfc3339());
        }
        body
    }
}

/// JSON form of one device's state, as retained for late subscribers.
/// `gateway_time` is passed through as the network server reported it.
pub fn state_json(index: u8, state: &DeviceState, gateway_time: Option<&str>) -> Value {
    json!({
        "mfcId": index,
        "powered": state.powered,
        "setpoint": round2(state.setpoint),
        "flow": round2(state.flow),
        "unit": FLOW_UNIT,
        "lastUplink": state.last_raw_payload,
        "gatewayTime": gateway_time,
    })
}

/// Fan-out point for decoded events.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<GatewayEvent>,
    store: DeviceStore,
}

impl EventHub {
    pub fn new(store: DeviceStore, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, store }
    }

    /// Push an event to everyone currently subscribed. Never blocks.
    pub fn publish(&self, event: GatewayEvent) {
        match self.tx.send(event) {
            Ok(receivers) => debug!(receivers, "Broadcast event"),
            Err(_) => debug!("No subscribers for event"),
        }
    }

    /// Subscribe to live events, starting from a snapshot of current state.
    pub async fn subscribe(&self) -> (StoreSnapshot, broadcast::Receiver<GatewayEvent>) {
        // Subscribe before reading so nothing published in between is lost.
        let rx = self.tx.subscribe();
        let snapshot = self.store.snapshot().await;
        (snapshot, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
