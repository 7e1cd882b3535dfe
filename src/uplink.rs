//! Uplink processing
//!
//! Routes a raw uplink to a managed device, decodes it, commits the result to
//! the [`DeviceStore`] and hands the event to the [`EventHub`].

use crate::codec::{self, UplinkEvent, TAG_STATUS};
use crate::error::GatewayError;
use crate::events::{EventHub, GatewayEvent};
use crate::store::DeviceStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Which managed device a payload belongs to, judged from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Status frame for a managed device index
    Device(u8),
    /// Frame that carries no device index (heartbeat, error, unknown tags)
    Broadcast,
    /// Status frame naming an index nobody manages
    Unrouted(u8),
}

/// Classify a payload by its `[tag, index]` prefix.
pub fn classify(bytes: &[u8], managed: &BTreeSet<u8>) -> Route {
    match bytes {
        [TAG_STATUS, index, ..] if managed.contains(index) => Route::Device(*index),
        [TAG_STATUS, index, ..] => Route::Unrouted(*index),
        // Heartbeat and error frames carry no index; they go out unattributed.
        _ => Route::Broadcast,
    }
}

/// Consumes uplink payloads and keeps the store current.
#[derive(Debug, Clone)]
pub struct UplinkProcessor {
    store: DeviceStore,
    hub: EventHub,
    managed: BTreeSet<u8>,
}

impl UplinkProcessor {
    pub fn new(store: DeviceStore, hub: EventHub, managed: impl IntoIterator<Item = u8>) -> Self {
        Self {
            store,
            hub,
            managed: managed.into_iter().collect(),
        }
    }

    /// Record the network server's reception time for the latest uplink,
    /// exactly as it was reported.
    pub async fn record_gateway_time(&self, received_at: &str) {
        self.store.set_gateway_time(received_at).await;
    }

    /// Process one uplink payload.
    ///
    /// Returns the event that was broadcast, if any. Bad frames are logged and
    /// dropped; this never fails the caller.
    pub async fn process(
        &self,
        bytes: &[u8],
        received_at: Option<DateTime<Utc>>,
    ) -> Option<GatewayEvent> {
        let route = classify(bytes, &self.managed);
        if let Route::Unrouted(index) = route {
            let err = GatewayError::UnroutedFrame {
                tag: TAG_STATUS,
                index,
            };
            debug!(error = %err, payload = ?bytes, "Dropping uplink");
            return None;
        }

        let event = match codec::decode(bytes) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(tag = ?bytes.first(), "Ignoring uplink with unknown tag");
                return None;
            }
            Err(e) => {
                warn!(error = %e, payload = ?bytes, "Undecodable uplink, keeping previous state");
                return None;
            }
        };

        let device = match route {
            Route::Device(index) => Some(index),
            _ => None,
        };

        if let (
            Some(index),
            UplinkEvent::Status {
                setpoint, flow, ..
            },
        ) = (device, event)
        {
            self.store.apply_status(index, setpoint, flow, bytes).await;
        }

        info!(
            kind = event.kind(),
            device = ?device,
            payload = ?bytes,
            "Uplink decoded"
        );

        let event = GatewayEvent {
            device,
            received_at,
            event,
        };
        self.hub.publish(event.clone());
        Some(event)
    }
}
