//! Uplink notification parsing
//!
//! The network server reports each uplink as JSON, either through its MQTT
//! integration or a webhook:
//! ```text
//! {"uplink_message": {"received_at": "2024-05-01T10:00:00Z", "frm_payload": "IAA..."}}
//! ```
//! Only the reception time and the base64 payload are needed here.

use crate::error::{GatewayError, Result};
use crate::uplink::UplinkProcessor;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

/// Uplink notification envelope
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkNotification {
    pub uplink_message: UplinkMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkMessage {
    pub received_at: Option<String>,
    pub frm_payload: Option<String>,
}

impl UplinkNotification {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| GatewayError::MalformedFrame(format!("invalid uplink notification: {e}")))
    }

    /// Reception time, if present and parseable as RFC 3339.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.uplink_message.received_at.as_deref()?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(received_at = raw, error = %e, "Unparseable received_at");
                None
            }
        }
    }

    /// Decoded application payload. `Ok(None)` when the uplink carried none.
    pub fn payload(&self) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.uplink_message.frm_payload.as_deref() else {
            return Ok(None);
        };
        BASE64
            .decode(encoded)
            .map(Some)
            .map_err(|e| GatewayError::MalformedFrame(format!("frm_payload is not base64: {e}")))
    }
}

/// Device ID from an uplink topic `v3/{application}@{tenant}/devices/{device}/up`.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("v3"), Some(_), Some("devices"), Some(device), Some("up"), None) => Some(device),
        _ => None,
    }
}

/// Feed one notification body through the processor.
///
/// Malformed notifications are logged and dropped; the caller never sees an
/// error for bad device data.
pub async fn ingest_notification(processor: &UplinkProcessor, topic: &str, body: &[u8]) {
    let notification = match UplinkNotification::from_json(body) {
        Ok(n) => n,
        Err(e) => {
            warn!(topic = topic, error = %e, "Dropping notification");
            return;
        }
    };

    if let Some(raw) = notification.uplink_message.received_at.as_deref() {
        processor.record_gateway_time(raw).await;
    }

    let received_at = notification.received_at();
    let payload = match notification.payload() {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            debug!(topic = topic, "Uplink without application payload");
            return;
        }
        Err(e) => {
            warn!(topic = topic, error = %e, "Dropping notification");
            return;
        }
    };

    debug!(
        topic = topic,
        envelope_device = ?device_id_from_topic(topic),
        payload = ?payload,
        "Uplink notification"
    );
    processor.process(&payload, received_at).await;
}
