//! Downlink delivery through the network server's HTTP API
//!
//! Commands are queued with the application server's `down/replace` endpoint,
//! which drops anything still pending for the device and schedules the new
//! payload for its next receive window.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Anything that can get a payload to a device.
#[async_trait]
pub trait DownlinkSink: Send + Sync {
    async fn deliver(&self, device_index: u8, payload: &[u8], port: u8) -> Result<()>;
}

/// Network-server identity of a managed device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub application_id: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
struct DownlinkQueue<'a> {
    downlinks: Vec<QueuedDownlink<'a>>,
}

#[derive(Debug, Serialize)]
struct QueuedDownlink<'a> {
    frm_payload: String,
    f_port: u8,
    priority: &'a str,
}

/// HTTP client for the network server's downlink queue.
pub struct NetworkServerClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    targets: HashMap<u8, DeviceTarget>,
    request_timeout: Duration,
}

impl NetworkServerClient {
    /// Create a new downlink client
    ///
    /// # Arguments
    /// * `api_url` - Base API URL (e.g., "https://eu1.cloud.thethings.network/api/v3")
    /// * `api_key` - Bearer token with downlink rights
    /// * `targets` - Device index to application/device identifiers
    /// * `request_timeout` - Upper bound for one delivery attempt
    pub fn new(
        api_url: &str,
        api_key: &str,
        targets: HashMap<u8, DeviceTarget>,
        request_timeout: Duration,
    ) -> Self {
        info!(url = api_url, devices = targets.len(), "Creating network server client");

        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            targets,
            request_timeout,
        }
    }

    /// `down/replace` URL for a device index.
    pub fn replace_url(&self, device_index: u8) -> Result<String> {
        let target = self.targets.get(&device_index).ok_or_else(|| {
            GatewayError::DeliveryFailed(format!("no network server identity for device {device_index}"))
        })?;

        Ok(format!(
            "{}/as/applications/{}/devices/{}/down/replace",
            self.api_url, target.application_id, target.device_id
        ))
    }

    async fn post(&self, url: &str, body: &DownlinkQueue<'_>) -> Result<()> {
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send();

        let response = timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                GatewayError::DeliveryFailed(format!(
                    "request timeout after {}ms",
                    self.request_timeout.as_millis()
                ))
            })?
            .map_err(|e| GatewayError::DeliveryFailed(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::DeliveryFailed(format!(
                "network server returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DownlinkSink for NetworkServerClient {
    async fn deliver(&self, device_index: u8, payload: &[u8], port: u8) -> Result<()> {
        let url = self.replace_url(device_index)?;
        let body = queue_body(payload, port);

        debug!(url = %url, device = device_index, port, payload = ?payload, "Queueing downlink");
        self.post(&url, &body).await?;

        info!(device = device_index, port, len = payload.len(), "Downlink queued");
        Ok(())
    }
}

fn queue_body(payload: &[u8], port: u8) -> DownlinkQueue<'static> {
    DownlinkQueue {
        downlinks: vec![QueuedDownlink {
            frm_payload: BASE64.encode(payload),
            f_port: port,
            priority: "NORMAL",
        }],
    }
}
