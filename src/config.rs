//! Configuration management for the MFC gateway
//!
//! Loads configuration from config.toml with environment variable overrides

use crate::dispatch::CommitPolicy;
use crate::downlink::DeviceTarget;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network_server: NetworkServerConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub devices: Vec<DeviceConfig>,
}

/// LoRaWAN network server (uplink integration + downlink API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkServerConfig {
    /// Base API URL, e.g. "https://eu1.cloud.thethings.network/api/v3"
    pub api_url: String,
    pub api_key: String,
    #[serde(default = "default_downlink_timeout_secs")]
    pub downlink_timeout_secs: u64,
    /// MQTT integration URL for uplinks
    pub mqtt_url: String,
    /// MQTT integration username, usually "{application}@{tenant}"
    pub mqtt_username: String,
    #[serde(default = "default_ingest_client_id")]
    pub client_id: String,
}

/// Local MQTT bus for events and operator commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
}

/// Gateway behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub channel_capacity: usize,
    #[serde(default)]
    pub commit_policy: CommitPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            commit_policy: CommitPolicy::default(),
        }
    }
}

/// One managed MFC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device index carried in status frames and setpoint commands
    pub index: u8,
    /// Topic segment, e.g. "mfc1"
    pub name: String,
    pub application_id: String,
    pub device_id: String,
}

fn default_downlink_timeout_secs() -> u64 {
    5
}

fn default_ingest_client_id() -> String {
    "mfc-gateway-ingest".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Environment variables override config file values:
    /// - NETWORK_SERVER_API_KEY: Override the network server API key
    pub fn load(path: &str) -> Result<Self> {
        // Read config file
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Parse TOML
        let mut config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        // Override with environment variables
        if let Ok(key) = std::env::var("NETWORK_SERVER_API_KEY") {
            tracing::info!("Using NETWORK_SERVER_API_KEY from environment");
            config.network_server.api_key = key;
        }

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        // Validate MQTT QoS
        if self.mqtt.qos > 2 {
            anyhow::bail!("Invalid MQTT QoS level: {} (must be 0, 1, or 2)", self.mqtt.qos);
        }

        // Validate URLs
        for url in [&self.mqtt.broker_url, &self.network_server.mqtt_url] {
            if !url.starts_with("mqtt://") && !url.starts_with("mqtts://") {
                anyhow::bail!("Invalid MQTT broker URL: {} (must start with mqtt:// or mqtts://)", url);
            }
        }

        if !self.network_server.api_url.starts_with("http://")
            && !self.network_server.api_url.starts_with("https://")
        {
            anyhow::bail!(
                "Invalid network server API URL: {} (must start with http:// or https://)",
                self.network_server.api_url
            );
        }

        if self.network_server.api_key.is_empty() {
            anyhow::bail!("Network server api_key is empty (set it or NETWORK_SERVER_API_KEY)");
        }

        if self.network_server.downlink_timeout_secs == 0 {
            anyhow::bail!("network_server.downlink_timeout_secs must be greater than 0");
        }

        // Validate channel capacity
        if self.gateway.channel_capacity == 0 {
            anyhow::bail!("Gateway channel_capacity must be greater than 0");
        }

        // Validate devices
        if self.devices.is_empty() {
            anyhow::bail!("At least one [[devices]] entry is required");
        }
        let mut indices = HashSet::new();
        let mut names = HashSet::new();
        for device in &self.devices {
            if !indices.insert(device.index) {
                anyhow::bail!("Duplicate device index: {}", device.index);
            }
            if device.name.is_empty() || device.name.contains('/') {
                anyhow::bail!("Invalid device name: {:?}", device.name);
            }
            if !names.insert(device.name.as_str()) {
                anyhow::bail!("Duplicate device name: {}", device.name);
            }
        }

        Ok(())
    }

    pub fn downlink_timeout(&self) -> Duration {
        Duration::from_secs(self.network_server.downlink_timeout_secs)
    }

    pub fn device_indices(&self) -> Vec<u8> {
        self.devices.iter().map(|d| d.index).collect()
    }

    /// Network-server identity per device index
    pub fn downlink_targets(&self) -> HashMap<u8, DeviceTarget> {
        self.devices
            .iter()
            .map(|d| {
                (
                    d.index,
                    DeviceTarget {
                        application_id: d.application_id.clone(),
                        device_id: d.device_id.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn device_by_name(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_by_index(&self, index: u8) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.index == index)
    }
}
