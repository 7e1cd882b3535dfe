//! MFC LoRaWAN Gateway Service
//!
//! This service:
//! - Subscribes to the network server's MQTT integration for MFC uplinks
//! - Decodes status/heartbeat/error frames and tracks per-device state
//! - Publishes decoded events and retained device state to the local MQTT bus
//! - Accepts operator commands from the bus and queues them as downlinks
//!
//! Architecture: network server MQTT → ingest → processor → hub → bus publisher
//!               bus commands → dispatcher → network server HTTP API

use anyhow::{Context, Result};
use clap::Parser;
use mfc_lorawan_gateway::config::Config;
use mfc_lorawan_gateway::events::{state_json, GatewayEvent};
use mfc_lorawan_gateway::ingest::ingest_notification;
use mfc_lorawan_gateway::mqtt::{InboundMessage, MqttClient, MqttSettings};
use mfc_lorawan_gateway::{
    CommandDispatcher, DeviceStore, EventHub, NetworkServerClient, OperatorCommand, StoreSnapshot,
    UplinkProcessor,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Uplink topic filter on the network server's MQTT integration
const UPLINK_TOPIC_FILTER: &str = "v3/+/devices/+/up";

#[derive(Debug, Parser)]
#[command(name = "mfc-lorawan-gateway", about = "LoRaWAN gateway for mass flow controllers")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Feed network server notifications into the uplink processor
async fn run_ingest(mut rx: mpsc::Receiver<InboundMessage>, processor: UplinkProcessor) {
    info!("Starting uplink ingestion");

    while let Some(message) = rx.recv().await {
        ingest_notification(&processor, &message.topic, &message.payload).await;
    }

    warn!("Uplink ingestion stopped");
}

/// Run one operator command and report the outcome on the bus
async fn handle_command(
    dispatcher: CommandDispatcher,
    store: DeviceStore,
    bus: Arc<MqttClient>,
    prefix: String,
    index: u8,
    name: String,
    text: String,
) {
    let result = match text.parse::<OperatorCommand>() {
        Ok(command) => {
            info!(device = %name, ?command, "Operator command");
            dispatcher.dispatch(index, command).await
        }
        Err(e) => Err(e),
    };

    let ack = match &result {
        Ok(()) => json!({ "ok": true }),
        Err(e) => {
            warn!(device = %name, error = %e, "Command rejected");
            json!({ "ok": false, "error": e.to_string() })
        }
    };

    let ack_topic = MqttClient::build_topic(&prefix, &name, "ack");
    if let Err(e) = bus.publish(&ack_topic, &ack.to_string(), false).await {
        error!(error = %e, "Failed to publish command ack");
    }

    let state = store.get(index).await;
    let gateway_time = store.snapshot().await.gateway_time;
    let state_topic = MqttClient::build_topic(&prefix, &name, "state");
    let payload = state_json(index, &state, gateway_time.as_deref()).to_string();
    if let Err(e) = bus.publish(&state_topic, &payload, true).await {
        error!(error = %e, "Failed to publish device state");
    }
}

/// Execute operator commands arriving on `{prefix}/{device}/set`
///
/// Each command runs in its own task so a slow delivery to one device does
/// not hold up commands to the others.
async fn run_commands(
    mut rx: mpsc::Receiver<InboundMessage>,
    dispatcher: CommandDispatcher,
    store: DeviceStore,
    bus: Arc<MqttClient>,
    config: Arc<Config>,
) {
    let prefix = config.mqtt.topic_prefix.as_str();
    info!(policy = ?dispatcher.policy(), "Starting command handler");

    while let Some(message) = rx.recv().await {
        let Some(device) = MqttClient::device_from_command_topic(prefix, &message.topic)
            .and_then(|name| config.device_by_name(name))
        else {
            warn!(topic = %message.topic, "Command for unknown device");
            continue;
        };

        tokio::spawn(handle_command(
            dispatcher.clone(),
            store.clone(),
            bus.clone(),
            prefix.to_string(),
            device.index,
            device.name.clone(),
            String::from_utf8_lossy(&message.payload).into_owned(),
        ));
    }

    warn!("Command handler stopped");
}

/// Publish retained state for every tracked device
async fn publish_snapshot(bus: &MqttClient, config: &Config, snapshot: &StoreSnapshot) -> Result<()> {
    for (index, state) in &snapshot.devices {
        let Some(device) = config.device_by_index(*index) else {
            continue;
        };
        let topic = MqttClient::build_topic(&config.mqtt.topic_prefix, &device.name, "state");
        let payload = state_json(*index, state, snapshot.gateway_time.as_deref()).to_string();
        bus.publish(&topic, &payload, true).await?;
    }
    Ok(())
}

/// Publish one decoded event, plus the device's new state when it has one
async fn publish_event(
    bus: &MqttClient,
    config: &Config,
    store: &DeviceStore,
    event: &GatewayEvent,
) -> Result<()> {
    let prefix = config.mqtt.topic_prefix.as_str();
    let device = event.device.and_then(|index| config.device_by_index(index));

    let topic = match device {
        Some(device) => MqttClient::build_topic(prefix, &device.name, "status"),
        None => format!("{}/events", prefix),
    };
    bus.publish(&topic, &event.to_json().to_string(), false).await?;

    if let Some(device) = device {
        let state = store.get(device.index).await;
        let gateway_time = store.snapshot().await.gateway_time;
        let topic = MqttClient::build_topic(prefix, &device.name, "state");
        let payload = state_json(device.index, &state, gateway_time.as_deref()).to_string();
        bus.publish(&topic, &payload, true).await?;
    }
    Ok(())
}

/// Relay hub events to the MQTT bus
async fn run_publisher(
    mut events: broadcast::Receiver<GatewayEvent>,
    bus: Arc<MqttClient>,
    store: DeviceStore,
    config: Arc<Config>,
) {
    info!("Starting event publisher");

    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = publish_event(&bus, &config, &store, &event).await {
                    error!(error = %e, "Failed to publish event to MQTT");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event publisher lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    info!("Event publisher stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("MFC LoRaWAN Gateway starting");

    // Load configuration
    let config = Arc::new(
        Config::load(&args.config).with_context(|| format!("Failed to load {}", args.config))?,
    );
    info!(devices = config.devices.len(), "Configuration loaded successfully");

    // Core state and event fan-out
    let store = DeviceStore::new(config.device_indices());
    let hub = EventHub::new(store.clone(), config.gateway.channel_capacity);
    let processor = UplinkProcessor::new(store.clone(), hub.clone(), config.device_indices());

    // Downlink delivery
    let downlink = NetworkServerClient::new(
        &config.network_server.api_url,
        &config.network_server.api_key,
        config.downlink_targets(),
        config.downlink_timeout(),
    );
    let dispatcher = CommandDispatcher::new(
        store.clone(),
        Arc::new(downlink),
        config.gateway.commit_policy,
    );

    // Local bus for events and operator commands
    let (bus, command_rx) = MqttClient::connect(MqttSettings {
        broker_url: config.mqtt.broker_url.clone(),
        client_id: config.mqtt.client_id.clone(),
        username: None,
        password: None,
        qos: config.mqtt.qos,
        subscriptions: vec![format!("{}/+/set", config.mqtt.topic_prefix)],
        inbound_capacity: config.gateway.channel_capacity,
    })
    .await
    .context("Failed to create MQTT bus client")?;
    let bus = Arc::new(bus);

    // Subscribe before ingestion starts so no uplink is missed
    let (snapshot, events) = hub.subscribe().await;
    if let Err(e) = publish_snapshot(&bus, &config, &snapshot).await {
        warn!(error = %e, "Failed to publish initial device state");
    }

    // Network server uplink integration
    let (_ingest_client, uplink_rx) = MqttClient::connect(MqttSettings {
        broker_url: config.network_server.mqtt_url.clone(),
        client_id: config.network_server.client_id.clone(),
        username: Some(config.network_server.mqtt_username.clone()),
        password: Some(config.network_server.api_key.clone()),
        qos: 0,
        subscriptions: vec![UPLINK_TOPIC_FILTER.to_string()],
        inbound_capacity: config.gateway.channel_capacity,
    })
    .await
    .context("Failed to create network server MQTT client")?;

    let publisher_handle = tokio::spawn(run_publisher(
        events,
        bus.clone(),
        store.clone(),
        config.clone(),
    ));
    let command_handle = tokio::spawn(run_commands(
        command_rx,
        dispatcher,
        store.clone(),
        bus.clone(),
        config.clone(),
    ));
    let ingest_handle = tokio::spawn(run_ingest(uplink_rx, processor));

    // Wait for Ctrl+C
    info!("Service running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully");
        }
        _ = ingest_handle => {
            warn!("Ingestion task ended unexpectedly");
        }
    }

    command_handle.abort();
    publisher_handle.abort();

    info!("MFC LoRaWAN Gateway stopped");
    Ok(())
}
