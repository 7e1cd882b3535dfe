//! MQTT client
//!
//! This module provides an async MQTT client that:
//! - Connects to a broker (network server integration or the local bus)
//! - Re-subscribes its topics on every (re)connect
//! - Forwards incoming publishes to a channel
//! - Publishes gateway events and acknowledgements

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection parameters for one broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    /// Topic filters to (re)subscribe after each ConnAck
    pub subscriptions: Vec<String>,
    pub inbound_capacity: usize,
}

/// MQTT client handle
pub struct MqttClient {
    client: AsyncClient,
    qos: QoS,
    _event_loop_handle: JoinHandle<()>,
}

impl MqttClient {
    /// Create a new MQTT client and connect to the broker
    ///
    /// Returns the client and a receiver yielding publishes on the subscribed
    /// topics.
    pub async fn connect(settings: MqttSettings) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        info!(
            broker = %settings.broker_url,
            client_id = %settings.client_id,
            subscriptions = settings.subscriptions.len(),
            "Connecting to MQTT broker"
        );

        let (host, port, tls) = parse_broker_url(&settings.broker_url)?;
        let qos = qos_level(settings.qos)?;

        let mut mqttoptions = MqttOptions::new(settings.client_id.as_str(), host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            mqttoptions.set_credentials(username.as_str(), password.as_str());
        }
        if tls {
            mqttoptions.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut event_loop) = AsyncClient::new(mqttoptions, 10);
        let (tx, rx) = mpsc::channel(settings.inbound_capacity);

        let subscriber = client.clone();
        let subscriptions = settings.subscriptions;
        let event_loop_handle = tokio::spawn(async move {
            info!("MQTT event loop started");
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        for topic in &subscriptions {
                            if let Err(e) = subscriber.subscribe(topic.as_str(), qos).await {
                                error!(topic = %topic, error = %e, "MQTT subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if !forward_inbound(&tx, message) {
                            warn!("Inbound receiver dropped, stopping MQTT event loop");
                            break;
                        }
                    }
                    Ok(notification) => {
                        debug!("MQTT notification: {:?}", notification);
                    }
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                qos,
                _event_loop_handle: event_loop_handle,
            },
            rx,
        ))
    }

    /// Publish a message to a topic
    ///
    /// # Arguments
    /// * `topic` - MQTT topic (e.g., "mfc/mfc1/status")
    /// * `payload` - Message payload as string
    /// * `retain` - Whether to retain this message on the broker
    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to topic: {}", topic))?;

        debug!(topic = topic, payload_len = payload.len(), "Published to MQTT");
        Ok(())
    }

    /// Build topic name for a device
    ///
    /// Topic hierarchy:
    /// - mfc/mfc1/set      operator command (on|off|toggle|<setpoint>)
    /// - mfc/mfc1/ack      command result
    /// - mfc/mfc1/status   decoded uplinks
    /// - mfc/mfc1/state    retained state snapshot
    /// - mfc/events        uplinks without a device (heartbeat, error)
    pub fn build_topic(prefix: &str, node: &str, metric: &str) -> String {
        format!("{}/{}/{}", prefix, node, metric)
    }

    /// Device name from a `{prefix}/{device}/set` topic.
    pub fn device_from_command_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(prefix)?
            .strip_prefix('/')?
            .strip_suffix("/set")
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }
}

/// Hand a received publish to the consumer without stalling the event loop.
///
/// A full channel drops the message so keep-alives and other topics keep
/// flowing. Returns `false` once the receiver is gone.
fn forward_inbound(tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(message)) => {
            warn!(topic = %message.topic, "Inbound channel full, dropping message");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Map a numeric QoS level
fn qos_level(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => anyhow::bail!("Invalid MQTT QoS level: {}", other),
    }
}

/// Parse MQTT broker URL into host, port and TLS flag
///
/// Supports:
/// - mqtt://localhost:1883
/// - mqtt://192.168.1.100:1883
/// - mqtts://eu1.cloud.thethings.network:8883
fn parse_broker_url(url: &str) -> Result<(String, u16, bool)> {
    let (rest, tls) = if let Some(rest) = url.strip_prefix("mqtt://") {
        (rest, false)
    } else if let Some(rest) = url.strip_prefix("mqtts://") {
        (rest, true)
    } else {
        anyhow::bail!("Invalid MQTT URL: must start with mqtt:// or mqtts://");
    };

    if let Some((host, port_str)) = rest.split_once(':') {
        let port = port_str
            .parse::<u16>()
            .context("Invalid port number in MQTT URL")?;
        Ok((host.to_string(), port, tls))
    } else {
        let port = if tls { 8883 } else { 1883 };
        Ok((rest.to_string(), port, tls))
    }
}
