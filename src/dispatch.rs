//! Operator command dispatch
//!
//! Turns operator intents into downlink frames, hands them to a
//! [`DownlinkSink`] and commits the intended state to the [`DeviceStore`].
//! The store lock is never held while a delivery is in flight.

use crate::codec::{self, DownlinkCommand, PowerAction, DOWNLINK_PORT};
use crate::downlink::DownlinkSink;
use crate::error::{GatewayError, Result};
use crate::store::DeviceStore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

/// When commanded state is written to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Write before delivery; a failed delivery is reported but not rolled back.
    #[default]
    Optimistic,
    /// Write only after the network server accepted the downlink.
    Confirmed,
}

/// A parsed operator request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    Power(PowerAction),
    Setpoint(f32),
}

impl FromStr for OperatorCommand {
    type Err = GatewayError;

    /// `on`, `off`, `toggle` or a finite number.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "on" => return Ok(OperatorCommand::Power(PowerAction::On)),
            "off" => return Ok(OperatorCommand::Power(PowerAction::Off)),
            "toggle" => return Ok(OperatorCommand::Power(PowerAction::Toggle)),
            _ => {}
        }

        let value: f32 = s
            .parse()
            .map_err(|_| GatewayError::InvalidValue(format!("not a command or number: {s:?}")))?;
        if !value.is_finite() {
            return Err(GatewayError::InvalidValue(format!("setpoint must be finite: {s:?}")));
        }
        Ok(OperatorCommand::Setpoint(value))
    }
}

/// Sends operator commands to devices.
#[derive(Clone)]
pub struct CommandDispatcher {
    store: DeviceStore,
    sink: Arc<dyn DownlinkSink>,
    policy: CommitPolicy,
}

impl CommandDispatcher {
    pub fn new(store: DeviceStore, sink: Arc<dyn DownlinkSink>, policy: CommitPolicy) -> Self {
        Self {
            store,
            sink,
            policy,
        }
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    /// Dispatch a parsed operator command to one device.
    pub async fn dispatch(&self, device_index: u8, command: OperatorCommand) -> Result<()> {
        match command {
            OperatorCommand::Power(action) => self.dispatch_power(device_index, action).await,
            OperatorCommand::Setpoint(value) => self.dispatch_setpoint(device_index, value).await,
        }
    }

    /// Switch a device on, off, or toggle it.
    pub async fn dispatch_power(&self, device_index: u8, action: PowerAction) -> Result<()> {
        let payload = codec::encode(&DownlinkCommand::Power(action))?;

        if self.policy == CommitPolicy::Optimistic {
            self.store.apply_power(device_index, action).await;
        }

        self.deliver(device_index, &payload).await?;

        if self.policy == CommitPolicy::Confirmed {
            self.store.apply_power(device_index, action).await;
        }

        info!(device = device_index, ?action, "Power command sent");
        Ok(())
    }

    /// Send a new flow setpoint to a device.
    pub async fn dispatch_setpoint(&self, device_index: u8, value: f32) -> Result<()> {
        let payload = codec::encode(&DownlinkCommand::Setpoint {
            device_index,
            value,
        })?;

        if self.policy == CommitPolicy::Optimistic {
            self.store.apply_setpoint_command(device_index, value).await;
        }

        self.deliver(device_index, &payload).await?;

        if self.policy == CommitPolicy::Confirmed {
            self.store.apply_setpoint_command(device_index, value).await;
        }

        info!(device = device_index, setpoint = value, "Setpoint command sent");
        Ok(())
    }

    async fn deliver(&self, device_index: u8, payload: &[u8]) -> Result<()> {
        self.sink
            .deliver(device_index, payload, DOWNLINK_PORT)
            .await
            .map_err(|e| {
                error!(device = device_index, error = %e, "Downlink delivery failed");
                match e {
                    GatewayError::DeliveryFailed(_) => e,
                    other => GatewayError::DeliveryFailed(other.to_string()),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Records deliveries, optionally failing every one of them.
    #[derive(Default)]
    struct FakeSink {
        fail: bool,
        sent: Mutex<Vec<(u8, Vec<u8>, u8)>>,
    }

    #[async_trait]
    impl DownlinkSink for FakeSink {
        async fn deliver(&self, device_index: u8, payload: &[u8], port: u8) -> Result<()> {
            self.sent.lock().await.push((device_index, payload.to_vec(), port));
            if self.fail {
                Err(GatewayError::DeliveryFailed("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(fail: bool, policy: CommitPolicy) -> (CommandDispatcher, DeviceStore, Arc<FakeSink>) {
        let store = DeviceStore::new([0, 1, 2]);
        let sink = Arc::new(FakeSink {
            fail,
            ..Default::default()
        });
        let dispatcher = CommandDispatcher::new(store.clone(), sink.clone(), policy);
        (dispatcher, store, sink)
    }

    #[test]
    fn test_parse_operator_command() {
        assert_eq!(
            "on".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Power(PowerAction::On)
        );
        assert_eq!(
            " Toggle\n".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Power(PowerAction::Toggle)
        );
        assert_eq!(
            "off".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Power(PowerAction::Off)
        );
        assert_eq!(
            "12.5".parse::<OperatorCommand>().unwrap(),
            OperatorCommand::Setpoint(12.5)
        );
        for bad in ["", "abc", "NaN", "inf", "-infinity", "1.0.0"] {
            assert!(
                matches!(bad.parse::<OperatorCommand>(), Err(GatewayError::InvalidValue(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_power_frame_and_port() {
        let (dispatcher, store, sink) = setup(false, CommitPolicy::Optimistic);
        dispatcher.dispatch_power(0, PowerAction::On).await.unwrap();

        assert!(store.get(0).await.powered);
        assert_eq!(*sink.sent.lock().await, vec![(0, vec![0x01], 15)]);
    }

    #[tokio::test]
    async fn test_toggle_twice_restores_state() {
        for policy in [CommitPolicy::Optimistic, CommitPolicy::Confirmed] {
            let (dispatcher, store, _sink) = setup(false, policy);
            let original = store.get(1).await.powered;

            dispatcher.dispatch_power(1, PowerAction::Toggle).await.unwrap();
            assert_ne!(store.get(1).await.powered, original);
            dispatcher.dispatch_power(1, PowerAction::Toggle).await.unwrap();
            assert_eq!(store.get(1).await.powered, original);
        }
    }

    #[tokio::test]
    async fn test_setpoint_kept_when_delivery_fails() {
        let (dispatcher, store, sink) = setup(true, CommitPolicy::Optimistic);
        let result = dispatcher.dispatch_setpoint(2, 12.5).await;

        assert!(matches!(result, Err(GatewayError::DeliveryFailed(_))));
        assert_eq!(store.get(2).await.setpoint, 12.5);

        let result = dispatcher.dispatch_power(2, PowerAction::On).await;
        assert!(matches!(result, Err(GatewayError::DeliveryFailed(_))));
        assert!(store.get(2).await.powered);

        assert_eq!(
            *sink.sent.lock().await,
            vec![
                (2, vec![0x10, 0x02, 0x41, 0x48, 0x00, 0x00], 15),
                (2, vec![0x01], 15),
            ]
        );
    }

    #[tokio::test]
    async fn test_untracked_device_leaves_store_alone() {
        let (dispatcher, store, _sink) = setup(true, CommitPolicy::Optimistic);

        assert!(dispatcher.dispatch_setpoint(99, 1.0).await.is_err());
        assert!(dispatcher.dispatch_power(99, PowerAction::On).await.is_err());

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.devices.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(store.get(99).await, crate::store::DeviceState::default());
    }

    /// Never answers for device 0.
    struct StalledSink;

    #[async_trait]
    impl DownlinkSink for StalledSink {
        async fn deliver(&self, device_index: u8, _payload: &[u8], _port: u8) -> Result<()> {
            if device_index == 0 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_delivery_does_not_block_other_devices() {
        let store = DeviceStore::new([0, 1]);
        let dispatcher =
            CommandDispatcher::new(store.clone(), Arc::new(StalledSink), CommitPolicy::Confirmed);

        let stalled = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch_power(0, PowerAction::On).await }
        });
        tokio::task::yield_now().await;

        let other = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch_setpoint(1, 6.0).await }
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), other)
            .await
            .expect("command to device 1 should finish")
            .unwrap()
            .unwrap();

        assert_eq!(store.get(1).await.setpoint, 6.0);
        assert!(!store.get(0).await.powered);
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_confirmed_policy_skips_state_on_failure() {
        let (dispatcher, store, _sink) = setup(true, CommitPolicy::Confirmed);

        assert!(dispatcher.dispatch_setpoint(0, 3.0).await.is_err());
        assert!(dispatcher.dispatch_power(0, PowerAction::On).await.is_err());

        let state = store.get(0).await;
        assert_eq!(state.setpoint, 0.0);
        assert!(!state.powered);
    }

    #[tokio::test]
    async fn test_invalid_setpoint_never_reaches_sink() {
        let (dispatcher, store, sink) = setup(false, CommitPolicy::Optimistic);
        let result = dispatcher.dispatch_setpoint(0, f32::NAN).await;

        assert!(matches!(result, Err(GatewayError::InvalidValue(_))));
        assert!(sink.sent.lock().await.is_empty());
        assert_eq!(store.get(0).await.setpoint, 0.0);
    }

    #[tokio::test]
    async fn test_dispatch_parsed_command() {
        let (dispatcher, store, _sink) = setup(false, CommitPolicy::Optimistic);
        dispatcher
            .dispatch(1, "7.25".parse().unwrap())
            .await
            .unwrap();
        dispatcher.dispatch(1, "on".parse().unwrap()).await.unwrap();

        let state = store.get(1).await;
        assert_eq!(state.setpoint, 7.25);
        assert!(state.powered);
    }
}
