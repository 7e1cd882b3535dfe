//! In-memory device state
//!
//! One [`DeviceStore`] is built at startup and handed (cloned) to every task
//! that reads or mutates device state. All writes go through a single lock, so
//! concurrent uplinks and operator commands are applied one at a time.
//! The set of tracked devices is fixed at construction; writes for any other
//! index are ignored.

use crate::codec::PowerAction;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Last known state of one MFC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Raw bytes of the last status uplink routed to this device
    pub last_raw_payload: Option<Vec<u8>>,
    pub powered: bool,
    /// Measured flow in LN/min
    pub flow: f32,
    /// Setpoint in LN/min
    pub setpoint: f32,
}

/// Point-in-time copy of everything the store tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// `received_at` of the most recent uplink notification, as reported
    pub gateway_time: Option<String>,
    pub devices: BTreeMap<u8, DeviceState>,
}

/// Shared handle to the device state records.
#[derive(Debug, Clone, Default)]
pub struct DeviceStore {
    inner: Arc<RwLock<StoreSnapshot>>,
}

impl DeviceStore {
    /// Create a store tracking the given device indices, all at defaults.
    pub fn new(indices: impl IntoIterator<Item = u8>) -> Self {
        let devices = indices
            .into_iter()
            .map(|index| (index, DeviceState::default()))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(StoreSnapshot {
                gateway_time: None,
                devices,
            })),
        }
    }

    /// Current state of a device. Unknown indices read as defaults.
    pub async fn get(&self, index: u8) -> DeviceState {
        self.inner
            .read()
            .await
            .devices
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of every tracked device plus the gateway time.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.inner.read().await.clone()
    }

    /// Overwrite setpoint, flow and raw payload from a decoded status frame.
    pub async fn apply_status(&self, index: u8, setpoint: f32, flow: f32, raw_payload: &[u8]) {
        let mut guard = self.inner.write().await;
        let Some(state) = guard.devices.get_mut(&index) else {
            debug!(device = index, "Ignoring status for untracked device");
            return;
        };
        state.setpoint = setpoint;
        state.flow = flow;
        state.last_raw_payload = Some(raw_payload.to_vec());
        debug!(device = index, setpoint, flow, "Applied status");
    }

    /// Apply a power action and return the resulting power state, or `None`
    /// for an untracked device.
    pub async fn apply_power(&self, index: u8, action: PowerAction) -> Option<bool> {
        let mut guard = self.inner.write().await;
        let Some(state) = guard.devices.get_mut(&index) else {
            debug!(device = index, ?action, "Ignoring power for untracked device");
            return None;
        };
        state.powered = action.resolve(state.powered);
        debug!(device = index, ?action, powered = state.powered, "Applied power");
        Some(state.powered)
    }

    /// Record a setpoint the operator sent to the device.
    pub async fn apply_setpoint_command(&self, index: u8, value: f32) {
        let mut guard = self.inner.write().await;
        match guard.devices.get_mut(&index) {
            Some(state) => {
                state.setpoint = value;
                debug!(device = index, setpoint = value, "Applied setpoint command");
            }
            None => debug!(device = index, "Ignoring setpoint for untracked device"),
        }
    }

    pub async fn set_gateway_time(&self, received_at: &str) {
        self.inner.write().await.gateway_time = Some(received_at.to_string());
    }
}
