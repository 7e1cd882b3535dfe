//! MFC frame codec
//!
//! Pure translation between raw LoRaWAN payloads and typed events/commands.
//!
//! Uplink layouts (first byte is the tag):
//! ```text
//! 0x1F error      [tag, source, code]
//! 0x30 heartbeat  [tag, 0x00]
//! 0x20 status     [tag, index, setpoint f32 BE (4), flow f32 BE (4)]
//! ```
//!
//! Downlink layouts (always sent on [`DOWNLINK_PORT`]):
//! ```text
//! power     [action]                      0 = off, 1 = on, 2 = toggle
//! setpoint  [0x10, index, value f32 BE (4)]
//! ```

use crate::error::{GatewayError, Result};

/// Uplink tag for device error reports.
pub const TAG_ERROR: u8 = 0x1F;
/// Uplink tag for status (setpoint + flow) reports.
pub const TAG_STATUS: u8 = 0x20;
/// Uplink tag for heartbeats.
pub const TAG_HEARTBEAT: u8 = 0x30;
/// Downlink tag for setpoint commands.
pub const TAG_SETPOINT: u8 = 0x10;

/// LoRaWAN FPort used for every downlink command.
pub const DOWNLINK_PORT: u8 = 15;

pub const ERROR_FRAME_LEN: usize = 3;
pub const HEARTBEAT_FRAME_LEN: usize = 2;
pub const STATUS_FRAME_LEN: usize = 10;
pub const SETPOINT_COMMAND_LEN: usize = 6;

/// A decoded uplink frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UplinkEvent {
    Error { source: u8, code: u8 },
    Heartbeat,
    Status {
        device_index: u8,
        setpoint: f32,
        flow: f32,
    },
}

impl UplinkEvent {
    /// Short name used in logs and published payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            UplinkEvent::Error { .. } => "error",
            UplinkEvent::Heartbeat => "heartbeat",
            UplinkEvent::Status { .. } => "status",
        }
    }
}

/// Power command action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Toggle,
}

impl PowerAction {
    /// Wire byte for this action.
    pub fn code(self) -> u8 {
        match self {
            PowerAction::Off => 0,
            PowerAction::On => 1,
            PowerAction::Toggle => 2,
        }
    }

    /// Resulting power state when applied to `current`.
    pub fn resolve(self, current: bool) -> bool {
        match self {
            PowerAction::On => true,
            PowerAction::Off => false,
            PowerAction::Toggle => !current,
        }
    }
}

/// A command destined for a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownlinkCommand {
    Power(PowerAction),
    Setpoint { device_index: u8, value: f32 },
}

/// Decode an uplink frame.
///
/// Returns `Ok(None)` for tags this gateway does not know about, and
/// [`GatewayError::TruncatedFrame`] when a known tag is short. A frame never
/// yields more than one event.
pub fn decode(bytes: &[u8]) -> Result<Option<UplinkEvent>> {
    let Some(&tag) = bytes.first() else {
        return Err(GatewayError::MalformedFrame("empty payload".to_string()));
    };

    let event = match tag {
        TAG_ERROR => {
            require_len(tag, bytes, ERROR_FRAME_LEN)?;
            UplinkEvent::Error {
                source: bytes[1],
                code: bytes[2],
            }
        }
        TAG_HEARTBEAT => {
            require_len(tag, bytes, HEARTBEAT_FRAME_LEN)?;
            UplinkEvent::Heartbeat
        }
        TAG_STATUS => {
            require_len(tag, bytes, STATUS_FRAME_LEN)?;
            UplinkEvent::Status {
                device_index: bytes[1],
                setpoint: bytes_to_f32_be([bytes[2], bytes[3], bytes[4], bytes[5]]),
                flow: bytes_to_f32_be([bytes[6], bytes[7], bytes[8], bytes[9]]),
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}

/// Encode a downlink command into its payload bytes.
pub fn encode(command: &DownlinkCommand) -> Result<Vec<u8>> {
    match *command {
        DownlinkCommand::Power(action) => Ok(vec![action.code()]),
        DownlinkCommand::Setpoint {
            device_index,
            value,
        } => {
            if !value.is_finite() {
                return Err(GatewayError::InvalidValue(format!(
                    "setpoint must be finite, got {value}"
                )));
            }
            let mut buf = Vec::with_capacity(SETPOINT_COMMAND_LEN);
            buf.push(TAG_SETPOINT);
            buf.push(device_index);
            buf.extend_from_slice(&value.to_be_bytes());
            Ok(buf)
        }
    }
}

/// Big-endian IEEE-754 single precision.
pub fn bytes_to_f32_be(bytes: [u8; 4]) -> f32 {
    f32::from_be_bytes(bytes)
}

/// Round to two decimals for presentation.
pub fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

fn require_len(tag: u8, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(GatewayError::TruncatedFrame {
            tag,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}
