//! Error taxonomy shared by the codec, processor and dispatcher.

/// Errors raised by the gateway core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Empty or unreadable uplink input.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A known frame tag with fewer bytes than its layout needs.
    #[error("truncated frame (tag 0x{tag:02X}): expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    /// A frame naming a device this gateway does not manage.
    #[error("unrouted frame (tag 0x{tag:02X}, index {index})")]
    UnroutedFrame { tag: u8, index: u8 },

    /// Non-numeric or non-finite command input.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The network server did not accept the downlink.
    #[error("downlink delivery failed: {0}")]
    DeliveryFailed(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
