//! MFC LoRaWAN gateway library
//!
//! Decodes mass flow controller uplinks delivered by a LoRaWAN network
//! server, keeps per-device state, and turns operator commands into
//! downlinks.
//!
//! Architecture: network server → ingest → uplink processor → store + event hub → MQTT bus
//!               MQTT bus → command dispatcher → codec → network server API

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod downlink;
pub mod error;
pub mod events;
pub mod ingest;
pub mod mqtt;
pub mod store;
pub mod uplink;

pub use codec::{DownlinkCommand, PowerAction, UplinkEvent};
pub use dispatch::{CommandDispatcher, CommitPolicy, OperatorCommand};
pub use downlink::{DeviceTarget, DownlinkSink, NetworkServerClient};
pub use error::{GatewayError, Result};
pub use events::{EventHub, GatewayEvent};
pub use store::{DeviceState, DeviceStore, StoreSnapshot};
pub use uplink::{Route, UplinkProcessor};
