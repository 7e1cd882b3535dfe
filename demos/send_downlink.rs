//! Queue one command for a device through the network server API
//!
//! Run with: cargo run --example send_downlink -- <config.toml> <device name> <on|off|toggle|setpoint>

use anyhow::Context;
use mfc_lorawan_gateway::config::Config;
use mfc_lorawan_gateway::{CommandDispatcher, DeviceStore, NetworkServerClient, OperatorCommand};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(name), Some(command)) = (args.next(), args.next(), args.next()) else {
        anyhow::bail!("usage: send_downlink <config.toml> <device name> <on|off|toggle|setpoint>");
    };

    let config = Config::load(&path)?;
    let device = config
        .device_by_name(&name)
        .with_context(|| format!("Unknown device: {}", name))?;
    let command: OperatorCommand = command.parse()?;

    let client = NetworkServerClient::new(
        &config.network_server.api_url,
        &config.network_server.api_key,
        config.downlink_targets(),
        config.downlink_timeout(),
    );
    let store = DeviceStore::new(config.device_indices());
    let dispatcher = CommandDispatcher::new(store.clone(), Arc::new(client), config.gateway.commit_policy);

    dispatcher.dispatch(device.index, command).await?;
    println!("✅ Downlink queued for {} ({})", device.name, device.device_id);

    let state = store.get(device.index).await;
    println!("  powered:  {}", state.powered);
    println!("  setpoint: {:.2} LN/min", state.setpoint);

    Ok(())
}
