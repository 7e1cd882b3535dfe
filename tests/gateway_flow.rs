//! End-to-end flow: notification in, state and events out, commands down.

use async_trait::async_trait;
use mfc_lorawan_gateway::config::Config;
use mfc_lorawan_gateway::ingest::ingest_notification;
use mfc_lorawan_gateway::{
    CommandDispatcher, CommitPolicy, DeviceStore, DownlinkSink, EventHub, GatewayError,
    OperatorCommand, PowerAction, UplinkEvent, UplinkProcessor,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingSink {
    fail: bool,
    sent: Mutex<Vec<(u8, Vec<u8>, u8)>>,
}

#[async_trait]
impl DownlinkSink for RecordingSink {
    async fn deliver(
        &self,
        device_index: u8,
        payload: &[u8],
        port: u8,
    ) -> mfc_lorawan_gateway::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((device_index, payload.to_vec(), port));
        if self.fail {
            return Err(GatewayError::DeliveryFailed("503 Service Unavailable".to_string()));
        }
        Ok(())
    }
}

struct Gateway {
    store: DeviceStore,
    hub: EventHub,
    processor: UplinkProcessor,
    dispatcher: CommandDispatcher,
    sink: Arc<RecordingSink>,
}

fn gateway(fail: bool) -> Gateway {
    let store = DeviceStore::new([0, 1]);
    let hub = EventHub::new(store.clone(), 16);
    let processor = UplinkProcessor::new(store.clone(), hub.clone(), [0, 1]);
    let sink = Arc::new(RecordingSink {
        fail,
        ..Default::default()
    });
    let dispatcher = CommandDispatcher::new(store.clone(), sink.clone(), CommitPolicy::Optimistic);
    Gateway {
        store,
        hub,
        processor,
        dispatcher,
        sink,
    }
}

#[tokio::test]
async fn uplink_then_commands() {
    let gw = gateway(false);
    let (initial, mut events) = gw.hub.subscribe().await;
    assert_eq!(initial.devices.len(), 2);

    // 0x20 0x01 | 3.0 | 1.0
    let body = br#"{"uplink_message": {"received_at": "2024-05-01T10:00:00Z", "frm_payload": "IAFAQAAAP4AAAA=="}}"#;
    ingest_notification(&gw.processor, "v3/eerl-mfc@ttn/devices/mfc-node-02/up", body).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.device, Some(1));
    assert_eq!(
        event.event,
        UplinkEvent::Status {
            device_index: 1,
            setpoint: 3.0,
            flow: 1.0,
        }
    );
    assert_eq!(event.to_json()["receivedAt"], "2024-05-01T10:00:00+00:00");

    gw.dispatcher
        .dispatch(1, "toggle".parse::<OperatorCommand>().unwrap())
        .await
        .unwrap();
    gw.dispatcher
        .dispatch(1, "4.5".parse::<OperatorCommand>().unwrap())
        .await
        .unwrap();

    let state = gw.store.get(1).await;
    assert!(state.powered);
    assert_eq!(state.setpoint, 4.5);
    assert_eq!(state.flow, 1.0);

    let sent = gw.sink.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            (1, vec![0x02], 15),
            (1, vec![0x10, 0x01, 0x40, 0x90, 0x00, 0x00], 15),
        ]
    );

    // A later status report overrides the commanded setpoint.
    gw.processor
        .process(&[0x20, 0x01, 0x40, 0x80, 0x00, 0x00, 0x40, 0x80, 0x00, 0x00], None)
        .await;
    assert_eq!(gw.store.get(1).await.setpoint, 4.0);
}

#[tokio::test]
async fn delivery_failure_surfaces_but_keeps_setpoint() {
    let gw = gateway(true);

    let result = gw.dispatcher.dispatch_setpoint(1, 12.5).await;
    assert!(matches!(result, Err(GatewayError::DeliveryFailed(_))));
    assert_eq!(gw.store.get(1).await.setpoint, 12.5);

    let result = gw.dispatcher.dispatch_power(0, PowerAction::On).await;
    assert!(matches!(result, Err(GatewayError::DeliveryFailed(_))));
    assert!(gw.store.get(0).await.powered);
}

#[tokio::test]
async fn malformed_traffic_never_disturbs_state() {
    let gw = gateway(false);
    gw.processor
        .process(&[0x20, 0x00, 0x41, 0x48, 0x00, 0x00, 0x40, 0xA0, 0x00, 0x00], None)
        .await;
    let before = gw.store.snapshot().await;

    for body in [
        &b"not json"[..],
        br#"{"uplink_message": {"frm_payload": "%%%"}}"#,
        br#"{"uplink_message": {"frm_payload": "IAA="}}"#,
        br#"{"uplink_message": {"frm_payload": "mQ=="}}"#,
        br#"{"uplink_message": {"frm_payload": ""}}"#,
    ] {
        ingest_notification(&gw.processor, "v3/app@ttn/devices/dev/up", body).await;
    }

    assert_eq!(gw.store.snapshot().await, before);
    assert_eq!(gw.store.get(0).await.setpoint, 12.5);
}

#[tokio::test]
async fn concurrent_uplinks_and_commands() {
    let gw = gateway(false);
    let mut handles = Vec::new();

    for i in 0..20u8 {
        let processor = gw.processor.clone();
        handles.push(tokio::spawn(async move {
            let mut frame = vec![0x20, i % 2];
            frame.extend_from_slice(&f32::from(i).to_be_bytes());
            frame.extend_from_slice(&1.5f32.to_be_bytes());
            processor.process(&frame, None).await;
        }));

        let dispatcher = gw.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch_power(i % 2, PowerAction::Toggle).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Ten toggles per device: both back to off.
    for index in [0, 1] {
        let state = gw.store.get(index).await;
        assert!(!state.powered);
        assert_eq!(state.flow, 1.5);
    }
    assert_eq!(gw.sink.sent.lock().unwrap().len(), 20);
}

#[test]
fn example_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.toml");
    let config = Config::load(path).unwrap();
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.gateway.commit_policy, CommitPolicy::Optimistic);
}
