//! End-to-end tests for the synchronization engine
//!
//! Drives the full facade against the mock network controller and the
//! fixture converter catalog: encode/decode round trips, response
//! correlation, timeouts, unsolicited reports, and commissioning.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use hivelink_core::{
    ConfigureRoutine, DeviceProfile, IncomingMessage, MessageKind, StateMap, StateUpdate,
};
use hivelink_sync::test_utils::{
    catalog, climate_profile, device, light_profile, two_gang_profile, BrightnessConverter,
    CountingConfigure, MockNetwork,
};
use hivelink_sync::{SyncConfig, SyncEngine, SyncError};

fn setup(
    profiles: Vec<DeviceProfile>,
) -> (Arc<SyncEngine>, mpsc::Receiver<StateUpdate>, Arc<MockNetwork>) {
    let network = Arc::new(MockNetwork::new());
    let (engine, updates) = SyncEngine::new(
        SyncConfig::default(),
        Arc::clone(&network) as Arc<dyn hivelink_sync::NetworkController>,
        catalog(profiles),
    );
    (Arc::new(engine), updates, network)
}

fn attrs(entries: &[(&str, Value)]) -> StateMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Let spawned tasks progress to their next await point
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Set path
// ============================================================================

#[tokio::test]
async fn test_set_merges_converter_results() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let merged = engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("state", json!("ON")), ("brightness", json!(128))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(merged.get("state"), Some(&json!("ON")));
    assert_eq!(merged.get("brightness"), Some(&json!(128)));
    assert_eq!(network.sent_count(), 2);
    assert_eq!(engine.cached_state(&"0x01".into()).unwrap(), merged);
}

#[tokio::test]
async fn test_power_off_is_written_first() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("hue", json!(120)), ("state", json!("OFF"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].cluster, "genOnOff");
    assert_eq!(sent[1].cluster, "lightingColorCtrl");
}

#[tokio::test]
async fn test_power_on_is_written_last() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("state", json!("ON")), ("hue", json!(120))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].cluster, "lightingColorCtrl");
    assert_eq!(sent[1].cluster, "genOnOff");
}

#[tokio::test]
async fn test_off_state_is_written_before_brightness() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("brightness", json!(0)), ("state", json!("OFF"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].cluster, "genOnOff");
    assert_eq!(sent[1].cluster, "genLevelCtrl");
}

#[tokio::test]
async fn test_brightness_is_written_before_on_state() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("state", json!("ON")), ("brightness", json!(128))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].cluster, "genLevelCtrl");
    assert_eq!(sent[1].cluster, "genOnOff");
}

#[tokio::test]
async fn test_multi_key_converter_runs_once() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let merged = engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("hue", json!(100)), ("saturation", json!(50))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload["hue"], json!(100));
    assert_eq!(sent[0].payload["saturation"], json!(50));
    assert_eq!(merged.get("hue"), Some(&json!(100)));
    assert_eq!(merged.get("saturation"), Some(&json!(50)));
}

#[tokio::test]
async fn test_endpoint_suffix_routes_to_declared_endpoint() {
    let (engine, _updates, network) = setup(vec![two_gang_profile()]);
    engine.add_device(device("0x2g", "LM-2G", &[1, 2]));

    engine
        .set_device_state(
            &"0x2g".into(),
            attrs(&[("state_right", json!("ON"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let sent = network.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].endpoint, 2);
}

#[tokio::test]
async fn test_same_converter_fires_per_endpoint() {
    let (engine, _updates, network) = setup(vec![two_gang_profile()]);
    engine.add_device(device("0x2g", "LM-2G", &[1, 2]));

    engine
        .set_device_state(
            &"0x2g".into(),
            attrs(&[("state_left", json!("OFF")), ("state_right", json!("OFF"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    let mut endpoints: Vec<u8> = network.sent().iter().map(|c| c.endpoint).collect();
    endpoints.sort_unstable();
    assert_eq!(endpoints, vec![1, 2]);
}

#[tokio::test]
async fn test_undeclared_endpoint_is_skipped() {
    // Device reports only endpoint 1, so `right` (endpoint 2) cannot be hit.
    let (engine, _updates, network) = setup(vec![two_gang_profile()]);
    engine.add_device(device("0x2g", "LM-2G", &[1]));

    let merged = engine
        .set_device_state(
            &"0x2g".into(),
            attrs(&[("state_right", json!("ON"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    assert!(merged.is_empty());
    assert_eq!(network.sent_count(), 0);
    assert_eq!(engine.stats().pipeline.attributes_skipped, 1);
}

#[tokio::test]
async fn test_unmapped_attribute_is_skipped() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let merged = engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("color_temp", json!(370))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    assert!(merged.is_empty());
    assert_eq!(network.sent_count(), 0);
    assert_eq!(engine.stats().pipeline.attributes_skipped, 1);
}

#[tokio::test]
async fn test_converter_failure_is_recovered() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));
    network.set_failing(true);

    let merged = engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("state", json!("ON"))]),
            StateMap::new(),
        )
        .await
        .unwrap();

    assert!(merged.is_empty());
    assert_eq!(engine.stats().pipeline.converter_errors, 1);
}

// ============================================================================
// Get path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_get_resolves_on_correlated_response() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let reader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .get_device_state(
                    &"0x01".into(),
                    attrs(&[("state", Value::Null)]),
                    StateMap::new(),
                )
                .await
        })
    };

    settle().await;
    let sent = network.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, json!({ "read": ["onOff"] }));

    engine
        .on_incoming_message(IncomingMessage::new(
            "0x01",
            sent[0].endpoint,
            "genOnOff",
            MessageKind::ReadResponse,
            json!({ "onOff": 1 }),
            sent[0].sequence,
        ))
        .await;

    let merged = reader.await.unwrap().unwrap();
    assert_eq!(merged.get("state"), Some(&json!("ON")));
    assert_eq!(
        engine.cached_state(&"0x01".into()).unwrap().get("state"),
        Some(&json!("ON"))
    );
    assert_eq!(engine.stats().pending.resolved, 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_times_out_without_response() {
    let (engine, _updates, _network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));
    engine.start();

    let result = engine
        .get_device_state(
            &"0x01".into(),
            attrs(&[("state", Value::Null)]),
            StateMap::new(),
        )
        .await;

    assert!(matches!(result, Err(SyncError::NoResponse(_))));
    assert_eq!(engine.stats().pending.timeouts, 1);
    engine.shutdown();
}

#[tokio::test]
async fn test_get_with_no_readable_attributes() {
    // hue/saturation converter has no get handler
    let (engine, _updates, _network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let result = engine
        .get_device_state(
            &"0x01".into(),
            attrs(&[("hue", Value::Null)]),
            StateMap::new(),
        )
        .await;
    assert!(matches!(result, Err(SyncError::NoResponse(_))));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_flushes_pending_reads() {
    let (engine, _updates, network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    let reader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .get_device_state(
                    &"0x01".into(),
                    attrs(&[("state", Value::Null)]),
                    StateMap::new(),
                )
                .await
        })
    };

    settle().await;
    assert_eq!(network.sent_count(), 1);
    engine.on_disconnected();

    assert!(reader.await.unwrap().is_err());
    assert_eq!(engine.stats().pending.flushed, 1);
}

// ============================================================================
// Report path
// ============================================================================

#[tokio::test]
async fn test_unsolicited_report_emits_state_update() {
    let (engine, mut updates, _network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .on_incoming_message(IncomingMessage::new(
            "0x01",
            1,
            "genOnOff",
            MessageKind::AttributeReport,
            json!({ "onOff": 0 }),
            42,
        ))
        .await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.device, "0x01".into());
    assert_eq!(update.delta.get("state"), Some(&json!("OFF")));
    assert_eq!(
        engine.cached_state(&"0x01".into()).unwrap().get("state"),
        Some(&json!("OFF"))
    );
    // Reports pass the pending table on the way in; they are not orphans.
    assert_eq!(engine.stats().pending.orphaned, 0);
}

#[tokio::test]
async fn test_frames_from_unregistered_devices_are_dropped() {
    let (engine, mut updates, _network) = setup(vec![light_profile()]);

    engine
        .on_incoming_message(IncomingMessage::new(
            "0xbeef",
            1,
            "genOnOff",
            MessageKind::AttributeReport,
            json!({ "onOff": 1 }),
            7,
        ))
        .await;

    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn test_diagnostic_frames_produce_no_update() {
    let (engine, mut updates, _network) = setup(vec![light_profile()]);
    engine.add_device(device("0x01", "LM-100", &[1]));

    engine
        .on_incoming_message(IncomingMessage::new(
            "0x01",
            1,
            "genOnOff",
            MessageKind::DefaultResponse,
            json!({ "status": 0 }),
            7,
        ))
        .await;

    assert!(updates.try_recv().is_err());
    assert!(engine.cached_state(&"0x01".into()).unwrap().is_empty());
}

// ============================================================================
// Read-after-write
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_after_write_schedules_follow_up_read() {
    let mut profile = DeviceProfile::new("Lumora", "LM-RW", "Slow-settling dimmer");
    profile.converters.push(Arc::new(
        BrightnessConverter::with_read_after(Duration::from_millis(100)),
    ));
    let (engine, _updates, network) = setup(vec![profile]);
    engine.add_device(device("0x01", "LM-RW", &[1]));

    engine
        .set_device_state(
            &"0x01".into(),
            attrs(&[("brightness", json!(200))]),
            StateMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(network.sent_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].payload, json!({ "read": ["currentLevel"] }));
    assert_eq!(engine.stats().pipeline.reads_scheduled, 1);

    engine.shutdown();
}

// ============================================================================
// Commissioning
// ============================================================================

#[tokio::test]
async fn test_configure_end_to_end() {
    let routine = Arc::new(CountingConfigure::new());
    let (engine, _updates, network) = setup(vec![climate_profile(
        Arc::clone(&routine) as Arc<dyn ConfigureRoutine>,
    )]);
    engine.add_device(device("0xth", "LM-TH", &[1]));

    assert!(engine.should_configure(&"0xth".into()));
    assert!(engine.configure(&"0xth".into(), false).await.unwrap());
    assert_eq!(routine.runs(), 1);
    assert_eq!(network.sent_count(), 1);
    assert_eq!(network.sent()[0].cluster, "genBasic");

    // Idempotent: the persisted marker suppresses re-runs.
    assert!(!engine.should_configure(&"0xth".into()));
    assert!(!engine.configure(&"0xth".into(), false).await.unwrap());
    assert_eq!(routine.runs(), 1);

    // Force re-runs the routine regardless.
    assert!(engine.configure(&"0xth".into(), true).await.unwrap());
    assert_eq!(routine.runs(), 2);
}

#[tokio::test]
async fn test_failed_interview_blocks_configure() {
    let routine = Arc::new(CountingConfigure::new());
    let (engine, _updates, _network) = setup(vec![climate_profile(
        Arc::clone(&routine) as Arc<dyn ConfigureRoutine>,
    )]);
    let mut record = device("0xth", "LM-TH", &[1]);
    record.interview = hivelink_core::InterviewState::InProgress;
    engine.add_device(record);

    assert!(!engine.should_configure(&"0xth".into()));
}

#[tokio::test]
async fn test_start_commissions_eligible_devices() {
    let routine = Arc::new(CountingConfigure::new());
    let (engine, _updates, _network) = setup(vec![climate_profile(
        Arc::clone(&routine) as Arc<dyn ConfigureRoutine>,
    )]);
    engine.add_device(device("0xth", "LM-TH", &[1]));

    engine.start();
    settle().await;

    assert_eq!(routine.runs(), 1);
    assert!(!engine.should_configure(&"0xth".into()));
    engine.shutdown();
}

#[tokio::test]
async fn test_device_joined_triggers_commissioning() {
    let routine = Arc::new(CountingConfigure::new());
    let (engine, _updates, _network) = setup(vec![climate_profile(
        Arc::clone(&routine) as Arc<dyn ConfigureRoutine>,
    )]);

    engine.on_device_joined(device("0xth", "LM-TH", &[1])).await;
    settle().await;

    assert_eq!(routine.runs(), 1);
}
