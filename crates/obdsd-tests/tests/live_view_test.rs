//! Tests for the live-view event bus
//!
//! Covers topic routing (per-session and per-technician), event ordering,
//! lag behavior for slow subscribers and the JSON shape of the session view
//! snapshot that backs a live UI.
//!
//! Run with: cargo test -p obdsd-tests --test live_view_test

use std::sync::Arc;
use std::time::Duration;

use obdsd_core::{
    session_topic, technician_topic, Device, DeviceLifecycle, DeviceTier, KnownProtocol,
    SensorType, SessionEvent, SessionOutcome, SessionStatus, TransportKind, VehicleProfile,
};
use obdsd_device::{
    AuthConfig, ConnectionHub, DeviceConfig, EndpointConfig, MockTransportFactory, MockVehicle,
    TimingConfig,
};
use obdsd_session::testing::collaborator_doubles;
use obdsd_session::{EngineConfig, SessionEngine, SessionView};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

const SERIAL: &str = "OBD-LV-1";
const SECRET: &str = "liveview";

struct Fixture {
    engine: SessionEngine,
    vehicle: Arc<MockVehicle>,
}

impl Fixture {
    fn new() -> Self {
        let vehicle = Arc::new(MockVehicle::new(SERIAL, SECRET.as_bytes()).with_standard_sensors());
        let factory = Arc::new(MockTransportFactory::new(Arc::clone(&vehicle)));
        let hub = Arc::new(ConnectionHub::new(factory));
        hub.register(device_config()).expect("register device");
        let (collaborators, _analysis, _notifier, _store) = collaborator_doubles();
        let engine = SessionEngine::new(EngineConfig::default(), hub, collaborators);
        Self { engine, vehicle }
    }

    async fn start(&self, sensors: Vec<SensorType>) -> (Uuid, broadcast::Receiver<SessionEvent>) {
        let session_id = self
            .engine
            .create_session(profile(), SERIAL, "tech-5", sensors)
            .expect("create session");
        let events = self.engine.subscribe(&session_topic(session_id));
        self.engine
            .activate_session(session_id)
            .await
            .expect("activate session");
        (session_id, events)
    }
}

fn profile() -> VehicleProfile {
    VehicleProfile::new("WVWZZZ1JZXW386752", "Volkswagen", "Golf", 2019)
}

fn device_config() -> DeviceConfig {
    DeviceConfig {
        device: Device {
            serial: SERIAL.into(),
            model: "falcon-std".into(),
            tier: DeviceTier::Standard,
            supported_protocols: vec![KnownProtocol::Can.into()],
            transport_preference: vec![TransportKind::Wifi],
            lifecycle: DeviceLifecycle::Registered,
            tenant_id: None,
        },
        endpoints: vec![EndpointConfig::Wifi {
            url: "tcp://10.0.0.2:35000".into(),
        }],
        auth: AuthConfig {
            secret: SECRET.into(),
        },
        timings: TimingConfig::default(),
    }
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    match tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => panic!("event topic failed: {e}"),
        Err(_) => panic!("timed out waiting for a session event"),
    }
}

async fn wait_for_view<F>(engine: &SessionEngine, session_id: Uuid, mut ready: F) -> SessionView
where
    F: FnMut(&SessionView) -> bool,
{
    for _ in 0..600 {
        let view = engine.session_view(session_id).expect("session view");
        if ready(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session view never reached the expected state");
}

// =============================================================================
// Topic Routing Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_topic_carries_lifecycle_and_readings_in_order() {
    let fixture = Fixture::new();
    let (session_id, mut events) = fixture.start(vec![SensorType::EngineRpm]).await;

    // Lifecycle comes first, before any sample.
    let first = next_event(&mut events).await;
    assert!(
        matches!(
            &first,
            SessionEvent::SessionStarted { session_id: sid, vehicle_vin, device_serial }
                if *sid == session_id
                    && vehicle_vin == "WVWZZZ1JZXW386752"
                    && device_serial == SERIAL
        ),
        "expected session_started first, got {first:?}"
    );

    let mut readings = Vec::new();
    while readings.len() < 8 {
        match next_event(&mut events).await {
            SessionEvent::Reading { session_id: sid, reading } => {
                assert_eq!(sid, session_id);
                readings.push(reading);
            }
            other => panic!("unexpected event while streaming: {other:?}"),
        }
    }
    assert!(readings.iter().all(|r| r.sensor == SensorType::EngineRpm));
    // Samples arrive in capture order.
    for pair in readings.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    fixture
        .engine
        .cancel_session(session_id)
        .await
        .expect("cancel session");
    loop {
        match next_event(&mut events).await {
            SessionEvent::SessionCancelled { session_id: sid } => {
                assert_eq!(sid, session_id);
                break;
            }
            SessionEvent::Reading { .. } => {}
            other => panic!("unexpected event while cancelling: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_technician_topic_skips_raw_readings() {
    let fixture = Fixture::new();
    // Hot coolant trips the builtin overtemperature rule.
    fixture.vehicle.set_sensor(SensorType::CoolantTemp, 124.0);

    let session_id = fixture
        .engine
        .create_session(profile(), SERIAL, "tech-5", vec![SensorType::CoolantTemp])
        .expect("create session");
    let mut tech_events = fixture.engine.subscribe(&technician_topic("tech-5"));
    fixture
        .engine
        .activate_session(session_id)
        .await
        .expect("activate session");

    let first = next_event(&mut tech_events).await;
    assert!(matches!(first, SessionEvent::SessionStarted { .. }));

    // With readings filtered out, the next thing a technician sees is
    // the fault itself.
    let second = next_event(&mut tech_events).await;
    let SessionEvent::FaultDetected { fault, .. } = second else {
        panic!("expected fault_detected on the technician topic, got {second:?}");
    };
    assert_eq!(fault.code, "P0217");

    fixture
        .engine
        .complete_session(session_id, SessionOutcome::IssuesFound)
        .await
        .expect("complete session");
    loop {
        match next_event(&mut tech_events).await {
            SessionEvent::SessionCompleted { outcome, .. } => {
                assert_eq!(outcome, SessionOutcome::IssuesFound);
                break;
            }
            SessionEvent::Reading { .. } => panic!("raw reading on the technician topic"),
            _ => {}
        }
    }
}

// =============================================================================
// Slow Subscriber Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_lagging_live_view_does_not_stall_the_session() {
    let fixture = Fixture::new();
    // Subscribe and then never read: the topic fills past its capacity.
    let (session_id, mut events) = fixture.start(vec![SensorType::EngineRpm]).await;

    tokio::time::sleep(Duration::from_secs(150)).await;

    let view = fixture.engine.session_view(session_id).expect("view");
    assert!(
        view.total_samples >= 1_000,
        "sampling stalled at {} samples behind a lagging subscriber",
        view.total_samples
    );
    assert_eq!(view.status, SessionStatus::InProgress);
    assert_eq!(view.queue_drops.events, 0);

    // The subscriber pays for its lag with lost events, not with
    // engine backpressure.
    match events.try_recv() {
        Err(TryRecvError::Lagged(missed)) => assert!(missed > 0),
        other => panic!("expected a lagged live view, got {other:?}"),
    }

    fixture
        .engine
        .cancel_session(session_id)
        .await
        .expect("cancel session");
}

// =============================================================================
// View Snapshot Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_view_snapshot_serializes_for_ui() {
    let fixture = Fixture::new();
    let (session_id, _events) = fixture.start(vec![SensorType::EngineRpm]).await;

    let view = wait_for_view(&fixture.engine, session_id, |v| v.total_samples >= 1).await;
    let json = serde_json::to_value(&view).expect("serialize view");

    assert_eq!(json["session_id"], session_id.to_string());
    assert_eq!(json["status"], "in_progress");
    assert_eq!(json["vehicle"]["vin"], "WVWZZZ1JZXW386752");
    // Makes are normalized to lowercase on profile construction.
    assert_eq!(json["vehicle"]["make"], "volkswagen");
    assert!(json["total_samples"].as_u64().unwrap() >= 1);
    assert_eq!(json["queue_drops"]["events"], 0);

    fixture
        .engine
        .cancel_session(session_id)
        .await
        .expect("cancel session");
}
