//! One authenticated connection to a device
//!
//! A [`DeviceConnection`] owns a single transport and drives the connection
//! lifecycle: seed-key handshake on establish, keep-alive pings in the
//! background and a single-in-flight command lock so concurrent callers
//! queue instead of interleaving frames on the wire.
//!
//! Failure handling is two-staged. A broken exchange degrades the
//! connection and triggers exactly one in-place recovery (transport
//! reconnect plus re-handshake). If that fails the connection goes down
//! and emits [`ConnectionEvent::Down`]; rebuilding on other transports is
//! the hub's job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use obdsd_core::{
    ConnectionHealth, ConnectionQuality, ConnectionState, Protocol, SensorReading, SensorType,
    TransportKind,
};
use obdsd_protocol::{
    build_dtc_request, build_sensor_request, parse_dtc_response, parse_sensor_response, Command,
    DecoderRegistry, ParseError,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, TimingConfig};
use crate::error::ConnectionError;
use crate::link;
use crate::transport::{Transport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Consecutive failed health probes before in-place recovery
const HEALTH_FAILURE_THRESHOLD: u32 = 2;
/// Consecutive missed keep-alives before in-place recovery
const KEEPALIVE_MISS_THRESHOLD: u32 = 3;

/// Lifecycle notifications for one connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged { state: ConnectionState },
    /// The connection is gone and in-place recovery failed
    Down { reason: String },
}

/// What the sampling loop emits
#[derive(Debug, Clone)]
pub enum StreamItem {
    Reading(SensorReading),
    /// Result of a periodic stored-DTC poll
    TroubleCodes(Vec<String>),
}

/// Parameters for the raw sampling loop
#[derive(Clone)]
pub struct StreamConfig {
    pub protocol: Protocol,
    pub sensors: Vec<SensorType>,
    pub interval: Duration,
    /// Poll stored DTCs every this many ticks; 0 disables polling
    pub dtc_poll_ticks: u32,
    /// Raw channel capacity; the loop drops samples once it is full
    pub capacity: usize,
    pub decoders: Arc<DecoderRegistry>,
}

#[derive(Debug, Clone, Copy)]
struct LinkStats {
    quality: ConnectionQuality,
    last_latency_ms: Option<u64>,
}

pub struct DeviceConnection {
    serial: String,
    secret: Vec<u8>,
    timings: TimingConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    stats: RwLock<LinkStats>,
    health_failures: AtomicU32,
    keepalive_misses: AtomicU32,
    streaming: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    /// Serializes every frame exchange; held for the whole command
    cmd_lock: Mutex<()>,
    /// Wakes the keep-alive task when an exchange degrades the connection
    recover_notify: Arc<Notify>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    stream_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceConnection {
    /// Connect and authenticate. The whole handshake must finish inside the
    /// configured handshake window.
    pub async fn establish(
        transport: Arc<dyn Transport>,
        config: &DeviceConfig,
    ) -> Result<Arc<Self>, ConnectionError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let conn = Arc::new(Self {
            serial: config.device.serial.clone(),
            secret: config.auth.secret.as_bytes().to_vec(),
            timings: config.timings.clone(),
            transport,
            state: RwLock::new(ConnectionState::Connecting),
            stats: RwLock::new(LinkStats {
                quality: ConnectionQuality::Unknown,
                last_latency_ms: None,
            }),
            health_failures: AtomicU32::new(0),
            keepalive_misses: AtomicU32::new(0),
            streaming: AtomicBool::new(false),
            events,
            cmd_lock: Mutex::new(()),
            recover_notify: Arc::new(Notify::new()),
            keepalive_handle: Mutex::new(None),
            stream_handle: Mutex::new(None),
        });

        match tokio::time::timeout(conn.timings.handshake_timeout(), conn.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
        }

        conn.set_state(ConnectionState::Connected);
        info!(
            serial = %conn.serial,
            transport = %conn.transport.kind(),
            endpoint = %conn.transport.endpoint(),
            "Device connected"
        );

        let handle = Self::spawn_keepalive(&conn);
        *conn.keepalive_handle.lock().await = Some(handle);
        Ok(conn)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> ConnectionHealth {
        let stats = *self.stats.read();
        ConnectionHealth {
            state: self.state(),
            quality: stats.quality,
            transport: self.transport.kind(),
            last_latency_ms: stats.last_latency_ms,
            consecutive_failures: self.health_failures.load(Ordering::Relaxed),
        }
    }

    /// Send one protocol command and return the raw bus response.
    ///
    /// Commands are serialized; a second caller waits for the first to
    /// finish. The command timeout bounds the exchange, not the queue wait.
    pub async fn send_command(&self, command: &Command) -> Result<Vec<u8>, ConnectionError> {
        let _guard = self.cmd_lock.lock().await;
        let state = self.state();
        if !state.accepts_commands() {
            return Err(ConnectionError::NotReady(state));
        }

        let frame = link::bus_command_frame(&command.protocol, &command.frame);
        let started = Instant::now();
        let reply = match self.exchange_checked(&frame).await {
            Ok(reply) => reply,
            Err(e) => {
                self.health_failures.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.record_latency(started.elapsed());
        self.health_failures.store(0, Ordering::SeqCst);

        let bus = link::parse_bus_response(&reply)?;
        Ok(bus.to_vec())
    }

    /// Measure link latency with a PING exchange
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let _guard = self.cmd_lock.lock().await;
        self.ping_inner().await
    }

    /// Probe the link and return the current health snapshot. Two
    /// consecutive failed probes degrade the connection and trigger one
    /// in-place recovery.
    pub async fn check_health(&self) -> ConnectionHealth {
        {
            let _guard = self.cmd_lock.lock().await;
            if self.state().accepts_commands() {
                if let Err(e) = self.ping_inner().await {
                    debug!(serial = %self.serial, error = %e, "Health probe failed");
                    self.health_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        if self.health_failures.load(Ordering::SeqCst) >= HEALTH_FAILURE_THRESHOLD {
            self.recover_in_place().await;
        }
        self.health()
    }

    /// Start the raw sampling loop and hand back its channel.
    ///
    /// One loop per connection; readings the receiver cannot keep up with
    /// are dropped, never awaited. The loop pauses while the connection is
    /// degraded and exits when it goes down.
    pub async fn start_streaming(
        self: &Arc<Self>,
        config: StreamConfig,
    ) -> Result<mpsc::Receiver<StreamItem>, ConnectionError> {
        if self.streaming.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyStreaming);
        }
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Connected {
                self.streaming.store(false, Ordering::SeqCst);
                return Err(ConnectionError::NotReady(*state));
            }
            *state = ConnectionState::Streaming;
        }
        let _ = self.events.send(ConnectionEvent::StateChanged {
            state: ConnectionState::Streaming,
        });
        info!(
            serial = %self.serial,
            sensors = config.sensors.len(),
            interval_ms = config.interval.as_millis() as u64,
            "Streaming started"
        );

        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::stream_loop(weak, config, tx));
        *self.stream_handle.lock().await = Some(handle);
        Ok(rx)
    }

    /// Stop the sampling loop and return to plain Connected
    pub async fn stop_streaming(&self) {
        if let Some(handle) = self.stream_handle.lock().await.take() {
            handle.abort();
        }
        self.finish_streaming();
    }

    /// Close the connection deliberately. No Down event is emitted.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.keepalive_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.stream_handle.lock().await.take() {
            handle.abort();
        }
        self.streaming.store(false, Ordering::SeqCst);
        self.transport.shutdown().await;
        self.set_state(ConnectionState::Disconnected);
        info!(serial = %self.serial, "Connection shut down");
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let timeout = self.timings.command_timeout();
        let challenge = self
            .transport
            .exchange(&link::hello_frame(&self.serial), timeout)
            .await?;
        let seed = link::parse_challenge(&challenge)?;
        let key = link::auth_key(&seed, &self.secret);
        let ack = self.transport.exchange(&link::auth_frame(&key), timeout).await?;
        link::parse_ack(&ack)
    }

    /// One recovery attempt on the current transport: reconnect, then
    /// re-handshake, all inside the handshake window. On failure the
    /// connection goes down and the hub takes over.
    pub async fn recover_in_place(&self) {
        let _guard = self.cmd_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Degraded);
        info!(serial = %self.serial, "Attempting in-place recovery");

        let result = tokio::time::timeout(self.timings.handshake_timeout(), async {
            self.transport.reconnect().await?;
            self.handshake().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.health_failures.store(0, Ordering::SeqCst);
                self.keepalive_misses.store(0, Ordering::SeqCst);
                let next = if self.streaming.load(Ordering::SeqCst) {
                    ConnectionState::Streaming
                } else {
                    ConnectionState::Connected
                };
                self.set_state(next);
                info!(serial = %self.serial, "Recovered in place");
            }
            Ok(Err(ConnectionError::AuthenticationRejected)) => {
                self.mark_lost("authentication rejected");
            }
            Ok(Err(e)) => {
                self.mark_lost(&format!("recovery failed: {e}"));
            }
            Err(_) => {
                self.mark_lost("recovery handshake timed out");
            }
        }
    }

    async fn ping_inner(&self) -> Result<Duration, ConnectionError> {
        let started = Instant::now();
        let reply = self.exchange_checked(&link::ping_frame()).await?;
        if !link::is_pong(&reply) {
            return Err(ConnectionError::Link(format!(
                "expected pong, got {}",
                hex::encode(&reply)
            )));
        }
        let latency = started.elapsed();
        self.record_latency(latency);
        self.health_failures.store(0, Ordering::SeqCst);
        self.keepalive_misses.store(0, Ordering::SeqCst);
        Ok(latency)
    }

    /// Exchange one link frame. A closed transport degrades the connection
    /// and wakes the keep-alive task to run recovery.
    async fn exchange_checked(&self, frame: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match self
            .transport
            .exchange(frame, self.timings.command_timeout())
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if matches!(
                    e,
                    TransportError::ConnectionClosed | TransportError::ConnectionFailed(_)
                ) && self.state() != ConnectionState::Disconnected
                {
                    self.set_state(ConnectionState::Degraded);
                    self.recover_notify.notify_one();
                }
                Err(e.into())
            }
        }
    }

    fn record_latency(&self, latency: Duration) {
        let quality = ConnectionQuality::from_latency(latency);
        let mut stats = self.stats.write();
        if stats.quality != quality {
            debug!(
                serial = %self.serial,
                from = %stats.quality,
                to = %quality,
                latency_ms = latency.as_millis() as u64,
                "Link quality changed"
            );
        }
        stats.quality = quality;
        stats.last_latency_ms = Some(latency.as_millis() as u64);
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            debug!(serial = %self.serial, from = %*state, to = %next, "Connection state");
            *state = next;
        }
        let _ = self.events.send(ConnectionEvent::StateChanged { state: next });
    }

    fn mark_lost(&self, reason: &str) {
        warn!(serial = %self.serial, reason, "Connection lost");
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Down {
            reason: reason.to_string(),
        });
    }

    fn finish_streaming(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            let mut state = self.state.write();
            if *state == ConnectionState::Streaming {
                *state = ConnectionState::Connected;
                drop(state);
                let _ = self.events.send(ConnectionEvent::StateChanged {
                    state: ConnectionState::Connected,
                });
            }
        }
    }

    fn spawn_keepalive(conn: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(conn);
        let notify = conn.recover_notify.clone();
        let interval = conn.timings.keepalive_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
                let Some(conn) = weak.upgrade() else { break };
                match conn.state() {
                    ConnectionState::Disconnected => break,
                    ConnectionState::Degraded => {
                        conn.recover_in_place().await;
                        continue;
                    }
                    _ => {}
                }
                // A command in flight is proof of life; skip this tick
                let Ok(guard) = conn.cmd_lock.try_lock() else {
                    continue;
                };
                let result = conn.ping_inner().await;
                drop(guard);
                match result {
                    Ok(_) => {}
                    Err(e) => {
                        let misses = conn.keepalive_misses.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(serial = %conn.serial, misses, error = %e, "Keep-alive miss");
                        if conn.state() == ConnectionState::Degraded
                            || misses >= KEEPALIVE_MISS_THRESHOLD
                        {
                            conn.recover_in_place().await;
                        }
                    }
                }
            }
        })
    }

    async fn stream_loop(
        weak: Weak<Self>,
        config: StreamConfig,
        tx: mpsc::Sender<StreamItem>,
    ) {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Sensors the vehicle reported as unsupported, logged once then muted
        let mut muted: HashSet<SensorType> = HashSet::new();
        let mut tick: u64 = 0;

        loop {
            ticker.tick().await;
            tick += 1;
            let Some(conn) = weak.upgrade() else { return };
            if tx.is_closed() {
                conn.finish_streaming();
                return;
            }
            match conn.state() {
                ConnectionState::Disconnected => {
                    conn.streaming.store(false, Ordering::SeqCst);
                    return;
                }
                // Suspended: emit nothing rather than fabricate samples
                ConnectionState::Degraded => continue,
                _ => {}
            }

            for sensor in &config.sensors {
                if muted.contains(sensor) {
                    continue;
                }
                let command = match build_sensor_request(&config.protocol, *sensor) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(sensor = ?sensor, error = %e, "Cannot build request, muting sensor");
                        muted.insert(*sensor);
                        continue;
                    }
                };
                match conn.send_command(&command).await {
                    Ok(raw) => {
                        match parse_sensor_response(*sensor, &config.protocol, &raw, &config.decoders)
                        {
                            Ok(reading) => {
                                if tx.try_send(StreamItem::Reading(reading)).is_err() {
                                    debug!(serial = %conn.serial, "Raw stream full, dropping reading");
                                }
                            }
                            Err(ParseError::UnsupportedPid { sensor }) => {
                                warn!(serial = %conn.serial, sensor = ?sensor, "Vehicle does not support sensor, muting");
                                muted.insert(sensor);
                            }
                            Err(ParseError::UnknownDecoder(id)) => {
                                warn!(serial = %conn.serial, decoder = %id, "No decoder registered, muting sensor");
                                muted.insert(*sensor);
                            }
                            Err(ParseError::Timeout) => {
                                debug!(serial = %conn.serial, sensor = ?sensor, "Vehicle silent");
                            }
                            Err(e) => {
                                debug!(serial = %conn.serial, sensor = ?sensor, error = %e, "Discarding sample");
                            }
                        }
                    }
                    // Degraded or lost; the state check next tick decides
                    Err(e) if e.is_connection_lost() => break,
                    Err(e) => {
                        debug!(serial = %conn.serial, error = %e, "Command failed during streaming");
                        break;
                    }
                }
            }

            if config.dtc_poll_ticks > 0
                && tick % config.dtc_poll_ticks as u64 == 0
                && conn.state() == ConnectionState::Streaming
            {
                if let Ok(command) = build_dtc_request(&config.protocol) {
                    if let Ok(raw) = conn.send_command(&command).await {
                        match parse_dtc_response(&config.protocol, &raw, &config.decoders) {
                            Ok(codes) => {
                                let _ = tx.try_send(StreamItem::TroubleCodes(codes));
                            }
                            Err(e) => {
                                debug!(serial = %conn.serial, error = %e, "DTC poll failed")
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive_handle.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.stream_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use obdsd_core::{Device, DeviceLifecycle, DeviceTier, KnownProtocol, TransportKind};

    use super::*;
    use crate::config::{AuthConfig, EndpointConfig};
    use crate::transport::{MockTransport, MockVehicle};

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            device: Device {
                serial: "OBD-TEST".into(),
                model: "mk1".into(),
                tier: DeviceTier::Standard,
                supported_protocols: vec![KnownProtocol::Can.into()],
                transport_preference: vec![],
                lifecycle: DeviceLifecycle::Registered,
                tenant_id: None,
            },
            endpoints: vec![EndpointConfig::Mock {
                kind: TransportKind::Wifi,
                latency_ms: 0,
            }],
            auth: AuthConfig {
                secret: "s3cret".into(),
            },
            timings: TimingConfig::default(),
        }
    }

    fn test_vehicle() -> Arc<MockVehicle> {
        Arc::new(MockVehicle::new("OBD-TEST", b"s3cret").with_standard_sensors())
    }

    fn test_transport(vehicle: &Arc<MockVehicle>) -> Arc<MockTransport> {
        Arc::new(MockTransport::new(
            vehicle.clone(),
            TransportKind::Wifi,
            Duration::ZERO,
        ))
    }

    async fn wait_for_state(conn: &DeviceConnection, wanted: ConnectionState) {
        for _ in 0..200 {
            if conn.state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("connection never reached {wanted}, stuck at {}", conn.state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_and_command() {
        let vehicle = test_vehicle();
        let transport = test_transport(&vehicle);
        let conn = DeviceConnection::establish(transport, &test_config())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let protocol: Protocol = KnownProtocol::Can.into();
        let command = build_sensor_request(&protocol, SensorType::EngineRpm).unwrap();
        let raw = conn.send_command(&command).await.unwrap();
        let registry = DecoderRegistry::new();
        let reading =
            parse_sensor_response(SensorType::EngineRpm, &protocol, &raw, &registry).unwrap();
        assert!((reading.value - 812.0).abs() < 0.5);

        let health = conn.health();
        assert_eq!(health.state, ConnectionState::Connected);
        assert!(health.last_latency_ms.is_some());
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_authentication() {
        let vehicle = test_vehicle();
        vehicle.set_reject_auth(true);
        let transport = test_transport(&vehicle);
        let err = DeviceConnection::establish(transport, &test_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::AuthenticationRejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_window_enforced() {
        let vehicle = test_vehicle();
        let transport = Arc::new(MockTransport::new(
            vehicle,
            TransportKind::Wifi,
            Duration::from_secs(8),
        ));
        let mut config = test_config();
        config.timings.handshake_timeout_ms = 10_000;
        config.timings.command_timeout_ms = 20_000;
        // Two link exchanges at 8s each cannot fit the 10s window
        let err = DeviceConnection::establish(transport, &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::HandshakeTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_then_recovers_in_place() {
        let vehicle = test_vehicle();
        let transport = test_transport(&vehicle);
        let conn = DeviceConnection::establish(transport.clone(), &test_config())
            .await
            .unwrap();

        transport.sever();
        let protocol: Protocol = KnownProtocol::Can.into();
        let command = build_sensor_request(&protocol, SensorType::EngineRpm).unwrap();
        let err = conn.send_command(&command).await.unwrap_err();
        assert!(err.is_connection_lost());

        // Keep-alive notices, reconnects and re-handshakes
        wait_for_state(&conn, ConnectionState::Connected).await;
        let raw = conn.send_command(&command).await.unwrap();
        assert!(!raw.is_empty());
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_goes_down() {
        let vehicle = test_vehicle();
        let transport = test_transport(&vehicle);
        let conn = DeviceConnection::establish(transport.clone(), &test_config())
            .await
            .unwrap();
        let mut events = conn.subscribe();

        transport.set_fail_reconnect(true);
        transport.sever();
        let protocol: Protocol = KnownProtocol::Can.into();
        let command = build_sensor_request(&protocol, SensorType::EngineRpm).unwrap();
        let _ = conn.send_command(&command).await;

        wait_for_state(&conn, ConnectionState::Disconnected).await;
        let mut saw_down = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Down { .. }) {
                saw_down = true;
            }
        }
        assert!(saw_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_delivers_and_mutes_unsupported() {
        let vehicle = test_vehicle();
        vehicle.remove_sensor(SensorType::FuelLevel);
        vehicle.set_trouble_codes(&["P0300"]);
        let transport = test_transport(&vehicle);
        let conn = DeviceConnection::establish(transport, &test_config())
            .await
            .unwrap();

        let mut rx = conn
            .start_streaming(StreamConfig {
                protocol: KnownProtocol::Can.into(),
                sensors: vec![SensorType::EngineRpm, SensorType::FuelLevel],
                interval: Duration::from_millis(100),
                dtc_poll_ticks: 5,
                capacity: 64,
                decoders: Arc::new(DecoderRegistry::new()),
            })
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Streaming);

        let mut readings = 0;
        let mut dtc_polls = 0;
        while readings < 8 || dtc_polls == 0 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(StreamItem::Reading(reading))) => {
                    assert_eq!(reading.sensor, SensorType::EngineRpm);
                    readings += 1;
                }
                Ok(Some(StreamItem::TroubleCodes(codes))) => {
                    assert_eq!(codes, vec!["P0300".to_string()]);
                    dtc_polls += 1;
                }
                other => panic!("stream ended early: {other:?}"),
            }
        }

        conn.stop_streaming().await;
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stream_rejected() {
        let vehicle = test_vehicle();
        let transport = test_transport(&vehicle);
        let conn = DeviceConnection::establish(transport, &test_config())
            .await
            .unwrap();
        let config = StreamConfig {
            protocol: KnownProtocol::Can.into(),
            sensors: vec![SensorType::EngineRpm],
            interval: Duration::from_millis(100),
            dtc_poll_ticks: 0,
            capacity: 16,
            decoders: Arc::new(DecoderRegistry::new()),
        };
        let _rx = conn.start_streaming(config.clone()).await.unwrap();
        let err = conn.start_streaming(config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyStreaming));
        conn.shutdown().await;
    }
}
