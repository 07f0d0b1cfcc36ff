//! Mock transport and simulated vehicle for testing and demo mode
//!
//! [`MockVehicle`] answers link frames exactly like a real adapter plugged
//! into a running vehicle: it issues handshake challenges, answers PINGs
//! and services bus commands against an in-memory sensor table. Tests flip
//! its failure switches to drive the connection and hub through loss,
//! rejection and recovery paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obdsd_core::{KnownProtocol, SensorType, TransportKind};
use obdsd_protocol::dtc;
use obdsd_protocol::frame::{self, DEFAULT_ECU_ADDRESS};
use obdsd_protocol::pid::{self, nrc, service};
use parking_lot::{Mutex, RwLock};

use crate::config::{DeviceConfig, EndpointConfig};
use crate::link::{self, frame_type, nak_code};
use crate::transport::{Transport, TransportError, TransportFactory};

type PassThroughResponder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Simulated adapter and vehicle bus behind it
pub struct MockVehicle {
    serial: String,
    secret: Vec<u8>,
    seed_counter: AtomicU32,
    last_seed: Mutex<Option<[u8; 4]>>,
    sensors: RwLock<HashMap<SensorType, f64>>,
    trouble_codes: RwLock<Vec<String>>,
    reject_auth: AtomicBool,
    silent_bus: AtomicBool,
    corrupt_checksum: AtomicBool,
    fail_exchanges: AtomicU32,
    passthrough: RwLock<Option<PassThroughResponder>>,
}

impl MockVehicle {
    pub fn new(serial: &str, secret: &[u8]) -> Self {
        Self {
            serial: serial.to_string(),
            secret: secret.to_vec(),
            seed_counter: AtomicU32::new(0x1A2B_3C4D),
            last_seed: Mutex::new(None),
            sensors: RwLock::new(HashMap::new()),
            trouble_codes: RwLock::new(Vec::new()),
            reject_auth: AtomicBool::new(false),
            silent_bus: AtomicBool::new(false),
            corrupt_checksum: AtomicBool::new(false),
            fail_exchanges: AtomicU32::new(0),
            passthrough: RwLock::new(None),
        }
    }

    /// Populate the sensor table with a warm idling engine
    pub fn with_standard_sensors(self) -> Self {
        {
            let mut sensors = self.sensors.write();
            sensors.insert(SensorType::EngineRpm, 812.0);
            sensors.insert(SensorType::VehicleSpeed, 0.0);
            sensors.insert(SensorType::EngineLoad, 22.0);
            sensors.insert(SensorType::CoolantTemp, 88.0);
            sensors.insert(SensorType::IntakeManifoldPressure, 32.0);
            sensors.insert(SensorType::ThrottlePosition, 14.0);
            sensors.insert(SensorType::MassAirFlow, 3.4);
            sensors.insert(SensorType::FuelLevel, 62.0);
            sensors.insert(SensorType::ControlModuleVoltage, 13.8);
            sensors.insert(SensorType::IntakeAirTemp, 24.0);
        }
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_sensor(&self, sensor: SensorType, value: f64) {
        self.sensors.write().insert(sensor, value);
    }

    pub fn remove_sensor(&self, sensor: SensorType) {
        self.sensors.write().remove(&sensor);
    }

    pub fn set_trouble_codes(&self, codes: &[&str]) {
        *self.trouble_codes.write() = codes.iter().map(|c| c.to_string()).collect();
    }

    pub fn add_trouble_code(&self, code: &str) {
        self.trouble_codes.write().push(code.to_string());
    }

    pub fn trouble_codes(&self) -> Vec<String> {
        self.trouble_codes.read().clone()
    }

    /// Refuse the next and all following seed-key exchanges
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Answer bus commands with an empty response, as a vehicle with the
    /// ignition off would
    pub fn set_silent_bus(&self, silent: bool) {
        self.silent_bus.store(silent, Ordering::SeqCst);
    }

    /// Corrupt the checksum byte of serial-protocol responses
    pub fn set_corrupt_checksum(&self, corrupt: bool) {
        self.corrupt_checksum.store(corrupt, Ordering::SeqCst);
    }

    /// Fail the next `n` frame exchanges at the transport level
    pub fn fail_next_exchanges(&self, n: u32) {
        self.fail_exchanges.store(n, Ordering::SeqCst);
    }

    /// Install a responder for pass-through bus commands
    pub fn set_passthrough_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        *self.passthrough.write() = Some(Box::new(responder));
    }

    /// Answer one link frame the way the adapter firmware would
    pub fn handle_frame(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let pending = self.fail_exchanges.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_exchanges.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionClosed);
        }

        match request.first() {
            Some(&frame_type::HELLO) => {
                let seed = self.seed_counter.fetch_add(1, Ordering::SeqCst).to_be_bytes();
                *self.last_seed.lock() = Some(seed);
                let mut reply = vec![frame_type::CHALLENGE];
                reply.extend_from_slice(&seed);
                Ok(reply)
            }
            Some(&frame_type::AUTH) => {
                if self.reject_auth.load(Ordering::SeqCst) {
                    return Ok(vec![frame_type::NAK, nak_code::AUTH_REJECTED]);
                }
                let seed = self.last_seed.lock().take();
                let expected = seed.map(|s| link::auth_key(&s, &self.secret));
                if expected.as_ref().map(|k| &k[..]) == request.get(1..5) {
                    Ok(vec![frame_type::ACK])
                } else {
                    Ok(vec![frame_type::NAK, nak_code::AUTH_REJECTED])
                }
            }
            Some(&frame_type::PING) => Ok(vec![frame_type::PONG]),
            Some(&frame_type::BUS_CMD) if request.len() >= 2 => {
                let tag = request[1];
                Ok(self.handle_bus_command(tag, &request[2..]))
            }
            _ => Ok(vec![frame_type::NAK, nak_code::BUSY]),
        }
    }

    fn handle_bus_command(&self, tag: u8, bus_frame: &[u8]) -> Vec<u8> {
        let mut reply = vec![frame_type::BUS_RSP, tag];

        if self.silent_bus.load(Ordering::SeqCst) {
            return reply;
        }

        if tag == link::PASS_THROUGH_TAG {
            if let Some(responder) = self.passthrough.read().as_ref() {
                reply.extend_from_slice(&responder(bus_frame));
            }
            return reply;
        }

        let Some(protocol) = link::known_protocol_for_tag(tag) else {
            return vec![frame_type::NAK, nak_code::UNKNOWN_PROTOCOL];
        };

        // A frame the vehicle cannot parse gets no answer at all
        let Ok(unwrapped) = frame::unwrap_request(protocol, bus_frame) else {
            return reply;
        };

        let payload = self.service_response(&unwrapped.payload, protocol);
        if let Ok(mut wrapped) = frame::wrap_response(protocol, DEFAULT_ECU_ADDRESS, &payload) {
            // CAN has no checksum byte to corrupt
            if self.corrupt_checksum.load(Ordering::SeqCst) && protocol != KnownProtocol::Can {
                if let Some(last) = wrapped.last_mut() {
                    *last ^= 0xFF;
                }
            }
            reply.extend_from_slice(&wrapped);
        }
        reply
    }

    fn service_response(&self, request: &[u8], protocol: KnownProtocol) -> Vec<u8> {
        match request.first() {
            Some(&service::CURRENT_DATA) => {
                let Some(requested) = request.get(1) else {
                    return vec![service::NEGATIVE_RESPONSE, service::CURRENT_DATA, nrc::REQUEST_OUT_OF_RANGE];
                };
                match pid::sensor_for_pid(*requested) {
                    Some(sensor) => match self.sensors.read().get(&sensor) {
                        Some(value) => {
                            let mut payload =
                                vec![service::CURRENT_DATA + service::RESPONSE_OFFSET, *requested];
                            payload.extend_from_slice(&pid::encode_value(sensor, *value));
                            payload
                        }
                        None => vec![
                            service::NEGATIVE_RESPONSE,
                            service::CURRENT_DATA,
                            nrc::SUB_FUNCTION_NOT_SUPPORTED,
                        ],
                    },
                    None => vec![
                        service::NEGATIVE_RESPONSE,
                        service::CURRENT_DATA,
                        nrc::SUB_FUNCTION_NOT_SUPPORTED,
                    ],
                }
            }
            Some(&service::STORED_DTCS) => self.dtc_payload(protocol),
            Some(&service::CLEAR_DTCS) => {
                self.trouble_codes.write().clear();
                vec![service::CLEAR_DTCS + service::RESPONSE_OFFSET]
            }
            Some(&other) => vec![service::NEGATIVE_RESPONSE, other, nrc::SERVICE_NOT_SUPPORTED],
            None => vec![
                service::NEGATIVE_RESPONSE,
                0x00,
                nrc::REQUEST_OUT_OF_RANGE,
            ],
        }
    }

    fn dtc_payload(&self, protocol: KnownProtocol) -> Vec<u8> {
        let codes = self.trouble_codes.read();
        let pairs: Vec<(u8, u8)> = codes.iter().filter_map(|c| dtc::dtc_code_bytes(c)).collect();
        let mut payload = vec![service::STORED_DTCS + service::RESPONSE_OFFSET];
        if protocol == KnownProtocol::Can {
            // Single ISO-TP frame fits two codes after the count byte
            let count = pairs.len().min(2);
            payload.push(count as u8);
            for (high, low) in pairs.iter().take(count) {
                payload.push(*high);
                payload.push(*low);
            }
        } else {
            // Legacy frames carry three zero-padded code slots
            for slot in 0..3 {
                let (high, low) = pairs.get(slot).copied().unwrap_or((0, 0));
                payload.push(high);
                payload.push(low);
            }
        }
        payload
    }
}

/// In-process transport backed by a [`MockVehicle`]
pub struct MockTransport {
    vehicle: Arc<MockVehicle>,
    kind: TransportKind,
    latency: Duration,
    connected: AtomicBool,
    fail_reconnect: AtomicBool,
}

impl MockTransport {
    pub fn new(vehicle: Arc<MockVehicle>, kind: TransportKind, latency: Duration) -> Self {
        Self {
            vehicle,
            kind,
            latency,
            connected: AtomicBool::new(true),
            fail_reconnect: AtomicBool::new(false),
        }
    }

    /// Drop the link; the next exchange fails with `ConnectionClosed`
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make reconnect attempts fail until cleared
    pub fn set_fail_reconnect(&self, fail: bool) {
        self.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    pub fn vehicle(&self) -> &Arc<MockVehicle> {
        &self.vehicle
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        format!("mock://{}/{}", self.kind, self.vehicle.serial)
    }

    async fn exchange(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout("Exchange timeout".to_string()));
        }
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.vehicle.handle_frame(request);
        if matches!(result, Err(TransportError::ConnectionClosed)) {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.fail_reconnect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "mock link held down".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockTransport`]s over one shared vehicle.
///
/// Tests mark whole transport kinds as down to force failover and inspect
/// the transports the hub created.
pub struct MockTransportFactory {
    vehicle: Arc<MockVehicle>,
    latency: Duration,
    down: RwLock<HashSet<TransportKind>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(vehicle: Arc<MockVehicle>) -> Self {
        Self {
            vehicle,
            latency: Duration::ZERO,
            down: RwLock::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn vehicle(&self) -> &Arc<MockVehicle> {
        &self.vehicle
    }

    /// Refuse to open transports of this kind until cleared
    pub fn set_down(&self, kind: TransportKind, down: bool) {
        if down {
            self.down.write().insert(kind);
        } else {
            self.down.write().remove(&kind);
        }
    }

    /// Every transport created so far, oldest first
    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    /// The transport opened most recently
    pub fn last_created(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    /// Kinds of every transport created so far, oldest first
    pub fn created_kinds(&self) -> Vec<TransportKind> {
        self.created.lock().iter().map(|t| t.kind()).collect()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        endpoint: &EndpointConfig,
        _config: &DeviceConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let kind = endpoint.kind();
        if self.down.read().contains(&kind) {
            return Err(TransportError::ConnectionFailed(format!(
                "{kind} transport unreachable"
            )));
        }
        let latency = match endpoint {
            EndpointConfig::Mock { latency_ms, .. } if *latency_ms > 0 => {
                Duration::from_millis(*latency_ms)
            }
            _ => self.latency,
        };
        let transport = Arc::new(MockTransport::new(self.vehicle.clone(), kind, latency));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
