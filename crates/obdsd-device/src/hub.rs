//! Connection hub: device registry, leases and supervised recovery
//!
//! The hub tracks every registered device and hands out at most one
//! [`DeviceLease`] per device at a time. A lease delegates commands and
//! streaming through the slot's *current* connection, so a recovery that
//! swaps the connection underneath is invisible to the holder.
//!
//! Per-device state sits behind the slot's own locks; the registry map is
//! only locked for lookup and insert so unrelated devices never serialize
//! on each other.
//!
//! Recovery runs in a per-slot supervisor task. When a connection reports
//! itself down the supervisor reconnects with exponential backoff, staying
//! on the failed transport for a configured number of attempts before
//! moving down the preference order. Exhausting every transport, or any
//! authentication rejection, ends recovery and publishes
//! [`HubEvent::ConnectionLost`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use obdsd_core::{ConnectionHealth, ConnectionState, Device, TransportKind};
use obdsd_protocol::Command;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::connection::{ConnectionEvent, DeviceConnection, StreamConfig, StreamItem};
use crate::error::{ConnectionError, HubError};
use crate::transport::TransportFactory;

const HUB_EVENT_CAPACITY: usize = 64;

/// Recovery notifications for one device slot
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// The connection went down; recovery is running
    Recovering { serial: String },
    /// Recovery succeeded on the given transport
    Recovered {
        serial: String,
        transport: TransportKind,
    },
    /// Recovery exhausted every transport or hit an authentication
    /// rejection; the slot has no connection until the next acquire
    ConnectionLost { serial: String, reason: String },
}

struct DeviceSlot {
    config: DeviceConfig,
    current: RwLock<Option<Arc<DeviceConnection>>>,
    /// Single-flight guard across acquire and recovery
    flow: Mutex<()>,
    leased: AtomicBool,
    events: broadcast::Sender<HubEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSlot {
    fn serial(&self) -> &str {
        &self.config.device.serial
    }
}

enum ConnectAttempt {
    /// Terminal: never retried, aborts the whole connect flow
    AuthRejected,
    Failed(String),
}

pub struct ConnectionHub {
    devices: RwLock<HashMap<String, Arc<DeviceSlot>>>,
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionHub {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub fn register(&self, config: DeviceConfig) -> Result<(), HubError> {
        let serial = config.device.serial.clone();
        let mut devices = self.devices.write();
        if devices.contains_key(&serial) {
            return Err(HubError::AlreadyRegistered(serial));
        }
        let (events, _) = broadcast::channel(HUB_EVENT_CAPACITY);
        devices.insert(
            serial.clone(),
            Arc::new(DeviceSlot {
                config,
                current: RwLock::new(None),
                flow: Mutex::new(()),
                leased: AtomicBool::new(false),
                events,
                supervisor: Mutex::new(None),
            }),
        );
        info!(serial, "Device registered");
        Ok(())
    }

    /// Remove a device, closing its connection if one is open
    pub async fn deregister(&self, serial: &str) -> Result<(), HubError> {
        let slot = self
            .devices
            .write()
            .remove(serial)
            .ok_or_else(|| HubError::DeviceNotFound(serial.to_string()))?;
        if let Some(handle) = slot.supervisor.lock().await.take() {
            handle.abort();
        }
        let conn = slot.current.write().take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
        info!(serial, "Device deregistered");
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .read()
            .values()
            .map(|slot| slot.config.device.clone())
            .collect()
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.devices
            .read()
            .get(serial)
            .map(|slot| slot.config.device.clone())
    }

    /// Recovery event feed for one device
    pub fn subscribe(&self, serial: &str) -> Result<broadcast::Receiver<HubEvent>, HubError> {
        let devices = self.devices.read();
        let slot = devices
            .get(serial)
            .ok_or_else(|| HubError::DeviceNotFound(serial.to_string()))?;
        Ok(slot.events.subscribe())
    }

    /// Health of the device's current connection, if any
    pub fn health(&self, serial: &str) -> Option<ConnectionHealth> {
        let slot = self.devices.read().get(serial).cloned()?;
        let conn = slot.current.read().clone()?;
        Some(conn.health())
    }

    /// Lease a device for exclusive use.
    ///
    /// Reuses a warm connection when one survived the previous lease,
    /// otherwise connects along the transport preference order. A device
    /// that is already leased, or whose connect flow is mid-flight, is
    /// busy rather than waited on.
    pub async fn acquire(&self, serial: &str) -> Result<DeviceLease, HubError> {
        let slot = self
            .devices
            .read()
            .get(serial)
            .cloned()
            .ok_or_else(|| HubError::DeviceNotFound(serial.to_string()))?;
        if slot.config.device.lifecycle.is_retired() {
            return Err(HubError::DeviceRetired(serial.to_string()));
        }
        let Ok(_flow) = slot.flow.try_lock() else {
            return Err(HubError::DeviceBusy(serial.to_string()));
        };
        if slot.leased.load(Ordering::SeqCst) {
            return Err(HubError::DeviceBusy(serial.to_string()));
        }

        let warm = slot.current.read().clone();
        match warm {
            Some(conn) if conn.state() != ConnectionState::Disconnected => {
                debug!(serial, "Reusing warm connection");
            }
            _ => {
                let conn = Self::connect_preferred(&self.factory, &slot.config).await?;
                self.install(&slot, conn).await;
            }
        }

        slot.leased.store(true, Ordering::SeqCst);
        info!(serial, "Device leased");
        drop(_flow);
        Ok(DeviceLease { slot })
    }

    /// Close a device's connection without removing it from the registry
    pub async fn disconnect_device(&self, serial: &str) -> Result<(), HubError> {
        let slot = self
            .devices
            .read()
            .get(serial)
            .cloned()
            .ok_or_else(|| HubError::DeviceNotFound(serial.to_string()))?;
        if slot.leased.load(Ordering::SeqCst) {
            return Err(HubError::DeviceBusy(serial.to_string()));
        }
        if let Some(handle) = slot.supervisor.lock().await.take() {
            handle.abort();
        }
        let conn = slot.current.write().take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
        Ok(())
    }

    async fn install(&self, slot: &Arc<DeviceSlot>, conn: Arc<DeviceConnection>) {
        *slot.current.write() = Some(conn.clone());
        let handle = Self::spawn_supervisor(self.factory.clone(), slot.clone(), &conn);
        if let Some(old) = slot.supervisor.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Try each preferred transport in order. Authentication rejection
    /// aborts immediately; anything else falls through to the next kind.
    async fn connect_preferred(
        factory: &Arc<dyn TransportFactory>,
        config: &DeviceConfig,
    ) -> Result<Arc<DeviceConnection>, HubError> {
        let serial = &config.device.serial;
        let mut last_error = "no endpoints configured".to_string();
        for kind in config.preference() {
            match Self::open(factory, config, kind).await {
                Ok(conn) => return Ok(conn),
                Err(ConnectAttempt::AuthRejected) => {
                    return Err(HubError::AuthenticationRejected {
                        serial: serial.clone(),
                    });
                }
                Err(ConnectAttempt::Failed(e)) => {
                    debug!(serial, kind = %kind, error = %e, "Transport attempt failed");
                    last_error = e;
                }
            }
        }
        Err(HubError::AllTransportsFailed {
            serial: serial.clone(),
            last_error,
        })
    }

    async fn open(
        factory: &Arc<dyn TransportFactory>,
        config: &DeviceConfig,
        kind: TransportKind,
    ) -> Result<Arc<DeviceConnection>, ConnectAttempt> {
        let endpoint = config
            .endpoint_for(kind)
            .ok_or_else(|| ConnectAttempt::Failed(format!("no {kind} endpoint")))?;
        let transport = factory
            .create(endpoint, config)
            .await
            .map_err(|e| ConnectAttempt::Failed(e.to_string()))?;
        match DeviceConnection::establish(transport, config).await {
            Ok(conn) => Ok(conn),
            Err(ConnectionError::AuthenticationRejected) => Err(ConnectAttempt::AuthRejected),
            Err(e) => Err(ConnectAttempt::Failed(e.to_string())),
        }
    }

    fn spawn_supervisor(
        factory: Arc<dyn TransportFactory>,
        slot: Arc<DeviceSlot>,
        conn: &Arc<DeviceConnection>,
    ) -> JoinHandle<()> {
        let mut events = conn.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Down { reason }) => {
                        warn!(
                            serial = %slot.serial(),
                            reason,
                            "Connection down, hub recovery starting"
                        );
                        let _ = slot.events.send(HubEvent::Recovering {
                            serial: slot.serial().to_string(),
                        });
                        let _flow = slot.flow.lock().await;
                        match Self::recover(&factory, &slot).await {
                            Ok(new_conn) => {
                                *slot.current.write() = Some(new_conn.clone());
                                let transport = new_conn.transport_kind();
                                info!(serial = %slot.serial(), transport = %transport, "Recovered");
                                let _ = slot.events.send(HubEvent::Recovered {
                                    serial: slot.serial().to_string(),
                                    transport,
                                });
                                events = new_conn.subscribe();
                            }
                            Err(reason) => {
                                *slot.current.write() = None;
                                warn!(serial = %slot.serial(), reason, "Recovery gave up");
                                let _ = slot.events.send(HubEvent::ConnectionLost {
                                    serial: slot.serial().to_string(),
                                    reason,
                                });
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// One recovery pass: the active transport first, then the rest of the
    /// preference order, `attempts_per_transport` tries each, exponential
    /// backoff across the whole pass.
    async fn recover(
        factory: &Arc<dyn TransportFactory>,
        slot: &Arc<DeviceSlot>,
    ) -> Result<Arc<DeviceConnection>, String> {
        let config = &slot.config;
        let backoff = &config.timings.reconnect;

        let active = slot.current.read().as_ref().map(|c| c.transport_kind());
        let mut order: Vec<TransportKind> = Vec::new();
        if let Some(kind) = active {
            order.push(kind);
        }
        for kind in config.preference() {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }

        let mut attempt = 0u32;
        let mut last_error = "no endpoints configured".to_string();
        for kind in order {
            if config.endpoint_for(kind).is_none() {
                continue;
            }
            for _ in 0..backoff.attempts_per_transport {
                attempt += 1;
                tokio::time::sleep(backoff.delay_for(attempt)).await;
                match Self::open(factory, config, kind).await {
                    Ok(conn) => return Ok(conn),
                    Err(ConnectAttempt::AuthRejected) => {
                        return Err("authentication rejected".to_string());
                    }
                    Err(ConnectAttempt::Failed(e)) => {
                        debug!(
                            serial = %slot.serial(),
                            kind = %kind,
                            attempt,
                            error = %e,
                            "Recovery attempt failed"
                        );
                        last_error = e;
                    }
                }
            }
        }
        Err(format!("all transports exhausted: {last_error}"))
    }
}

/// Exclusive handle to a device. Dropping it releases the device while
/// keeping the connection warm for the next lease.
pub struct DeviceLease {
    slot: Arc<DeviceSlot>,
}

impl DeviceLease {
    pub fn serial(&self) -> &str {
        self.slot.serial()
    }

    pub fn device(&self) -> &Device {
        &self.slot.config.device
    }

    /// The slot's current connection. None while recovery is between
    /// connections.
    pub fn connection(&self) -> Option<Arc<DeviceConnection>> {
        self.slot.current.read().clone()
    }

    pub async fn send_command(&self, command: &Command) -> Result<Vec<u8>, ConnectionError> {
        match self.connection() {
            Some(conn) => conn.send_command(command).await,
            None => Err(ConnectionError::NotReady(ConnectionState::Disconnected)),
        }
    }

    pub async fn start_streaming(
        &self,
        config: StreamConfig,
    ) -> Result<mpsc::Receiver<StreamItem>, ConnectionError> {
        match self.connection() {
            Some(conn) => conn.start_streaming(config).await,
            None => Err(ConnectionError::NotReady(ConnectionState::Disconnected)),
        }
    }

    pub async fn stop_streaming(&self) {
        if let Some(conn) = self.connection() {
            conn.stop_streaming().await;
        }
    }

    pub fn health(&self) -> Option<ConnectionHealth> {
        self.connection().map(|conn| conn.health())
    }

    /// Recovery events for this device
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.slot.events.subscribe()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.slot.leased.store(false, Ordering::SeqCst);
        debug!(serial = %self.slot.serial(), "Device released");
    }
}
