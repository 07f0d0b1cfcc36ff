//! Transports for reaching diagnostic devices
//!
//! This module provides the link between the engine and a physical dongle:
//! - Socket transport for WiFi (direct), Bluetooth (local RFCOMM bridge)
//!   and cellular (relay) endpoints
//! - UDP broadcast discovery of devices on the local network
//! - Mock transport simulating a device and vehicle bus for tests and demos
//!
//! Every transport moves opaque link frames; the link protocol itself lives
//! in [`crate::link`] and the vehicle bus framing in `obdsd-protocol`.

pub mod discovery;
pub mod error;
pub mod mock;
mod socket;

pub use error::TransportError;
pub use mock::{MockTransport, MockTransportFactory, MockVehicle};
pub use socket::{SocketTransport, SocketTransportFactory};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obdsd_core::TransportKind;

use crate::config::{DeviceConfig, EndpointConfig};

/// One open link to a device, shared by the connection and its background
/// tasks. Implementations serialize frame exchanges internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind, for quality reporting and failover bookkeeping
    fn kind(&self) -> TransportKind;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;

    /// Send one link frame and wait for the device's reply frame
    async fn exchange(&self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Whether the link is currently usable
    fn is_connected(&self) -> bool;

    /// Re-open the underlying link after a loss
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Close the link
    async fn shutdown(&self);
}

/// Opens transports for the hub.
///
/// The hub never builds transports directly so that tests and demo mode can
/// substitute simulated links.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        endpoint: &EndpointConfig,
        config: &DeviceConfig,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
