//! obdsd-device - Device connections, transports and the connection hub
//!
//! A [`DeviceConnection`] owns one physical transport to a dongle, runs the
//! seed-key handshake, keeps the link alive and serializes commands. The
//! [`ConnectionHub`] tracks every registered device, hands out exclusive
//! leases and recovers broken connections across the device's transport
//! preference order.

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod link;
pub mod transport;

pub use config::{AuthConfig, BackoffConfig, DeviceConfig, EndpointConfig, TimingConfig};
pub use connection::{ConnectionEvent, DeviceConnection, StreamConfig, StreamItem};
pub use error::{ConnectionError, HubError};
pub use hub::{ConnectionHub, DeviceLease, HubEvent};
pub use transport::{
    MockTransport, MockTransportFactory, MockVehicle, SocketTransport, SocketTransportFactory,
    Transport, TransportError, TransportFactory,
};
