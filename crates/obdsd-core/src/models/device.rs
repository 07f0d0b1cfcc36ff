//! Device models (OBD dongle hardware units)

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::protocol::Protocol;

/// A registered diagnostic device (dongle)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Hardware serial number, unique across the fleet
    pub serial: String,
    /// Manufacturer model name
    pub model: String,
    /// Capability tier
    #[serde(default)]
    pub tier: DeviceTier,
    /// Protocols this device can speak on the vehicle bus
    pub supported_protocols: Vec<Protocol>,
    /// Transport kinds in preference order, most preferred first
    #[serde(default)]
    pub transport_preference: Vec<TransportKind>,
    /// Lifecycle state
    #[serde(default)]
    pub lifecycle: DeviceLifecycle,
    /// Owning tenant (workshop or fleet operator)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Device {
    /// Whether the device can execute commands for the given protocol
    pub fn supports(&self, protocol: &Protocol) -> bool {
        self.supported_protocols.contains(protocol)
    }

    /// Technician currently assigned to this device, if any
    pub fn assigned_technician(&self) -> Option<&str> {
        match &self.lifecycle {
            DeviceLifecycle::Assigned { technician_id } => Some(technician_id),
            _ => None,
        }
    }
}

/// Capability tier of a device, gating how fast it may be sampled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    /// Low-cost units, conservative sampling only
    Entry,
    /// Regular workshop units
    #[default]
    Standard,
    /// High-end units capable of high-frequency capture
    Professional,
}

impl DeviceTier {
    /// Smallest sampling interval the tier is rated for
    pub fn min_sampling_interval(&self) -> Duration {
        match self {
            DeviceTier::Entry => Duration::from_millis(200),
            DeviceTier::Standard => Duration::from_millis(100),
            DeviceTier::Professional => Duration::from_millis(50),
        }
    }
}

/// Lifecycle state of a device within the fleet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeviceLifecycle {
    /// Known to the fleet, not handed out yet
    #[default]
    Registered,
    /// Handed to a technician for use
    Assigned {
        /// Technician holding the device
        technician_id: String,
    },
    /// Taken out of service
    Retired,
}

impl DeviceLifecycle {
    /// Retired devices are never connected to
    pub fn is_retired(&self) -> bool {
        matches!(self, DeviceLifecycle::Retired)
    }
}

/// Physical transport a device connection runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct socket to the adapter's WiFi access point
    Wifi,
    /// RFCOMM bridge socket on the local host
    Bluetooth,
    /// Relay endpoint reached over the cellular backhaul
    Cellular,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Wifi => "wifi",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Cellular => "cellular",
        };
        f.write_str(name)
    }
}

/// Connection state of a device link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport established
    #[default]
    Disconnected,
    /// Transport and handshake in progress
    Connecting,
    /// Authenticated and idle
    Connected,
    /// Authenticated with an active sampling loop
    Streaming,
    /// Alive but failing health checks, recovery pending
    Degraded,
}

impl ConnectionState {
    /// Whether commands may be issued in this state
    pub fn accepts_commands(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Coarse link quality derived from command round-trip latency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// No measurement yet
    #[default]
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Classify a command round-trip time
    pub fn from_latency(latency: Duration) -> Self {
        let ms = latency.as_millis();
        if ms < 50 {
            ConnectionQuality::Excellent
        } else if ms < 150 {
            ConnectionQuality::Good
        } else if ms < 400 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionQuality::Unknown => "unknown",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// Health snapshot of a device connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    /// Current connection state
    pub state: ConnectionState,
    /// Link quality from the most recent round trip
    pub quality: ConnectionQuality,
    /// Transport the connection currently runs over
    pub transport: TransportKind,
    /// Round-trip latency of the last successful command, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    /// Keep-alive or health probes failed in a row
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_from_latency_bands() {
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(12)),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(80)),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(200)),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(900)),
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn test_tier_sampling_floor() {
        assert_eq!(
            DeviceTier::Professional.min_sampling_interval(),
            Duration::from_millis(50)
        );
        assert!(DeviceTier::Entry.min_sampling_interval() > DeviceTier::Standard.min_sampling_interval());
    }

    #[test]
    fn test_command_states() {
        assert!(ConnectionState::Connected.accepts_commands());
        assert!(ConnectionState::Streaming.accepts_commands());
        assert!(!ConnectionState::Degraded.accepts_commands());
        assert!(!ConnectionState::Disconnected.accepts_commands());
    }
}
