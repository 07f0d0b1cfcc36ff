//! Device and transport configuration

use std::time::Duration;

use obdsd_core::{Device, TransportKind};
use serde::{Deserialize, Serialize};

/// Everything the hub needs to connect to one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub device: Device,
    /// Reachable endpoints, one per transport kind at most
    pub endpoints: Vec<EndpointConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub timings: TimingConfig,
}

impl DeviceConfig {
    /// Endpoint for a transport kind, if one is configured
    pub fn endpoint_for(&self, kind: TransportKind) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.kind() == kind)
    }

    /// Transport order to try: the device's stated preference, falling back
    /// to the order endpoints were configured in
    pub fn preference(&self) -> Vec<TransportKind> {
        if self.device.transport_preference.is_empty() {
            self.endpoints.iter().map(|e| e.kind()).collect()
        } else {
            self.device.transport_preference.clone()
        }
    }
}

/// Shared secret for the seed-key handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
}

/// One way to reach a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EndpointConfig {
    /// Direct socket to the adapter's access point, e.g. `tcp://192.168.0.10:35000`
    Wifi { url: String },
    /// RFCOMM-to-socket bridge on the local host
    Bluetooth { url: String },
    /// Relay endpoint reached over the cellular backhaul
    Cellular { url: String },
    /// In-process simulated device
    Mock {
        #[serde(default = "default_mock_kind")]
        kind: TransportKind,
        #[serde(default)]
        latency_ms: u64,
    },
}

fn default_mock_kind() -> TransportKind {
    TransportKind::Wifi
}

impl EndpointConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            EndpointConfig::Wifi { .. } => TransportKind::Wifi,
            EndpointConfig::Bluetooth { .. } => TransportKind::Bluetooth,
            EndpointConfig::Cellular { .. } => TransportKind::Cellular,
            EndpointConfig::Mock { kind, .. } => *kind,
        }
    }
}

/// Timeouts and retry behavior for one device connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_keepalive_interval_ms() -> u64 {
    2_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl TimingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Exponential backoff for reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Attempts on one transport before falling back to the next
    #[serde(default = "default_attempts_per_transport")]
    pub attempts_per_transport: u32,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_attempts_per_transport() -> u32 {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            multiplier: default_backoff_multiplier(),
            max_ms: default_backoff_max_ms(),
            attempts_per_transport: default_attempts_per_transport(),
        }
    }
}

impl BackoffConfig {
    /// Delay before the n-th attempt, 1-based
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use obdsd_core::{DeviceLifecycle, DeviceTier, KnownProtocol};

    use super::*;

    #[test]
    fn test_backoff_progression_capped() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_preference_falls_back_to_endpoint_order() {
        let config = DeviceConfig {
            device: Device {
                serial: "OBD-1".into(),
                model: "mk1".into(),
                tier: DeviceTier::Standard,
                supported_protocols: vec![KnownProtocol::Can.into()],
                transport_preference: vec![],
                lifecycle: DeviceLifecycle::Registered,
                tenant_id: None,
            },
            endpoints: vec![
                EndpointConfig::Bluetooth {
                    url: "tcp://127.0.0.1:7001".into(),
                },
                EndpointConfig::Wifi {
                    url: "tcp://192.168.0.9:35000".into(),
                },
            ],
            auth: AuthConfig {
                secret: "s3cret".into(),
            },
            timings: TimingConfig::default(),
        };
        assert_eq!(
            config.preference(),
            vec![TransportKind::Bluetooth, TransportKind::Wifi]
        );
        assert!(config.endpoint_for(TransportKind::Cellular).is_none());
    }

    #[test]
    fn test_device_config_toml() {
        let toml = r#"
            serial = "OBD-PRO-7"
            model = "falcon-pro"
            tier = "professional"
            supported_protocols = ["can", "iso9141"]
            transport_preference = ["wifi", "cellular"]
            endpoints = [
                { type = "wifi", url = "tcp://10.0.0.7:35000" },
                { type = "cellular", url = "tcp://relay.example:9400" },
            ]
            [auth]
            secret = "pass"
        "#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.device.serial, "OBD-PRO-7");
        assert_eq!(config.device.tier, DeviceTier::Professional);
        assert_eq!(config.timings.command_timeout_ms, 5_000);
        assert_eq!(config.preference()[0], TransportKind::Wifi);
    }
}
