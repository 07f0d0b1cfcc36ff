//! Daemon configuration: TOML file with an `[engine]` section, `[[devices]]`
//! registrations and an optional `[demo]` session.

use anyhow::Context;
use obdsd_core::Device;
use obdsd_device::{AuthConfig, DeviceConfig, EndpointConfig, TimingConfig};
use obdsd_session::{EngineConfig, ModelProfileSet};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub demo: Option<DemoConfig>,
}

/// One `[[devices]]` entry. Differs from [`DeviceConfig`] only in that
/// timings are optional and fall back to the `[engine]` values.
#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    #[serde(flatten)]
    pub device: Device,
    pub endpoints: Vec<EndpointConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub timings: Option<TimingConfig>,
}

impl DeviceEntry {
    /// Assemble the hub registration. A model profile may supply the
    /// transport order when the entry does not pin its own.
    pub fn into_device_config(
        self,
        engine: &EngineConfig,
        profiles: &ModelProfileSet,
    ) -> DeviceConfig {
        let mut device = self.device;
        if device.transport_preference.is_empty() {
            if let Some(preference) = profiles
                .get(&device.model)
                .and_then(|p| p.transport_preference.clone())
            {
                device.transport_preference = preference;
            }
        }
        DeviceConfig {
            device,
            endpoints: self.endpoints,
            auth: self.auth,
            timings: self.timings.unwrap_or_else(|| engine.timing_config()),
        }
    }
}

/// Demo session run at startup. Implied with built-in defaults when the
/// daemon starts without a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    /// Device to run against; the first registered device when unset
    #[serde(default)]
    pub device_serial: Option<String>,
    #[serde(default = "default_demo_technician")]
    pub technician_id: String,
    #[serde(default = "default_demo_vin")]
    pub vin: String,
    #[serde(default = "default_demo_make")]
    pub make: String,
    #[serde(default = "default_demo_model")]
    pub model: String,
    #[serde(default = "default_demo_year")]
    pub model_year: u16,
}

fn default_demo_technician() -> String {
    "demo-technician".to_string()
}

fn default_demo_vin() -> String {
    "WVWZZZ1JZXW000001".to_string()
}

fn default_demo_make() -> String {
    "Volkswagen".to_string()
}

fn default_demo_model() -> String {
    "Golf".to_string()
}

fn default_demo_year() -> u16 {
    2019
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            device_serial: None,
            technician_id: default_demo_technician(),
            vin: default_demo_vin(),
            make: default_demo_make(),
            model: default_demo_model(),
            model_year: default_demo_year(),
        }
    }
}

pub fn load_config_file(path: &str) -> anyhow::Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    parse_config(&content).with_context(|| format!("parsing config file {path}"))
}

pub fn parse_config(content: &str) -> anyhow::Result<DaemonConfig> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obdsd_core::{DeviceTier, TransportKind};
    use obdsd_session::ModelProfile;

    const FULL: &str = r#"
        [engine]
        sampling_interval_ms = 200
        queue_capacity = 64

        [[devices]]
        serial = "OBD-PRO-7"
        model = "falcon-pro"
        tier = "professional"
        supported_protocols = ["can"]
        transport_preference = ["wifi", "cellular"]
        endpoints = [
            { type = "wifi", url = "tcp://10.0.0.7:35000" },
            { type = "cellular", url = "tcp://relay.example:9400" },
        ]
        auth = { secret = "pass" }

        [demo]
        device_serial = "OBD-PRO-7"
        technician_id = "tech-42"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(FULL).unwrap();
        assert_eq!(config.engine.sampling_interval_ms, 200);
        assert_eq!(config.engine.queue_capacity, 64);
        // Unset engine fields keep defaults.
        assert_eq!(config.engine.loss_timeout_ms, 120_000);

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].device.serial, "OBD-PRO-7");
        assert_eq!(config.devices[0].device.tier, DeviceTier::Professional);
        assert!(config.devices[0].timings.is_none());

        let demo = config.demo.unwrap();
        assert_eq!(demo.device_serial.as_deref(), Some("OBD-PRO-7"));
        assert_eq!(demo.technician_id, "tech-42");
        // Vehicle fields fall back to the built-in demo car.
        assert_eq!(demo.model_year, 2019);
    }

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.engine.sampling_interval_ms, 100);
        assert!(config.devices.is_empty());
        assert!(config.demo.is_none());
    }

    #[test]
    fn test_device_timings_fall_back_to_engine() {
        let config = parse_config(FULL).unwrap();
        let engine = EngineConfig {
            command_timeout_ms: 9_000,
            ..config.engine.clone()
        };
        let device_config = config
            .devices
            .into_iter()
            .next()
            .unwrap()
            .into_device_config(&engine, &ModelProfileSet::default());
        assert_eq!(device_config.timings.command_timeout_ms, 9_000);
    }

    #[test]
    fn test_profile_preference_fills_unpinned_devices() {
        let toml = r#"
            [[devices]]
            serial = "OBD-9"
            model = "mk1"
            tier = "standard"
            supported_protocols = ["can"]
            endpoints = [{ type = "bluetooth", url = "tcp://127.0.0.1:7001" }]
            auth = { secret = "pass" }
        "#;
        let config = parse_config(toml).unwrap();

        let mut profiles = ModelProfileSet::default();
        profiles.insert(
            "mk1",
            ModelProfile {
                transport_preference: Some(vec![TransportKind::Bluetooth, TransportKind::Wifi]),
                ..ModelProfile::default()
            },
        );

        let device_config = config
            .devices
            .into_iter()
            .next()
            .unwrap()
            .into_device_config(&EngineConfig::default(), &profiles);
        assert_eq!(
            device_config.device.transport_preference,
            vec![TransportKind::Bluetooth, TransportKind::Wifi]
        );
    }
}
