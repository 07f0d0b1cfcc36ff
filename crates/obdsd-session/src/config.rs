//! Engine tunables and per-model device profiles.
//!
//! [`EngineConfig`] holds the fleet-wide defaults. A [`ModelProfileSet`]
//! overlays overrides keyed by device model name; the effective config
//! for one session comes out of [`EngineConfig::for_device`], which also
//! clamps the sampling interval to what the device tier is rated for.

use std::collections::HashMap;
use std::time::Duration;

use obdsd_core::{Device, DeviceTier, TransportKind};
use obdsd_device::{BackoffConfig, TimingConfig};
use serde::{Deserialize, Serialize};

/// Fleet-wide engine defaults. Every field has a serde default so a
/// partial config file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target sampling interval. The device tier sets a floor.
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Per-call budget for the analysis collaborator
    #[serde(default = "default_ai_timeout_ms")]
    pub ai_timeout_ms: u64,
    /// Capacity of each consumer queue in the fan-out
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Readings kept per sensor for the live view
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Continuous connection loss tolerated before the session errors
    #[serde(default = "default_loss_timeout_ms")]
    pub loss_timeout_ms: u64,
    /// Poll stored trouble codes every this many sampling ticks
    #[serde(default = "default_dtc_poll_ticks")]
    pub dtc_poll_ticks: u32,
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_sampling_interval_ms() -> u64 {
    100
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_keepalive_interval_ms() -> u64 {
    2_000
}

fn default_ai_timeout_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_recent_window() -> usize {
    120
}

fn default_loss_timeout_ms() -> u64 {
    120_000
}

fn default_dtc_poll_ticks() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: default_sampling_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            ai_timeout_ms: default_ai_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            recent_window: default_recent_window(),
            loss_timeout_ms: default_loss_timeout_ms(),
            dtc_poll_ticks: default_dtc_poll_ticks(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_timeout_ms)
    }

    pub fn loss_timeout(&self) -> Duration {
        Duration::from_millis(self.loss_timeout_ms)
    }

    /// Connection-layer timings derived from this config, for devices
    /// whose registration does not carry explicit timings.
    pub fn timing_config(&self) -> TimingConfig {
        TimingConfig {
            handshake_timeout_ms: self.handshake_timeout_ms,
            command_timeout_ms: self.command_timeout_ms,
            keepalive_interval_ms: self.keepalive_interval_ms,
            reconnect: self.reconnect.clone(),
        }
    }

    /// Effective config for one device: model profile overrides applied,
    /// then the sampling interval clamped to the tier floor.
    pub fn for_device(&self, device: &Device, profiles: &ModelProfileSet) -> EngineConfig {
        let mut effective = self.clone();
        let mut tier = device.tier;
        if let Some(profile) = profiles.get(&device.model) {
            profile.apply(&mut effective);
            if let Some(t) = profile.tier {
                tier = t;
            }
        }
        let floor = tier.min_sampling_interval().as_millis() as u64;
        if effective.sampling_interval_ms < floor {
            effective.sampling_interval_ms = floor;
        }
        effective
    }
}

/// Overrides for one device model. Only the set fields replace the
/// fleet defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelProfile {
    /// Treat devices of this model as a different tier than reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<DeviceTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_window: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtc_poll_ticks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<BackoffConfig>,
    /// Transport order known to work best for this model; applied when
    /// the device registration does not pin its own order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_preference: Option<Vec<TransportKind>>,
}

impl ModelProfile {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(v) = self.sampling_interval_ms {
            config.sampling_interval_ms = v;
        }
        if let Some(v) = self.command_timeout_ms {
            config.command_timeout_ms = v;
        }
        if let Some(v) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = v;
        }
        if let Some(v) = self.keepalive_interval_ms {
            config.keepalive_interval_ms = v;
        }
        if let Some(v) = self.ai_timeout_ms {
            config.ai_timeout_ms = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.recent_window {
            config.recent_window = v;
        }
        if let Some(v) = self.loss_timeout_ms {
            config.loss_timeout_ms = v;
        }
        if let Some(v) = self.dtc_poll_ticks {
            config.dtc_poll_ticks = v;
        }
        if let Some(v) = &self.reconnect {
            config.reconnect = v.clone();
        }
    }
}

/// Model profiles keyed by device model name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelProfileSet {
    profiles: HashMap<String, ModelProfile>,
}

impl ModelProfileSet {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn get(&self, model: &str) -> Option<&ModelProfile> {
        self.profiles.get(model)
    }

    pub fn insert(&mut self, model: impl Into<String>, profile: ModelProfile) {
        self.profiles.insert(model.into(), profile);
    }

    /// Merge another set into this one; the other side wins on clashes.
    pub fn merge(&mut self, other: ModelProfileSet) {
        self.profiles.extend(other.profiles);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}
