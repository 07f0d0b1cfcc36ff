//! Per-manufacturer anomaly models.
//!
//! An [`AnomalyModel`] is a data table: hard threshold rules that fire
//! locally without any collaborator round trip, and a sensor-to-code
//! map used when the analysis service flags an anomaly without naming
//! a code. The [`ModelRegistry`] keys models by manufacturer (lowercase)
//! and supports hot swapping a table while sessions are running; each
//! evaluation resolves the current table, so a swap takes effect on the
//! next sample.

use std::collections::HashMap;
use std::sync::Arc;

use obdsd_core::{FaultSeverity, SensorReading, SensorType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Registry key answering for makes that have no table of their own.
pub const DEFAULT_MAKE: &str = "default";

/// Hard limit on one sensor. Either bound may be open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub sensor: SensorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub code: String,
    pub severity: FaultSeverity,
    pub description: String,
}

impl ThresholdRule {
    pub fn violated_by(&self, reading: &SensorReading) -> bool {
        if reading.sensor != self.sensor {
            return false;
        }
        if let Some(min) = self.min {
            if reading.value < min {
                return true;
            }
        }
        if let Some(max) = self.max {
            if reading.value > max {
                return true;
            }
        }
        false
    }
}

/// Fallback code for an unnamed anomaly on one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMapping {
    pub sensor: SensorType,
    pub code: String,
    pub description: String,
}

/// One manufacturer's detection table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyModel {
    /// Table version, carried into AI diagnoses produced under it
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub threshold_rules: Vec<ThresholdRule>,
    #[serde(default)]
    pub anomaly_map: Vec<AnomalyMapping>,
}

impl AnomalyModel {
    /// All threshold rules the reading violates.
    pub fn violated<'a, 'b>(
        &'a self,
        reading: &'b SensorReading,
    ) -> impl Iterator<Item = &'a ThresholdRule> + use<'a, 'b> {
        self.threshold_rules
            .iter()
            .filter(move |rule| rule.violated_by(reading))
    }

    pub fn mapping_for(&self, sensor: SensorType) -> Option<&AnomalyMapping> {
        self.anomaly_map.iter().find(|m| m.sensor == sensor)
    }

    /// Description for a code known to this table, if any.
    pub fn code_description(&self, code: &str) -> Option<&str> {
        self.threshold_rules
            .iter()
            .find(|r| r.code == code)
            .map(|r| r.description.as_str())
            .or_else(|| {
                self.anomaly_map
                    .iter()
                    .find(|m| m.code == code)
                    .map(|m| m.description.as_str())
            })
    }
}

/// Thread-safe table store, swappable at runtime.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<AnomalyModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in default table.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.replace(DEFAULT_MAKE, builtin_default_model());
        registry
    }

    /// Install or replace the table for one make. Returns the table it
    /// displaced. Sessions pick the new table up on their next sample.
    pub fn replace(&self, make: &str, model: AnomalyModel) -> Option<Arc<AnomalyModel>> {
        let key = make.to_lowercase();
        info!(make = %key, version = %model.version, "Anomaly model installed");
        self.models.write().insert(key, Arc::new(model))
    }

    /// Table for a make, falling back to the default table.
    pub fn resolve(&self, make: &str) -> Option<Arc<AnomalyModel>> {
        let models = self.models.read();
        models
            .get(&make.to_lowercase())
            .or_else(|| models.get(DEFAULT_MAKE))
            .cloned()
    }

    /// Load tables from a YAML document mapping make to model. Returns
    /// how many tables were installed.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize, serde_yaml::Error> {
        let tables: HashMap<String, AnomalyModel> = serde_yaml::from_str(yaml)?;
        let count = tables.len();
        for (make, model) in tables {
            self.replace(&make, model);
        }
        Ok(count)
    }

    pub fn makes(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }
}

/// Conservative generic table applied when a make has nothing of its own.
pub fn builtin_default_model() -> AnomalyModel {
    AnomalyModel {
        version: "builtin-1".into(),
        threshold_rules: vec![
            ThresholdRule {
                sensor: SensorType::CoolantTemp,
                min: None,
                max: Some(115.0),
                code: "P0217".into(),
                severity: FaultSeverity::Critical,
                description: "Engine overtemperature condition".into(),
            },
            ThresholdRule {
                sensor: SensorType::EngineRpm,
                min: None,
                max: Some(6_800.0),
                code: "P0219".into(),
                severity: FaultSeverity::Error,
                description: "Engine overspeed condition".into(),
            },
            ThresholdRule {
                sensor: SensorType::ControlModuleVoltage,
                min: Some(11.0),
                max: None,
                code: "P0562".into(),
                severity: FaultSeverity::Warning,
                description: "System voltage low".into(),
            },
            ThresholdRule {
                sensor: SensorType::ControlModuleVoltage,
                min: None,
                max: Some(16.0),
                code: "P0563".into(),
                severity: FaultSeverity::Warning,
                description: "System voltage high".into(),
            },
        ],
        anomaly_map: vec![
            AnomalyMapping {
                sensor: SensorType::EngineRpm,
                code: "P0300".into(),
                description: "Random or multiple cylinder misfire detected".into(),
            },
            AnomalyMapping {
                sensor: SensorType::CoolantTemp,
                code: "P0128".into(),
                description: "Coolant thermostat below regulating temperature".into(),
            },
            AnomalyMapping {
                sensor: SensorType::MassAirFlow,
                code: "P0101".into(),
                description: "Mass air flow sensor range or performance".into(),
            },
            AnomalyMapping {
                sensor: SensorType::O2SensorVoltage,
                code: "P0130".into(),
                description: "O2 sensor circuit malfunction".into(),
            },
            AnomalyMapping {
                sensor: SensorType::ThrottlePosition,
                code: "P0121".into(),
                description: "Throttle position sensor range or performance".into(),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(sensor: SensorType, value: f64) -> SensorReading {
        SensorReading::new(sensor, value)
    }

    #[test]
    fn test_threshold_rule_bounds() {
        let rule = ThresholdRule {
            sensor: SensorType::ControlModuleVoltage,
            min: Some(11.0),
            max: Some(16.0),
            code: "P0562".into(),
            severity: FaultSeverity::Warning,
            description: "System voltage out of range".into(),
        };
        assert!(rule.violated_by(&reading(SensorType::ControlModuleVoltage, 10.2)));
        assert!(rule.violated_by(&reading(SensorType::ControlModuleVoltage, 16.5)));
        assert!(!rule.violated_by(&reading(SensorType::ControlModuleVoltage, 13.8)));
        // A different sensor never matches, whatever the value.
        assert!(!rule.violated_by(&reading(SensorType::EngineRpm, 0.0)));
    }

    #[test]
    fn test_builtin_table_flags_overheat() {
        let model = builtin_default_model();
        let hits: Vec<_> = model.violated(&reading(SensorType::CoolantTemp, 121.0)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "P0217");
        assert_eq!(hits[0].severity, FaultSeverity::Critical);

        assert!(model
            .violated(&reading(SensorType::CoolantTemp, 90.0))
            .next()
            .is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let registry = ModelRegistry::with_builtin();
        let model = registry.resolve("Volkswagen").unwrap();
        assert_eq!(model.version, "builtin-1");

        // Empty registry has nothing to answer with.
        let empty = ModelRegistry::new();
        assert!(empty.resolve("Volkswagen").is_none());
    }

    #[test]
    fn test_replace_hot_swaps_table() {
        let registry = ModelRegistry::with_builtin();
        let old = registry.replace(
            "default",
            AnomalyModel {
                version: "v2".into(),
                ..AnomalyModel::default()
            },
        );
        assert_eq!(old.unwrap().version, "builtin-1");
        assert_eq!(registry.resolve("anything").unwrap().version, "v2");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = ModelRegistry::new();
        registry.replace(
            "Toyota",
            AnomalyModel {
                version: "toyota-1".into(),
                ..AnomalyModel::default()
            },
        );
        assert_eq!(registry.resolve("TOYOTA").unwrap().version, "toyota-1");
        assert_eq!(registry.resolve("toyota").unwrap().version, "toyota-1");
    }

    #[test]
    fn test_load_yaml_tables() {
        let registry = ModelRegistry::new();
        let yaml = r#"
toyota:
  version: toyota-2
  threshold_rules:
    - sensor: coolant_temp
      max: 110.0
      code: P0217
      severity: critical
      description: Engine overtemperature condition
bmw:
  version: bmw-1
  anomaly_map:
    - sensor: engine_rpm
      code: P0300
      description: Random or multiple cylinder misfire detected
"#;
        let installed = registry.load_yaml(yaml).unwrap();
        assert_eq!(installed, 2);

        let toyota = registry.resolve("toyota").unwrap();
        assert_eq!(toyota.version, "toyota-2");
        assert!(toyota
            .violated(&reading(SensorType::CoolantTemp, 112.0))
            .next()
            .is_some());

        let bmw = registry.resolve("bmw").unwrap();
        assert_eq!(bmw.mapping_for(SensorType::EngineRpm).unwrap().code, "P0300");
    }

    #[test]
    fn test_code_description_searches_rules_and_map() {
        let model = builtin_default_model();
        assert_eq!(
            model.code_description("P0219"),
            Some("Engine overspeed condition")
        );
        assert_eq!(
            model.code_description("P0101"),
            Some("Mass air flow sensor range or performance")
        );
        assert!(model.code_description("P9999").is_none());
    }
}
