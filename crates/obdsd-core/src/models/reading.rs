//! Sensor reading models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensors the engine knows how to request and decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    EngineRpm,
    VehicleSpeed,
    EngineLoad,
    CoolantTemp,
    IntakeManifoldPressure,
    ThrottlePosition,
    MassAirFlow,
    FuelLevel,
    ControlModuleVoltage,
    O2SensorVoltage,
    ShortTermFuelTrim,
    LongTermFuelTrim,
    IntakeAirTemp,
}

impl SensorType {
    /// Unit the decoded value is expressed in
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::EngineRpm => "rpm",
            SensorType::VehicleSpeed => "km/h",
            SensorType::EngineLoad => "%",
            SensorType::CoolantTemp => "degC",
            SensorType::IntakeManifoldPressure => "kPa",
            SensorType::ThrottlePosition => "%",
            SensorType::MassAirFlow => "g/s",
            SensorType::FuelLevel => "%",
            SensorType::ControlModuleVoltage => "V",
            SensorType::O2SensorVoltage => "V",
            SensorType::ShortTermFuelTrim => "%",
            SensorType::LongTermFuelTrim => "%",
            SensorType::IntakeAirTemp => "degC",
        }
    }
}

/// Trust level of a decoded reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingQuality {
    /// Frame validated and decoded cleanly
    #[default]
    Good,
    /// Value decoded from a suspect frame (bad checksum)
    Poor,
}

/// One sampled sensor value. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sensor the value was read from
    pub sensor: SensorType,
    /// Decoded physical value
    pub value: f64,
    /// Unit of the value
    pub unit: String,
    /// Trust level of the decode
    #[serde(default)]
    pub quality: ReadingQuality,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// A clean reading stamped now
    pub fn new(sensor: SensorType, value: f64) -> Self {
        Self::with_quality(sensor, value, ReadingQuality::Good)
    }

    /// A reading with an explicit quality flag, stamped now
    pub fn with_quality(sensor: SensorType, value: f64, quality: ReadingQuality) -> Self {
        Self {
            sensor,
            value,
            unit: sensor.unit().to_string(),
            quality,
            timestamp: Utc::now(),
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == ReadingQuality::Good
    }
}

/// Aggregate of one sensor over a persistence window.
///
/// Sessions persist summaries rather than raw samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSummary {
    pub sensor: SensorType,
    /// Samples folded into this summary
    pub samples: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Most recent value in the window
    pub last: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_carries_sensor_unit() {
        let reading = SensorReading::new(SensorType::EngineRpm, 812.0);
        assert_eq!(reading.unit, "rpm");
        assert!(reading.is_good());
    }

    #[test]
    fn test_poor_reading_flagged() {
        let reading =
            SensorReading::with_quality(SensorType::CoolantTemp, 91.0, ReadingQuality::Poor);
        assert!(!reading.is_good());
    }
}
