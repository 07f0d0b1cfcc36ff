//! OBD-II mode 01 PID tables and value codecs

use obdsd_core::SensorType;

use crate::error::ParseError;

/// OBD service (mode) bytes
pub mod service {
    /// Mode 01: current powertrain data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Mode 03: stored trouble codes
    pub const STORED_DTCS: u8 = 0x03;
    /// Mode 04: clear trouble codes and MIL
    pub const CLEAR_DTCS: u8 = 0x04;
    /// Positive responses echo the mode plus this offset
    pub const RESPONSE_OFFSET: u8 = 0x40;
    /// First byte of a negative response
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Negative response codes the layer reacts to
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
    pub const BUSY_REPEAT_REQUEST: u8 = 0x21;
    pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
}

/// Mode 01 PID for a sensor
pub fn pid(sensor: SensorType) -> u8 {
    match sensor {
        SensorType::EngineLoad => 0x04,
        SensorType::CoolantTemp => 0x05,
        SensorType::ShortTermFuelTrim => 0x06,
        SensorType::LongTermFuelTrim => 0x07,
        SensorType::IntakeManifoldPressure => 0x0B,
        SensorType::EngineRpm => 0x0C,
        SensorType::VehicleSpeed => 0x0D,
        SensorType::IntakeAirTemp => 0x0F,
        SensorType::MassAirFlow => 0x10,
        SensorType::ThrottlePosition => 0x11,
        SensorType::O2SensorVoltage => 0x14,
        SensorType::FuelLevel => 0x2F,
        SensorType::ControlModuleVoltage => 0x42,
    }
}

/// Sensor a mode 01 PID belongs to
pub fn sensor_for_pid(pid: u8) -> Option<SensorType> {
    let sensor = match pid {
        0x04 => SensorType::EngineLoad,
        0x05 => SensorType::CoolantTemp,
        0x06 => SensorType::ShortTermFuelTrim,
        0x07 => SensorType::LongTermFuelTrim,
        0x0B => SensorType::IntakeManifoldPressure,
        0x0C => SensorType::EngineRpm,
        0x0D => SensorType::VehicleSpeed,
        0x0F => SensorType::IntakeAirTemp,
        0x10 => SensorType::MassAirFlow,
        0x11 => SensorType::ThrottlePosition,
        0x14 => SensorType::O2SensorVoltage,
        0x2F => SensorType::FuelLevel,
        0x42 => SensorType::ControlModuleVoltage,
        _ => return None,
    };
    Some(sensor)
}

/// Number of data bytes in the positive response for a sensor
pub fn data_len(sensor: SensorType) -> usize {
    match sensor {
        SensorType::EngineRpm
        | SensorType::MassAirFlow
        | SensorType::O2SensorVoltage
        | SensorType::ControlModuleVoltage => 2,
        _ => 1,
    }
}

/// Decode the data bytes of a positive mode 01 response into a physical value
pub fn decode_value(sensor: SensorType, data: &[u8]) -> Result<f64, ParseError> {
    let need = data_len(sensor);
    if data.len() < need {
        return Err(ParseError::Malformed(format!(
            "short data for {sensor:?}: {} of {need} bytes",
            data.len()
        )));
    }
    let a = data[0] as f64;
    let b = if need > 1 { data[1] as f64 } else { 0.0 };

    let value = match sensor {
        SensorType::EngineRpm => (a * 256.0 + b) / 4.0,
        SensorType::VehicleSpeed => a,
        SensorType::EngineLoad | SensorType::ThrottlePosition | SensorType::FuelLevel => {
            a * 100.0 / 255.0
        }
        SensorType::CoolantTemp | SensorType::IntakeAirTemp => a - 40.0,
        SensorType::ShortTermFuelTrim | SensorType::LongTermFuelTrim => (a - 128.0) * 100.0 / 128.0,
        SensorType::IntakeManifoldPressure => a,
        SensorType::MassAirFlow => (a * 256.0 + b) / 100.0,
        SensorType::O2SensorVoltage => a / 200.0,
        SensorType::ControlModuleVoltage => (a * 256.0 + b) / 1000.0,
    };
    Ok(value)
}

/// Encode a physical value into mode 01 response data bytes.
///
/// Inverse of [`decode_value`]; used by simulated devices.
pub fn encode_value(sensor: SensorType, value: f64) -> Vec<u8> {
    match sensor {
        SensorType::EngineRpm => {
            let raw = (value * 4.0).clamp(0.0, 65535.0) as u16;
            vec![(raw >> 8) as u8, (raw & 0xFF) as u8]
        }
        SensorType::VehicleSpeed | SensorType::IntakeManifoldPressure => {
            vec![value.clamp(0.0, 255.0) as u8]
        }
        SensorType::EngineLoad | SensorType::ThrottlePosition | SensorType::FuelLevel => {
            vec![(value * 255.0 / 100.0).clamp(0.0, 255.0) as u8]
        }
        SensorType::CoolantTemp | SensorType::IntakeAirTemp => {
            vec![(value + 40.0).clamp(0.0, 255.0) as u8]
        }
        SensorType::ShortTermFuelTrim | SensorType::LongTermFuelTrim => {
            vec![(value * 128.0 / 100.0 + 128.0).clamp(0.0, 255.0) as u8]
        }
        SensorType::MassAirFlow => {
            let raw = (value * 100.0).clamp(0.0, 65535.0) as u16;
            vec![(raw >> 8) as u8, (raw & 0xFF) as u8]
        }
        SensorType::O2SensorVoltage => {
            vec![(value * 200.0).clamp(0.0, 255.0) as u8, 0xFF]
        }
        SensorType::ControlModuleVoltage => {
            let raw = (value * 1000.0).clamp(0.0, 65535.0) as u16;
            vec![(raw >> 8) as u8, (raw & 0xFF) as u8]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rpm() {
        // 0x0BB8 / 4 = 750 rpm idle
        let value = decode_value(SensorType::EngineRpm, &[0x0B, 0xB8]).unwrap();
        assert_eq!(value, 750.0);
    }

    #[test]
    fn test_decode_coolant_temp_offset() {
        let value = decode_value(SensorType::CoolantTemp, &[0x7B]).unwrap();
        assert_eq!(value, 83.0);
    }

    #[test]
    fn test_decode_load_percent() {
        let value = decode_value(SensorType::EngineLoad, &[0xFF]).unwrap();
        assert_eq!(value, 100.0);
    }

    #[test]
    fn test_decode_fuel_trim_signed() {
        let zero = decode_value(SensorType::ShortTermFuelTrim, &[0x80]).unwrap();
        assert_eq!(zero, 0.0);
        let lean = decode_value(SensorType::ShortTermFuelTrim, &[0xA0]).unwrap();
        assert!(lean > 0.0);
        let rich = decode_value(SensorType::ShortTermFuelTrim, &[0x60]).unwrap();
        assert!(rich < 0.0);
    }

    #[test]
    fn test_decode_maf() {
        let value = decode_value(SensorType::MassAirFlow, &[0x02, 0x2B]).unwrap();
        assert_eq!(value, 5.55);
    }

    #[test]
    fn test_decode_short_data_rejected() {
        let err = decode_value(SensorType::EngineRpm, &[0x0B]).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_encode_decode_round_trip_rpm() {
        let data = encode_value(SensorType::EngineRpm, 3000.0);
        assert_eq!(data, vec![0x2E, 0xE0]);
        assert_eq!(decode_value(SensorType::EngineRpm, &data).unwrap(), 3000.0);
    }

    #[test]
    fn test_pid_table_round_trip() {
        for sensor in [
            SensorType::EngineRpm,
            SensorType::VehicleSpeed,
            SensorType::EngineLoad,
            SensorType::CoolantTemp,
            SensorType::IntakeManifoldPressure,
            SensorType::ThrottlePosition,
            SensorType::MassAirFlow,
            SensorType::FuelLevel,
            SensorType::ControlModuleVoltage,
            SensorType::O2SensorVoltage,
            SensorType::ShortTermFuelTrim,
            SensorType::LongTermFuelTrim,
            SensorType::IntakeAirTemp,
        ] {
            assert_eq!(sensor_for_pid(pid(sensor)), Some(sensor));
        }
        assert_eq!(sensor_for_pid(0xEE), None);
    }
}
