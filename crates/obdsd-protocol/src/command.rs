//! Command building

use bytes::Bytes;
use obdsd_core::{Protocol, SensorType};

use crate::error::ParseError;
use crate::frame::wrap_request;
use crate::pid::{pid, service};

/// What a command asks the vehicle for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Mode 01 read of one sensor
    ReadSensor(SensorType),
    /// Mode 03 stored trouble codes
    ReadTroubleCodes,
    /// Mode 04 clear trouble codes
    ClearTroubleCodes,
}

/// A fully framed command ready for a device link
#[derive(Debug, Clone)]
pub struct Command {
    pub protocol: Protocol,
    pub kind: CommandKind,
    /// Wire frame including protocol header and checksum
    pub frame: Bytes,
}

impl Command {
    /// Sensor this command reads, if it is a sensor read
    pub fn sensor(&self) -> Option<SensorType> {
        match self.kind {
            CommandKind::ReadSensor(sensor) => Some(sensor),
            _ => None,
        }
    }
}

fn build(protocol: &Protocol, kind: CommandKind, payload: &[u8]) -> Result<Command, ParseError> {
    let frame = match protocol {
        Protocol::Known(known) => wrap_request(*known, payload)?,
        // Pass-through frames go to the device as-is
        Protocol::PassThrough { .. } => payload.to_vec(),
    };
    Ok(Command {
        protocol: protocol.clone(),
        kind,
        frame: Bytes::from(frame),
    })
}

/// Build a mode 01 request for one sensor
pub fn build_sensor_request(protocol: &Protocol, sensor: SensorType) -> Result<Command, ParseError> {
    build(
        protocol,
        CommandKind::ReadSensor(sensor),
        &[service::CURRENT_DATA, pid(sensor)],
    )
}

/// Build a mode 03 stored-DTC request
pub fn build_dtc_request(protocol: &Protocol) -> Result<Command, ParseError> {
    build(protocol, CommandKind::ReadTroubleCodes, &[service::STORED_DTCS])
}

/// Build a mode 04 clear-DTC request
pub fn build_clear_request(protocol: &Protocol) -> Result<Command, ParseError> {
    build(protocol, CommandKind::ClearTroubleCodes, &[service::CLEAR_DTCS])
}

#[cfg(test)]
mod tests {
    use obdsd_core::KnownProtocol;

    use super::*;

    #[test]
    fn test_sensor_request_frames_differ_by_protocol() {
        let can = build_sensor_request(&KnownProtocol::Can.into(), SensorType::EngineRpm).unwrap();
        let iso = build_sensor_request(&KnownProtocol::Iso9141.into(), SensorType::EngineRpm)
            .unwrap();
        assert_eq!(can.frame.len(), 8);
        assert_eq!(&iso.frame[..3], &[0x68, 0x6A, 0xF1]);
        assert_eq!(can.sensor(), Some(SensorType::EngineRpm));
    }

    #[test]
    fn test_pass_through_frame_is_bare_payload() {
        let protocol = Protocol::PassThrough {
            decoder: "vw_tp20".to_string(),
        };
        let cmd = build_sensor_request(&protocol, SensorType::CoolantTemp).unwrap();
        assert_eq!(&cmd.frame[..], &[0x01, 0x05]);
    }

    #[test]
    fn test_dtc_request_payload() {
        let cmd = build_dtc_request(&KnownProtocol::KLine.into()).unwrap();
        // mode 03 plus sum checksum
        assert_eq!(&cmd.frame[..], &[0x03, 0x03]);
        assert_eq!(cmd.sensor(), None);
    }
}
