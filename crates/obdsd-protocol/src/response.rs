//! Response decoding

use obdsd_core::{Protocol, ReadingQuality, SensorReading, SensorType};

use crate::dtc::dtc_code_string;
use crate::error::ParseError;
use crate::frame::{unwrap_response, Unwrapped};
use crate::passthrough::DecoderRegistry;
use crate::pid::{decode_value, nrc, pid, service};

fn positive(svc: u8) -> u8 {
    svc + service::RESPONSE_OFFSET
}

/// Map a negative response payload to an error for the given request service
fn negative_response(sensor: Option<SensorType>, payload: &[u8]) -> ParseError {
    let svc = payload.get(1).copied().unwrap_or(0);
    let code = payload.get(2).copied().unwrap_or(0);
    match (sensor, code) {
        (
            Some(sensor),
            nrc::SERVICE_NOT_SUPPORTED | nrc::SUB_FUNCTION_NOT_SUPPORTED | nrc::REQUEST_OUT_OF_RANGE,
        ) => ParseError::UnsupportedPid { sensor },
        _ => ParseError::NegativeResponse { service: svc, nrc: code },
    }
}

/// Decode a sensor response frame into a reading.
///
/// A well-formed frame with a broken checksum still decodes, flagged
/// [`ReadingQuality::Poor`]; the caller decides what to do with it.
pub fn parse_sensor_response(
    sensor: SensorType,
    protocol: &Protocol,
    raw: &[u8],
    decoders: &DecoderRegistry,
) -> Result<SensorReading, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Timeout);
    }
    let known = match protocol {
        Protocol::Known(known) => known,
        Protocol::PassThrough { decoder } => {
            let value = decoders.get(decoder)?.decode_sensor(sensor, raw)?;
            return Ok(SensorReading::new(sensor, value));
        }
    };

    let Unwrapped { payload, checksum_ok } = unwrap_response(*known, raw)?;
    match payload.first() {
        Some(&b) if b == service::NEGATIVE_RESPONSE => Err(negative_response(Some(sensor), &payload)),
        Some(&b) if b == positive(service::CURRENT_DATA) => {
            match payload.get(1) {
                Some(&echo) if echo == pid(sensor) => {}
                Some(&echo) => {
                    return Err(ParseError::Malformed(format!(
                        "PID echo {echo:#04x} does not match request {:#04x}",
                        pid(sensor)
                    )))
                }
                None => return Err(ParseError::Malformed("response missing PID echo".to_string())),
            }
            let value = decode_value(sensor, &payload[2..])?;
            let quality = if checksum_ok {
                ReadingQuality::Good
            } else {
                ReadingQuality::Poor
            };
            Ok(SensorReading::with_quality(sensor, value, quality))
        }
        // Suspect frame with an unrecognisable echo, nothing to salvage
        Some(_) if !checksum_ok => Err(ParseError::ChecksumMismatch),
        Some(&other) => Err(ParseError::Malformed(format!(
            "unexpected service echo {other:#04x}"
        ))),
        None => Err(ParseError::Malformed("empty service payload".to_string())),
    }
}

/// Decode a mode 03 response into trouble-code strings.
///
/// CAN responses carry a count byte; the serial protocols pack up to three
/// two-byte codes and pad with zero pairs.
pub fn parse_dtc_response(
    protocol: &Protocol,
    raw: &[u8],
    decoders: &DecoderRegistry,
) -> Result<Vec<String>, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Timeout);
    }
    let known = match protocol {
        Protocol::Known(known) => known,
        Protocol::PassThrough { decoder } => {
            return decoders.get(decoder)?.decode_trouble_codes(raw);
        }
    };

    let Unwrapped { payload, checksum_ok } = unwrap_response(*known, raw)?;
    if !checksum_ok {
        // Discrete codes from a corrupt frame are worthless
        return Err(ParseError::ChecksumMismatch);
    }
    match payload.first() {
        Some(&b) if b == service::NEGATIVE_RESPONSE => Err(negative_response(None, &payload)),
        Some(&b) if b == positive(service::STORED_DTCS) => {
            let pairs = if matches!(known, obdsd_core::KnownProtocol::Can) {
                let count = *payload.get(1).ok_or_else(|| {
                    ParseError::Malformed("mode 03 response missing count".to_string())
                })? as usize;
                let body = &payload[2..];
                if body.len() < count * 2 {
                    return Err(ParseError::Malformed(format!(
                        "mode 03 declares {count} codes in {} bytes",
                        body.len()
                    )));
                }
                &body[..count * 2]
            } else {
                &payload[1..]
            };
            Ok(pairs
                .chunks_exact(2)
                .filter(|pair| pair != &[0x00, 0x00])
                .map(|pair| dtc_code_string(pair[0], pair[1]))
                .collect())
        }
        Some(&other) => Err(ParseError::Malformed(format!(
            "unexpected service echo {other:#04x}"
        ))),
        None => Err(ParseError::Malformed("empty service payload".to_string())),
    }
}

/// Decode a mode 04 response, verifying the vehicle acknowledged the clear
pub fn parse_clear_response(protocol: &Protocol, raw: &[u8]) -> Result<(), ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Timeout);
    }
    let known = match protocol {
        Protocol::Known(known) => known,
        Protocol::PassThrough { .. } => {
            return Err(ParseError::Unsupported(
                "trouble-code clear over pass-through".to_string(),
            ))
        }
    };
    let Unwrapped { payload, checksum_ok } = unwrap_response(*known, raw)?;
    if !checksum_ok {
        return Err(ParseError::ChecksumMismatch);
    }
    match payload.first() {
        Some(&b) if b == positive(service::CLEAR_DTCS) => Ok(()),
        Some(&b) if b == service::NEGATIVE_RESPONSE => Err(negative_response(None, &payload)),
        Some(&other) => Err(ParseError::Malformed(format!(
            "unexpected service echo {other:#04x}"
        ))),
        None => Err(ParseError::Malformed("empty service payload".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use obdsd_core::KnownProtocol;

    use super::*;
    use crate::frame::{wrap_response, DEFAULT_ECU_ADDRESS};

    fn registry() -> DecoderRegistry {
        DecoderRegistry::new()
    }

    fn vehicle_frame(protocol: KnownProtocol, payload: &[u8]) -> Vec<u8> {
        wrap_response(protocol, DEFAULT_ECU_ADDRESS, payload).unwrap()
    }

    #[test]
    fn test_parse_rpm_over_can() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x41, 0x0C, 0x2E, 0xE0]);
        let reading = parse_sensor_response(
            SensorType::EngineRpm,
            &KnownProtocol::Can.into(),
            &raw,
            &registry(),
        )
        .unwrap();
        assert_eq!(reading.value, 3000.0);
        assert!(reading.is_good());
    }

    #[test]
    fn test_parse_coolant_over_iso9141() {
        let raw = vehicle_frame(KnownProtocol::Iso9141, &[0x41, 0x05, 0x87]);
        let reading = parse_sensor_response(
            SensorType::CoolantTemp,
            &KnownProtocol::Iso9141.into(),
            &raw,
            &registry(),
        )
        .unwrap();
        assert_eq!(reading.value, 95.0);
        assert_eq!(reading.unit, "degC");
    }

    #[test]
    fn test_unsupported_pid_from_nrc() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x7F, 0x01, 0x31]);
        let err = parse_sensor_response(
            SensorType::MassAirFlow,
            &KnownProtocol::Can.into(),
            &raw,
            &registry(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ParseError::UnsupportedPid {
                sensor: SensorType::MassAirFlow
            }
        );
    }

    #[test]
    fn test_busy_nrc_is_negative_response() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x7F, 0x01, 0x21]);
        let err = parse_sensor_response(
            SensorType::EngineRpm,
            &KnownProtocol::Can.into(),
            &raw,
            &registry(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ParseError::NegativeResponse {
                service: 0x01,
                nrc: 0x21
            }
        );
    }

    #[test]
    fn test_bad_checksum_decodes_poor() {
        let mut raw = vehicle_frame(KnownProtocol::Iso9141, &[0x41, 0x0D, 0x50]);
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let reading = parse_sensor_response(
            SensorType::VehicleSpeed,
            &KnownProtocol::Iso9141.into(),
            &raw,
            &registry(),
        )
        .unwrap();
        assert_eq!(reading.value, 80.0);
        assert_eq!(reading.quality, ReadingQuality::Poor);
    }

    #[test]
    fn test_pid_echo_mismatch_rejected() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x41, 0x0D, 0x50]);
        let err = parse_sensor_response(
            SensorType::EngineRpm,
            &KnownProtocol::Can.into(),
            &raw,
            &registry(),
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_dtc_codes_over_can_with_count() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x43, 0x02, 0x03, 0x00, 0x01, 0x01]);
        let codes =
            parse_dtc_response(&KnownProtocol::Can.into(), &raw, &registry()).unwrap();
        assert_eq!(codes, vec!["P0300".to_string(), "P0101".to_string()]);
    }

    #[test]
    fn test_dtc_codes_serial_zero_padded() {
        let raw = vehicle_frame(
            KnownProtocol::Iso9141,
            &[0x43, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        let codes =
            parse_dtc_response(&KnownProtocol::Iso9141.into(), &raw, &registry()).unwrap();
        assert_eq!(codes, vec!["P0300".to_string()]);
    }

    #[test]
    fn test_no_stored_codes_is_empty() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x43, 0x00]);
        let codes =
            parse_dtc_response(&KnownProtocol::Can.into(), &raw, &registry()).unwrap();
        assert!(codes.is_empty());
    }

    #[test]
    fn test_corrupt_dtc_frame_rejected() {
        let mut raw = vehicle_frame(KnownProtocol::Iso9141, &[0x43, 0x03, 0x00]);
        raw[0] = 0x48; // keep header, corrupt checksum
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let err =
            parse_dtc_response(&KnownProtocol::Iso9141.into(), &raw, &registry()).unwrap_err();
        assert_eq!(err, ParseError::ChecksumMismatch);
    }

    #[test]
    fn test_clear_acknowledged() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x44]);
        parse_clear_response(&KnownProtocol::Can.into(), &raw).unwrap();
    }

    #[test]
    fn test_clear_rejected_conditions_not_correct() {
        let raw = vehicle_frame(KnownProtocol::Can, &[0x7F, 0x04, 0x22]);
        let err = parse_clear_response(&KnownProtocol::Can.into(), &raw).unwrap_err();
        assert_eq!(
            err,
            ParseError::NegativeResponse {
                service: 0x04,
                nrc: 0x22
            }
        );
    }

    #[test]
    fn test_silent_bus_is_timeout() {
        let err = parse_sensor_response(
            SensorType::EngineRpm,
            &KnownProtocol::KLine.into(),
            &[],
            &registry(),
        )
        .unwrap_err();
        assert_eq!(err, ParseError::Timeout);
    }

    #[test]
    fn test_pass_through_uses_registered_decoder() {
        struct HalfDecoder;
        impl crate::passthrough::PayloadDecoder for HalfDecoder {
            fn decode_sensor(
                &self,
                _sensor: SensorType,
                payload: &[u8],
            ) -> Result<f64, ParseError> {
                Ok(payload[0] as f64 / 2.0)
            }
        }
        let registry = DecoderRegistry::new();
        registry.register("half", std::sync::Arc::new(HalfDecoder));
        let protocol = Protocol::PassThrough {
            decoder: "half".to_string(),
        };
        let reading =
            parse_sensor_response(SensorType::VehicleSpeed, &protocol, &[0x64], &registry)
                .unwrap();
        assert_eq!(reading.value, 50.0);
    }

    #[test]
    fn test_pass_through_unknown_decoder() {
        let protocol = Protocol::PassThrough {
            decoder: "ghost".to_string(),
        };
        let err = parse_sensor_response(SensorType::VehicleSpeed, &protocol, &[0x64], &registry())
            .unwrap_err();
        assert_eq!(err, ParseError::UnknownDecoder("ghost".to_string()));
    }
}
