//! Per-protocol frame wrapping and unwrapping.
//!
//! CAN carries ISO-TP single frames (the CAN hardware already checksums);
//! the serial protocols carry a three-byte header and a trailing checksum
//! byte, 8-bit sum for the ISO variants and SAE J1850 CRC-8 for J1850.

use obdsd_core::KnownProtocol;

use crate::error::ParseError;

const J1850_CRC: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SAE_J1850);

/// ISO-TP padding byte for CAN frames
pub const CAN_PADDING: u8 = 0xCC;
/// Classic CAN data length
pub const CAN_FRAME_LEN: usize = 8;
/// Tester (scan tool) source address on serial buses
pub const TESTER_ADDRESS: u8 = 0xF1;
/// Default ECU address used by simulated devices
pub const DEFAULT_ECU_ADDRESS: u8 = 0x10;

/// Functional request headers, tester to vehicle
mod request_header {
    pub const ISO9141: [u8; 2] = [0x68, 0x6A];
    pub const J1850_PWM: [u8; 2] = [0x61, 0x6A];
    pub const J1850_VPW: [u8; 2] = [0x68, 0x6A];
    /// KWP2000 functional addressing bits in the format byte
    pub const ISO14230_FMT: u8 = 0xC0;
    /// KWP2000 functional target address
    pub const ISO14230_TARGET: u8 = 0x33;
}

/// Response headers, vehicle to tester
mod response_header {
    pub const ISO9141: [u8; 2] = [0x48, 0x6B];
    pub const J1850_PWM: [u8; 2] = [0x41, 0x6B];
    pub const J1850_VPW: [u8; 2] = [0x48, 0x6B];
    /// KWP2000 physical addressing bits in the format byte
    pub const ISO14230_FMT: u8 = 0x80;
}

/// Unwrapped response: bare service payload plus checksum verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    pub payload: Vec<u8>,
    /// False when the frame checksum does not match its content
    pub checksum_ok: bool,
}

fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn j1850_checksum(bytes: &[u8]) -> u8 {
    J1850_CRC.checksum(bytes)
}

fn isotp_wrap(payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    if payload.len() > 7 {
        return Err(ParseError::Unsupported(
            "ISO-TP multi-frame payloads".to_string(),
        ));
    }
    let mut frame = Vec::with_capacity(CAN_FRAME_LEN);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.resize(CAN_FRAME_LEN, CAN_PADDING);
    Ok(frame)
}

fn isotp_unwrap(raw: &[u8]) -> Result<Unwrapped, ParseError> {
    let pci = raw[0];
    if pci >> 4 != 0 {
        return Err(ParseError::Unsupported(
            "ISO-TP multi-frame responses".to_string(),
        ));
    }
    let len = (pci & 0x0F) as usize;
    if len == 0 || raw.len() < 1 + len {
        return Err(ParseError::Malformed(format!(
            "ISO-TP length {len} exceeds frame of {} bytes",
            raw.len()
        )));
    }
    Ok(Unwrapped {
        payload: raw[1..1 + len].to_vec(),
        checksum_ok: true,
    })
}

fn headered_wrap(header: &[u8; 2], source: u8, payload: &[u8], crc: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(header);
    frame.push(source);
    frame.extend_from_slice(payload);
    let cs = if crc {
        j1850_checksum(&frame)
    } else {
        sum_checksum(&frame)
    };
    frame.push(cs);
    frame
}

fn headered_unwrap(header: &[u8; 2], raw: &[u8], crc: bool) -> Result<Unwrapped, ParseError> {
    if raw.len() < 5 {
        return Err(ParseError::Malformed(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != header[0] || raw[1] != header[1] {
        return Err(ParseError::Malformed(format!(
            "unexpected header {:02x} {:02x}",
            raw[0], raw[1]
        )));
    }
    let (body, cs) = raw.split_at(raw.len() - 1);
    let expected = if crc {
        j1850_checksum(body)
    } else {
        sum_checksum(body)
    };
    Ok(Unwrapped {
        payload: body[3..].to_vec(),
        checksum_ok: cs[0] == expected,
    })
}

fn kwp_wrap(fmt_bits: u8, target: u8, source: u8, payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    if payload.len() > 0x3F {
        return Err(ParseError::Unsupported(
            "KWP2000 payloads over 63 bytes".to_string(),
        ));
    }
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(fmt_bits | payload.len() as u8);
    frame.push(target);
    frame.push(source);
    frame.extend_from_slice(payload);
    frame.push(sum_checksum(&frame));
    Ok(frame)
}

fn kwp_unwrap(fmt_bits: u8, target: u8, raw: &[u8]) -> Result<Unwrapped, ParseError> {
    if raw.len() < 5 {
        return Err(ParseError::Malformed(format!(
            "KWP frame too short: {} bytes",
            raw.len()
        )));
    }
    let fmt = raw[0];
    if fmt & 0xC0 != fmt_bits {
        return Err(ParseError::Malformed(format!(
            "unexpected KWP format byte {fmt:#04x}"
        )));
    }
    let len = (fmt & 0x3F) as usize;
    if raw[1] != target {
        return Err(ParseError::Malformed(format!(
            "KWP frame addressed to {:#04x}",
            raw[1]
        )));
    }
    if raw.len() < 3 + len + 1 {
        return Err(ParseError::Malformed(format!(
            "KWP length {len} exceeds frame of {} bytes",
            raw.len()
        )));
    }
    let body = &raw[..3 + len];
    Ok(Unwrapped {
        payload: body[3..].to_vec(),
        checksum_ok: raw[3 + len] == sum_checksum(body),
    })
}

/// Wrap a service payload into a request frame for the given protocol
pub fn wrap_request(protocol: KnownProtocol, payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    match protocol {
        KnownProtocol::Can => isotp_wrap(payload),
        KnownProtocol::KLine => {
            let mut frame = payload.to_vec();
            frame.push(sum_checksum(payload));
            Ok(frame)
        }
        KnownProtocol::Iso9141 => Ok(headered_wrap(
            &request_header::ISO9141,
            TESTER_ADDRESS,
            payload,
            false,
        )),
        KnownProtocol::J1850Pwm => Ok(headered_wrap(
            &request_header::J1850_PWM,
            TESTER_ADDRESS,
            payload,
            true,
        )),
        KnownProtocol::J1850Vpw => Ok(headered_wrap(
            &request_header::J1850_VPW,
            TESTER_ADDRESS,
            payload,
            true,
        )),
        KnownProtocol::Iso14230 => kwp_wrap(
            request_header::ISO14230_FMT,
            request_header::ISO14230_TARGET,
            TESTER_ADDRESS,
            payload,
        ),
    }
}

/// Wrap a service payload into a response frame as a vehicle ECU would.
///
/// Counterpart of [`wrap_request`], used by simulated devices and tests.
pub fn wrap_response(
    protocol: KnownProtocol,
    ecu: u8,
    payload: &[u8],
) -> Result<Vec<u8>, ParseError> {
    match protocol {
        KnownProtocol::Can => isotp_wrap(payload),
        KnownProtocol::KLine => {
            let mut frame = payload.to_vec();
            frame.push(sum_checksum(payload));
            Ok(frame)
        }
        KnownProtocol::Iso9141 => Ok(headered_wrap(&response_header::ISO9141, ecu, payload, false)),
        KnownProtocol::J1850Pwm => {
            Ok(headered_wrap(&response_header::J1850_PWM, ecu, payload, true))
        }
        KnownProtocol::J1850Vpw => {
            Ok(headered_wrap(&response_header::J1850_VPW, ecu, payload, true))
        }
        KnownProtocol::Iso14230 => kwp_wrap(
            response_header::ISO14230_FMT,
            TESTER_ADDRESS,
            ecu,
            payload,
        ),
    }
}

/// Strip protocol framing from a response.
///
/// An empty frame is the device's marker for a silent vehicle bus and maps
/// to [`ParseError::Timeout`]. A failed checksum is reported in
/// [`Unwrapped::checksum_ok`] rather than as an error; the payload may still
/// decode and the caller decides how much to trust it.
pub fn unwrap_response(protocol: KnownProtocol, raw: &[u8]) -> Result<Unwrapped, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Timeout);
    }
    match protocol {
        KnownProtocol::Can => isotp_unwrap(raw),
        KnownProtocol::KLine => kline_unwrap(raw),
        KnownProtocol::Iso9141 => headered_unwrap(&response_header::ISO9141, raw, false),
        KnownProtocol::J1850Pwm => headered_unwrap(&response_header::J1850_PWM, raw, true),
        KnownProtocol::J1850Vpw => headered_unwrap(&response_header::J1850_VPW, raw, true),
        KnownProtocol::Iso14230 => {
            kwp_unwrap(response_header::ISO14230_FMT, TESTER_ADDRESS, raw)
        }
    }
}

/// Strip protocol framing from a request, as a vehicle ECU would.
///
/// Counterpart of [`wrap_request`], used by simulated devices and tests.
pub fn unwrap_request(protocol: KnownProtocol, raw: &[u8]) -> Result<Unwrapped, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Malformed("empty request frame".to_string()));
    }
    match protocol {
        KnownProtocol::Can => isotp_unwrap(raw),
        KnownProtocol::KLine => kline_unwrap(raw),
        KnownProtocol::Iso9141 => headered_unwrap(&request_header::ISO9141, raw, false),
        KnownProtocol::J1850Pwm => headered_unwrap(&request_header::J1850_PWM, raw, true),
        KnownProtocol::J1850Vpw => headered_unwrap(&request_header::J1850_VPW, raw, true),
        KnownProtocol::Iso14230 => kwp_unwrap(
            request_header::ISO14230_FMT,
            request_header::ISO14230_TARGET,
            raw,
        ),
    }
}

fn kline_unwrap(raw: &[u8]) -> Result<Unwrapped, ParseError> {
    if raw.len() < 2 {
        return Err(ParseError::Malformed("K-Line frame under 2 bytes".to_string()));
    }
    let (body, cs) = raw.split_at(raw.len() - 1);
    Ok(Unwrapped {
        payload: body.to_vec(),
        checksum_ok: cs[0] == sum_checksum(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_request_is_padded_single_frame() {
        let frame = wrap_request(KnownProtocol::Can, &[0x01, 0x0C]).unwrap();
        assert_eq!(frame, vec![0x02, 0x01, 0x0C, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn test_iso9141_request_header_and_checksum() {
        let frame = wrap_request(KnownProtocol::Iso9141, &[0x01, 0x0D]).unwrap();
        // 68 6A F1 01 0D, sum = 0xD1
        assert_eq!(frame, vec![0x68, 0x6A, 0xF1, 0x01, 0x0D, 0xD1]);
    }

    #[test]
    fn test_kwp_format_byte_carries_length() {
        let frame = wrap_request(KnownProtocol::Iso14230, &[0x01, 0x0C]).unwrap();
        assert_eq!(frame[0], 0xC2);
        assert_eq!(&frame[1..3], &[0x33, 0xF1]);
        let one = wrap_request(KnownProtocol::Iso14230, &[0x03]).unwrap();
        assert_eq!(one[0], 0xC1);
    }

    #[test]
    fn test_round_trip_all_serial_protocols() {
        let payload = [0x41, 0x0C, 0x1A, 0xF8];
        for protocol in [
            KnownProtocol::KLine,
            KnownProtocol::Iso9141,
            KnownProtocol::Iso14230,
            KnownProtocol::J1850Pwm,
            KnownProtocol::J1850Vpw,
        ] {
            let frame = wrap_response(protocol, DEFAULT_ECU_ADDRESS, &payload).unwrap();
            let unwrapped = unwrap_response(protocol, &frame).unwrap();
            assert_eq!(unwrapped.payload, payload, "{protocol}");
            assert!(unwrapped.checksum_ok, "{protocol}");
        }
    }

    #[test]
    fn test_corrupted_checksum_flagged_not_fatal() {
        let mut frame =
            wrap_response(KnownProtocol::Iso9141, DEFAULT_ECU_ADDRESS, &[0x41, 0x05, 0x7B])
                .unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let unwrapped = unwrap_response(KnownProtocol::Iso9141, &frame).unwrap();
        assert_eq!(unwrapped.payload, vec![0x41, 0x05, 0x7B]);
        assert!(!unwrapped.checksum_ok);
    }

    #[test]
    fn test_empty_frame_is_bus_timeout() {
        assert_eq!(
            unwrap_response(KnownProtocol::Can, &[]),
            Err(ParseError::Timeout)
        );
    }

    #[test]
    fn test_multi_frame_rejected() {
        let err = unwrap_response(KnownProtocol::Can, &[0x10, 0x14, 0x41, 0, 0, 0, 0, 0]);
        assert!(matches!(err, Err(ParseError::Unsupported(_))));
    }

    #[test]
    fn test_wrong_header_rejected() {
        let frame = wrap_response(KnownProtocol::J1850Pwm, DEFAULT_ECU_ADDRESS, &[0x41, 0x0D, 0x50])
            .unwrap();
        let err = unwrap_response(KnownProtocol::Iso9141, &frame);
        assert!(matches!(err, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_request_round_trip_all_protocols() {
        let payload = [0x01, 0x0C];
        for protocol in [
            KnownProtocol::Can,
            KnownProtocol::KLine,
            KnownProtocol::Iso9141,
            KnownProtocol::Iso14230,
            KnownProtocol::J1850Pwm,
            KnownProtocol::J1850Vpw,
        ] {
            let frame = wrap_request(protocol, &payload).unwrap();
            let unwrapped = unwrap_request(protocol, &frame).unwrap();
            assert_eq!(unwrapped.payload, payload, "{protocol}");
            assert!(unwrapped.checksum_ok, "{protocol}");
        }
    }
}
