//! Device link protocol.
//!
//! Frames exchanged between the engine and a dongle, independent of the
//! vehicle bus protocol the dongle forwards to. A connection starts with a
//! seed-key handshake and then carries bus commands and keep-alive pings:
//!
//! ```text
//! -> HELLO <serial>          <- CHALLENGE <4-byte seed>
//! -> AUTH <4-byte key>       <- ACK | NAK 0x33
//! -> BUS_CMD <tag> <frame>   <- BUS_RSP <tag> <frame>   (empty frame: silent bus)
//! -> PING                    <- PONG
//! ```
//!
//! The key is the CRC-32 of seed followed by the shared secret.

use obdsd_core::{KnownProtocol, Protocol};

use crate::error::ConnectionError;

/// First byte of every link frame
pub mod frame_type {
    pub const HELLO: u8 = 0x01;
    pub const CHALLENGE: u8 = 0x02;
    pub const AUTH: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const BUS_CMD: u8 = 0x10;
    pub const BUS_RSP: u8 = 0x11;
    pub const PING: u8 = 0x3E;
    pub const PONG: u8 = 0x7E;
    pub const NAK: u8 = 0x7F;
}

/// Rejection codes carried by NAK frames
pub mod nak_code {
    /// Seed-key exchange failed
    pub const AUTH_REJECTED: u8 = 0x33;
    /// Device cannot speak the requested bus protocol
    pub const UNKNOWN_PROTOCOL: u8 = 0x31;
    /// Device is servicing another request
    pub const BUSY: u8 = 0x21;
}

/// Tag for bus frames forwarded opaquely instead of decoded on-device
pub const PASS_THROUGH_TAG: u8 = 0x70;

/// Tag byte identifying the bus protocol of a BUS_CMD/BUS_RSP frame
pub fn protocol_tag(protocol: &Protocol) -> u8 {
    match protocol {
        Protocol::Known(KnownProtocol::Can) => 0x01,
        Protocol::Known(KnownProtocol::KLine) => 0x02,
        Protocol::Known(KnownProtocol::J1850Pwm) => 0x03,
        Protocol::Known(KnownProtocol::J1850Vpw) => 0x04,
        Protocol::Known(KnownProtocol::Iso9141) => 0x05,
        Protocol::Known(KnownProtocol::Iso14230) => 0x06,
        Protocol::PassThrough { .. } => PASS_THROUGH_TAG,
    }
}

/// Known protocol for a tag byte; None for the pass-through tag
pub fn known_protocol_for_tag(tag: u8) -> Option<KnownProtocol> {
    match tag {
        0x01 => Some(KnownProtocol::Can),
        0x02 => Some(KnownProtocol::KLine),
        0x03 => Some(KnownProtocol::J1850Pwm),
        0x04 => Some(KnownProtocol::J1850Vpw),
        0x05 => Some(KnownProtocol::Iso9141),
        0x06 => Some(KnownProtocol::Iso14230),
        _ => None,
    }
}

/// Seed-key transform: CRC-32 over seed followed by the shared secret
pub fn auth_key(seed: &[u8; 4], secret: &[u8]) -> [u8; 4] {
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = crc.digest();
    digest.update(seed);
    digest.update(secret);
    digest.finalize().to_be_bytes()
}

pub fn hello_frame(serial: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + serial.len());
    frame.push(frame_type::HELLO);
    frame.extend_from_slice(serial.as_bytes());
    frame
}

pub fn auth_frame(key: &[u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5);
    frame.push(frame_type::AUTH);
    frame.extend_from_slice(key);
    frame
}

pub fn ping_frame() -> Vec<u8> {
    vec![frame_type::PING]
}

pub fn is_pong(frame: &[u8]) -> bool {
    frame.first() == Some(&frame_type::PONG)
}

pub fn bus_command_frame(protocol: &Protocol, bus_frame: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + bus_frame.len());
    frame.push(frame_type::BUS_CMD);
    frame.push(protocol_tag(protocol));
    frame.extend_from_slice(bus_frame);
    frame
}

/// Extract the seed from a CHALLENGE frame
pub fn parse_challenge(frame: &[u8]) -> Result<[u8; 4], ConnectionError> {
    if frame.first() != Some(&frame_type::CHALLENGE) || frame.len() < 5 {
        return Err(ConnectionError::HandshakeFailed(format!(
            "expected challenge, got {}",
            hex::encode(frame)
        )));
    }
    let mut seed = [0u8; 4];
    seed.copy_from_slice(&frame[1..5]);
    Ok(seed)
}

/// Check the device's answer to an AUTH frame
pub fn parse_ack(frame: &[u8]) -> Result<(), ConnectionError> {
    match frame.first() {
        Some(&frame_type::ACK) => Ok(()),
        Some(&frame_type::NAK) if frame.get(1) == Some(&nak_code::AUTH_REJECTED) => {
            Err(ConnectionError::AuthenticationRejected)
        }
        _ => Err(ConnectionError::HandshakeFailed(format!(
            "expected ack, got {}",
            hex::encode(frame)
        ))),
    }
}

/// Extract the bus frame from a BUS_RSP. Empty means the vehicle stayed silent.
pub fn parse_bus_response(frame: &[u8]) -> Result<&[u8], ConnectionError> {
    match frame.first() {
        Some(&frame_type::BUS_RSP) => {
            if frame.len() < 2 {
                return Err(ConnectionError::Link("bus response missing tag".to_string()));
            }
            Ok(&frame[2..])
        }
        Some(&frame_type::NAK) => {
            let code = frame.get(1).copied().unwrap_or(0);
            Err(ConnectionError::Link(format!(
                "device rejected command, code {code:#04x}"
            )))
        }
        _ => Err(ConnectionError::Link(format!(
            "unexpected link frame {}",
            hex::encode(frame)
        ))),
    }
}
