//! Protocol layer errors

use obdsd_core::SensorType;
use thiserror::Error;

/// Errors from frame building and response decoding
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    /// Frame structure is broken (truncated, bad header, bad echo)
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame checksum does not match its content
    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    /// Vehicle rejected the PID for this sensor
    #[error("PID not supported by vehicle: {sensor:?}")]
    UnsupportedPid { sensor: SensorType },

    /// Vehicle sent a negative response other than PID rejection
    #[error("Negative response for service {service:#04x}: NRC {nrc:#04x}")]
    NegativeResponse { service: u8, nrc: u8 },

    /// Device signalled that the vehicle never answered
    #[error("No response from vehicle bus")]
    Timeout,

    /// Pass-through payload addressed to an unregistered decoder
    #[error("No pass-through decoder registered: {0}")]
    UnknownDecoder(String),

    /// Operation does not exist for this protocol or decoder
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
