//! obdsd-protocol - Protocol command layer
//!
//! Pure build/parse for the OBD protocol family. Given a sensor request or a
//! trouble-code request plus a protocol variant, this crate produces the wire
//! frame (header, payload, checksum) and decodes the device's response back
//! into typed values. No I/O happens here; transports live in `obdsd-device`.
//!
//! Manufacturer-specific traffic uses the pass-through path: frames are
//! forwarded opaquely and responses are decoded by a decoder registered in
//! the [`DecoderRegistry`].

pub mod command;
pub mod dtc;
pub mod error;
pub mod frame;
pub mod passthrough;
pub mod pid;
pub mod response;

pub use command::{build_clear_request, build_dtc_request, build_sensor_request, Command, CommandKind};
pub use dtc::{dtc_code_string, is_manufacturer_specific};
pub use error::ParseError;
pub use passthrough::{DecoderRegistry, PayloadDecoder};
pub use response::{parse_clear_response, parse_dtc_response, parse_sensor_response};
