//! Vehicle bus protocol identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol a command is addressed in.
///
/// Devices either speak one of the known OBD protocol variants directly or
/// tunnel manufacturer-specific traffic through a named pass-through decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Protocol {
    /// One of the standard protocol families
    Known(KnownProtocol),
    /// Manufacturer pass-through, decoded by a registered payload decoder
    PassThrough {
        /// Identifier of the decoder registered for this payload format
        decoder: String,
    },
}

impl Protocol {
    /// Whether this is a pass-through protocol
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Protocol::PassThrough { .. })
    }
}

impl From<KnownProtocol> for Protocol {
    fn from(known: KnownProtocol) -> Self {
        Protocol::Known(known)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Known(known) => known.fmt(f),
            Protocol::PassThrough { decoder } => write!(f, "pass_through({decoder})"),
        }
    }
}

/// The standard OBD protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownProtocol {
    /// CAN bus (ISO 15765-4)
    Can,
    /// Raw K-Line signalling (pre-standard, header-less)
    KLine,
    /// SAE J1850 pulse-width modulation
    J1850Pwm,
    /// SAE J1850 variable pulse width
    J1850Vpw,
    /// ISO 9141-2
    Iso9141,
    /// ISO 14230 (KWP2000)
    Iso14230,
}

impl fmt::Display for KnownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KnownProtocol::Can => "can",
            KnownProtocol::KLine => "k_line",
            KnownProtocol::J1850Pwm => "j1850_pwm",
            KnownProtocol::J1850Vpw => "j1850_vpw",
            KnownProtocol::Iso9141 => "iso9141",
            KnownProtocol::Iso14230 => "iso14230",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_serde_untagged() {
        let known: Protocol = serde_json::from_str("\"can\"").unwrap();
        assert_eq!(known, Protocol::Known(KnownProtocol::Can));

        let pass: Protocol = serde_json::from_str(r#"{"decoder":"vw_tp20"}"#).unwrap();
        assert_eq!(
            pass,
            Protocol::PassThrough {
                decoder: "vw_tp20".to_string()
            }
        );
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Known(KnownProtocol::Iso14230).to_string(), "iso14230");
        assert_eq!(
            Protocol::PassThrough {
                decoder: "tp20".to_string()
            }
            .to_string(),
            "pass_through(tp20)"
        );
    }
}
