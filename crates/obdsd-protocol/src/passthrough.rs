//! Pass-through decoder registry.
//!
//! Vehicles behind a manufacturer-specific stack are driven in pass-through
//! mode: the device forwards payloads verbatim and the matching decoder,
//! registered here under the id named in `Protocol::PassThrough`, turns the
//! response payload back into values.

use std::collections::HashMap;
use std::sync::Arc;

use obdsd_core::SensorType;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::ParseError;

/// Decoder for one manufacturer payload format
pub trait PayloadDecoder: Send + Sync {
    /// Decode a sensor response payload into a physical value
    fn decode_sensor(&self, sensor: SensorType, payload: &[u8]) -> Result<f64, ParseError>;

    /// Decode a trouble-code response payload into code strings
    fn decode_trouble_codes(&self, _payload: &[u8]) -> Result<Vec<String>, ParseError> {
        Err(ParseError::Unsupported(
            "decoder has no trouble-code support".to_string(),
        ))
    }
}

/// Registry of pass-through decoders keyed by decoder id
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: RwLock<HashMap<String, Arc<dyn PayloadDecoder>>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a decoder
    pub fn register(&self, id: impl Into<String>, decoder: Arc<dyn PayloadDecoder>) {
        let id = id.into();
        debug!(decoder = %id, "Registered pass-through decoder");
        self.decoders.write().insert(id, decoder);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.decoders.write().remove(id).is_some()
    }

    /// Look up a decoder, erroring with the id when absent
    pub fn get(&self, id: &str) -> Result<Arc<dyn PayloadDecoder>, ParseError> {
        self.decoders
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ParseError::UnknownDecoder(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.decoders.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDecoder(f64);

    impl PayloadDecoder for FixedDecoder {
        fn decode_sensor(&self, _sensor: SensorType, _payload: &[u8]) -> Result<f64, ParseError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_lookup_after_register() {
        let registry = DecoderRegistry::new();
        registry.register("vw_tp20", Arc::new(FixedDecoder(42.0)));
        let decoder = registry.get("vw_tp20").unwrap();
        assert_eq!(
            decoder.decode_sensor(SensorType::EngineRpm, &[]).unwrap(),
            42.0
        );
    }

    #[test]
    fn test_missing_decoder_is_error() {
        let registry = DecoderRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(ParseError::UnknownDecoder(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_default_trouble_code_decode_unsupported() {
        let decoder = FixedDecoder(0.0);
        assert!(matches!(
            decoder.decode_trouble_codes(&[0x00]),
            Err(ParseError::Unsupported(_))
        ));
    }
}
