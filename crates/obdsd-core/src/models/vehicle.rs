//! Vehicle context passed to the analysis collaborator

use serde::{Deserialize, Serialize};

/// Vehicle a diagnostic session runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleProfile {
    /// Vehicle identification number
    pub vin: String,
    /// Manufacturer, lowercased (keys the anomaly model registry)
    pub make: String,
    pub model: String,
    pub model_year: u16,
    /// Engine description, e.g. "2.0 TSI"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl VehicleProfile {
    pub fn new(
        vin: impl Into<String>,
        make: impl Into<String>,
        model: impl Into<String>,
        model_year: u16,
    ) -> Self {
        Self {
            vin: vin.into(),
            make: make.into().to_lowercase(),
            model: model.into(),
            model_year,
            engine: None,
        }
    }
}
