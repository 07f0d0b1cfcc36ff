//! Per-sample fault detection.
//!
//! Two detection paths feed one [`Detection`] stream: hard threshold
//! rules from the manufacturer's anomaly table, evaluated locally, and
//! the analysis collaborator's verdict, consulted under a strict time
//! budget. An unreachable or slow collaborator leaves the verdict
//! unknown for that sample; detection quality degrades, the session
//! never fails because of it.

use std::sync::Arc;
use std::time::Duration;

use obdsd_core::{
    AnalysisService, FaultCode, FaultSeverity, SensorReading, VehicleProfile,
};
use obdsd_protocol::is_manufacturer_specific;
use tracing::debug;

use crate::registry::ModelRegistry;

/// One detected fault, before the session folds it into its fault list.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub code: String,
    pub description: String,
    pub severity: FaultSeverity,
    pub manufacturer_specific: bool,
}

impl Detection {
    pub fn into_fault(self) -> FaultCode {
        let mut fault = FaultCode::new(self.code, self.description, self.severity);
        fault.manufacturer_specific = self.manufacturer_specific;
        fault
    }
}

/// Severity assigned to an AI-flagged anomaly from its confidence score.
pub fn severity_for_confidence(confidence: f64) -> FaultSeverity {
    if confidence >= 0.9 {
        FaultSeverity::Critical
    } else if confidence >= 0.7 {
        FaultSeverity::Error
    } else if confidence >= 0.5 {
        FaultSeverity::Warning
    } else {
        FaultSeverity::Info
    }
}

pub struct FaultDetector {
    analysis: Arc<dyn AnalysisService>,
    registry: Arc<ModelRegistry>,
    ai_timeout: Duration,
}

impl FaultDetector {
    pub fn new(
        analysis: Arc<dyn AnalysisService>,
        registry: Arc<ModelRegistry>,
        ai_timeout: Duration,
    ) -> Self {
        Self {
            analysis,
            registry,
            ai_timeout,
        }
    }

    /// Evaluate one reading. Threshold rules fire first; the AI verdict
    /// adds at most one detection per sample. Detections are deduplicated
    /// by code within the sample.
    pub async fn evaluate(
        &self,
        vehicle: &VehicleProfile,
        reading: &SensorReading,
    ) -> Vec<Detection> {
        let model = self.registry.resolve(&vehicle.make);
        let mut detections = Vec::new();

        if let Some(model) = &model {
            for rule in model.violated(reading) {
                detections.push(Detection {
                    code: rule.code.clone(),
                    description: rule.description.clone(),
                    severity: rule.severity,
                    manufacturer_specific: is_manufacturer_specific(&rule.code),
                });
            }
        }

        let verdict = tokio::time::timeout(
            self.ai_timeout,
            self.analysis.analyze_sample(vehicle, reading),
        )
        .await;
        match verdict {
            Ok(Ok(verdict)) if verdict.is_anomaly => {
                let named = match verdict.suggested_code {
                    Some(code) => {
                        let description = model
                            .as_deref()
                            .and_then(|m| m.code_description(&code))
                            .map(str::to_string)
                            .unwrap_or_else(|| anomaly_description(reading));
                        Some((code, description))
                    }
                    None => model
                        .as_deref()
                        .and_then(|m| m.mapping_for(reading.sensor))
                        .map(|mapping| (mapping.code.clone(), mapping.description.clone())),
                };
                match named {
                    Some((code, description)) => {
                        if !detections.iter().any(|d| d.code == code) {
                            detections.push(Detection {
                                manufacturer_specific: is_manufacturer_specific(&code),
                                severity: severity_for_confidence(verdict.confidence),
                                code,
                                description,
                            });
                        }
                    }
                    None => {
                        debug!(
                            sensor = ?reading.sensor,
                            confidence = verdict.confidence,
                            "Anomaly verdict without a code mapping, ignored"
                        );
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(sensor = ?reading.sensor, error = %e, "Analysis unavailable, verdict unknown");
            }
            Err(_) => {
                debug!(sensor = ?reading.sensor, "Analysis timed out, verdict unknown");
            }
        }

        detections
    }

    /// Classify a trouble code the device reported. Falls back to the
    /// anomaly table, then to a generic Error entry, when the analysis
    /// collaborator cannot answer in time.
    pub async fn classify(&self, vehicle: &VehicleProfile, code: &str) -> Detection {
        let classified = tokio::time::timeout(
            self.ai_timeout,
            self.analysis.classify_fault_code(code, vehicle),
        )
        .await;
        match classified {
            Ok(Ok(classification)) => Detection {
                code: code.to_string(),
                description: classification.description,
                severity: classification.severity,
                manufacturer_specific: is_manufacturer_specific(code),
            },
            Ok(Err(e)) => {
                debug!(code, error = %e, "Classification unavailable, using table fallback");
                self.fallback_classification(vehicle, code)
            }
            Err(_) => {
                debug!(code, "Classification timed out, using table fallback");
                self.fallback_classification(vehicle, code)
            }
        }
    }

    fn fallback_classification(&self, vehicle: &VehicleProfile, code: &str) -> Detection {
        let description = self
            .registry
            .resolve(&vehicle.make)
            .as_deref()
            .and_then(|m| m.code_description(code))
            .map(str::to_string)
            .unwrap_or_else(|| "Stored trouble code reported by vehicle".to_string());
        Detection {
            code: code.to_string(),
            description,
            severity: FaultSeverity::Error,
            manufacturer_specific: is_manufacturer_specific(code),
        }
    }
}

fn anomaly_description(reading: &SensorReading) -> String {
    format!("Anomalous {:?} pattern", reading.sensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAnalysis;
    use obdsd_core::{SampleVerdict, SensorType};

    fn vehicle() -> VehicleProfile {
        VehicleProfile::new("WVWZZZ1JZXW000001", "Volkswagen", "Golf", 2019)
    }

    fn detector(analysis: Arc<ScriptedAnalysis>) -> FaultDetector {
        FaultDetector::new(
            analysis,
            Arc::new(ModelRegistry::with_builtin()),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_severity_from_confidence_bands() {
        assert_eq!(severity_for_confidence(0.95), FaultSeverity::Critical);
        assert_eq!(severity_for_confidence(0.9), FaultSeverity::Critical);
        assert_eq!(severity_for_confidence(0.82), FaultSeverity::Error);
        assert_eq!(severity_for_confidence(0.7), FaultSeverity::Error);
        assert_eq!(severity_for_confidence(0.55), FaultSeverity::Warning);
        assert_eq!(severity_for_confidence(0.2), FaultSeverity::Info);
    }

    #[tokio::test]
    async fn test_threshold_rule_fires_without_ai() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        let detector = detector(Arc::clone(&analysis));
        let reading = SensorReading::new(SensorType::CoolantTemp, 124.0);

        let detections = detector.evaluate(&vehicle(), &reading).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].code, "P0217");
        assert_eq!(detections[0].severity, FaultSeverity::Critical);
        assert!(!detections[0].manufacturer_specific);
    }

    #[tokio::test]
    async fn test_ai_anomaly_uses_suggested_code_and_confidence() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script_verdict(
            SensorType::EngineRpm,
            SampleVerdict {
                is_anomaly: true,
                confidence: 0.93,
                suggested_code: Some("P0301".into()),
            },
        );
        let detector = detector(Arc::clone(&analysis));
        let reading = SensorReading::new(SensorType::EngineRpm, 2_400.0);

        let detections = detector.evaluate(&vehicle(), &reading).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].code, "P0301");
        assert_eq!(detections[0].severity, FaultSeverity::Critical);
    }

    #[tokio::test]
    async fn test_ai_anomaly_without_code_maps_through_table() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script_verdict(
            SensorType::EngineRpm,
            SampleVerdict {
                is_anomaly: true,
                confidence: 0.75,
                suggested_code: None,
            },
        );
        let detector = detector(Arc::clone(&analysis));
        let reading = SensorReading::new(SensorType::EngineRpm, 2_400.0);

        let detections = detector.evaluate(&vehicle(), &reading).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].code, "P0300");
        assert_eq!(
            detections[0].description,
            "Random or multiple cylinder misfire detected"
        );
        assert_eq!(detections[0].severity, FaultSeverity::Error);
    }

    #[tokio::test]
    async fn test_duplicate_code_within_sample_collapses() {
        // Threshold rule and AI verdict both land on the overspeed code.
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.script_verdict(
            SensorType::EngineRpm,
            SampleVerdict {
                is_anomaly: true,
                confidence: 0.8,
                suggested_code: Some("P0219".into()),
            },
        );
        let detector = detector(Arc::clone(&analysis));
        let reading = SensorReading::new(SensorType::EngineRpm, 7_200.0);

        let detections = detector.evaluate(&vehicle(), &reading).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].code, "P0219");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_analysis_leaves_verdict_unknown() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.set_delay(Duration::from_secs(5));
        analysis.script_verdict(
            SensorType::EngineRpm,
            SampleVerdict {
                is_anomaly: true,
                confidence: 0.99,
                suggested_code: Some("P0300".into()),
            },
        );
        let detector = detector(Arc::clone(&analysis));
        let reading = SensorReading::new(SensorType::EngineRpm, 2_400.0);

        // The verdict would have flagged an anomaly, but it missed the budget.
        let detections = detector.evaluate(&vehicle(), &reading).await;
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_analysis_error_never_fails_evaluation() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.set_fail(true);
        let detector = detector(Arc::clone(&analysis));

        let quiet = SensorReading::new(SensorType::EngineRpm, 2_400.0);
        assert!(detector.evaluate(&vehicle(), &quiet).await.is_empty());

        // Threshold detection still works while the collaborator is down.
        let hot = SensorReading::new(SensorType::CoolantTemp, 124.0);
        let detections = detector.evaluate(&vehicle(), &hot).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].code, "P0217");
    }

    #[tokio::test]
    async fn test_classify_uses_collaborator_answer() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        analysis.set_classification("P0420", FaultSeverity::Warning, "Catalyst efficiency low");
        let detector = detector(Arc::clone(&analysis));

        let detection = detector.classify(&vehicle(), "P0420").await;
        assert_eq!(detection.severity, FaultSeverity::Warning);
        assert_eq!(detection.description, "Catalyst efficiency low");
    }

    #[tokio::test]
    async fn test_classify_falls_back_to_table_then_generic() {
        let analysis = Arc::new(ScriptedAnalysis::new());
        let detector = detector(Arc::clone(&analysis));

        // Known to the builtin table.
        let known = detector.classify(&vehicle(), "P0219").await;
        assert_eq!(known.description, "Engine overspeed condition");
        assert_eq!(known.severity, FaultSeverity::Error);

        // Unknown everywhere: generic entry, manufacturer range flagged.
        let unknown = detector.classify(&vehicle(), "P1234").await;
        assert_eq!(unknown.severity, FaultSeverity::Error);
        assert!(unknown.manufacturer_specific);
    }
}
