//! Traits for external collaborators of the session engine.
//!
//! The engine never talks to the AI platform, the notification fabric or the
//! persistence layer directly. It goes through these traits, so deployments
//! wire in real clients and tests wire in doubles.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Diagnosis, FaultCode, FaultSeverity, RepairRecommendation, SensorReading, SensorSummary,
    SessionRecord, VehicleProfile,
};

/// Verdict of the analysis service for a single sample
#[derive(Debug, Clone, PartialEq)]
pub struct SampleVerdict {
    /// Whether the sample deviates from the expected envelope
    pub is_anomaly: bool,
    /// Anomaly confidence in [0, 1]
    pub confidence: f64,
    /// Trouble code the model attributes the anomaly to, if it has one
    pub suggested_code: Option<String>,
}

impl SampleVerdict {
    /// A clean, non-anomalous verdict
    pub fn normal() -> Self {
        Self {
            is_anomaly: false,
            confidence: 0.0,
            suggested_code: None,
        }
    }
}

/// Classification of a trouble code for a concrete vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct FaultClassification {
    pub severity: FaultSeverity,
    pub description: String,
}

/// Failures of the analysis collaborator.
///
/// These never fail a session; callers degrade to an unknown verdict.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("analysis backend unavailable: {0}")]
    Unavailable(String),
    #[error("analysis request rejected: {0}")]
    Rejected(String),
}

/// AI analysis platform. Every call is bounded by the configured
/// analysis timeout at the call site.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Judge a single sensor sample against the vehicle's expected envelope
    async fn analyze_sample(
        &self,
        vehicle: &VehicleProfile,
        reading: &SensorReading,
    ) -> Result<SampleVerdict, AnalysisError>;

    /// Classify a trouble code for this vehicle
    async fn classify_fault_code(
        &self,
        code: &str,
        vehicle: &VehicleProfile,
    ) -> Result<FaultClassification, AnalysisError>;

    /// Suggest repairs for the accumulated fault codes
    async fn recommend_repairs(
        &self,
        faults: &[FaultCode],
        vehicle: &VehicleProfile,
    ) -> Result<Vec<RepairRecommendation>, AnalysisError>;
}

/// Notification delivery failure. Logged, never propagated into session state.
#[derive(Debug, Clone, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound notification fabric (push, SMS, whatever the deployment wires in)
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Escalate a severe fault to the technician running the session
    async fn send_critical_fault_alert(
        &self,
        technician_id: &str,
        vehicle_vin: &str,
        fault: &FaultCode,
    ) -> Result<(), NotifyError>;

    /// Predictive maintenance advice for the owning tenant
    async fn send_predictive_maintenance_alert(
        &self,
        tenant_id: &str,
        vehicle_vin: &str,
        recommendation: &RepairRecommendation,
    ) -> Result<(), NotifyError>;
}

/// Persistence failure
#[derive(Debug, Clone, Error)]
#[error("session store failure: {0}")]
pub struct StoreError(pub String);

/// Append-only persistence for session history.
///
/// Raw samples are never persisted; sensors are folded into summaries first.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn append_fault(&self, session_id: Uuid, fault: &FaultCode) -> Result<(), StoreError>;

    async fn append_sensor_summary(
        &self,
        session_id: Uuid,
        summary: &SensorSummary,
    ) -> Result<(), StoreError>;

    async fn append_diagnosis(
        &self,
        session_id: Uuid,
        diagnosis: &Diagnosis,
    ) -> Result<(), StoreError>;
}
