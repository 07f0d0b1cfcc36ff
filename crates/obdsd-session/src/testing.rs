//! Test doubles for the engine's collaborators.
//!
//! Used by this crate's tests and by the integration suite; the demo
//! mode of the daemon wires them in as stand-in backends. Not compiled
//! out of release builds on purpose.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obdsd_core::{
    AnalysisError, AnalysisService, Diagnosis, FaultClassification, FaultCode, FaultSeverity,
    Notifier, NotifyError, RepairRecommendation, SampleVerdict, SensorReading, SensorSummary,
    SensorType, SessionRecord, SessionStore, StoreError, VehicleProfile,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::Collaborators;

/// Analysis double driven by per-sensor verdict scripts.
///
/// `analyze_sample` pops the next scripted verdict for the sample's
/// sensor; sensors without a script (or with an exhausted one) come
/// back normal. An optional delay simulates a slow backend.
#[derive(Default)]
pub struct ScriptedAnalysis {
    verdicts: Mutex<HashMap<SensorType, VecDeque<SampleVerdict>>>,
    classifications: Mutex<HashMap<String, FaultClassification>>,
    recommendations: Mutex<Vec<RepairRecommendation>>,
    delay: Mutex<Option<Duration>>,
    fail: AtomicBool,
    analyze_calls: AtomicU64,
}

impl ScriptedAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one verdict for a sensor. Earlier entries are consumed first.
    pub fn script_verdict(&self, sensor: SensorType, verdict: SampleVerdict) {
        self.verdicts.lock().entry(sensor).or_default().push_back(verdict);
    }

    /// Queue `normal_before` clean verdicts, then `repeats` copies of an
    /// anomaly pointing at `code`.
    pub fn script_anomaly_at(
        &self,
        sensor: SensorType,
        normal_before: usize,
        repeats: usize,
        confidence: f64,
        code: &str,
    ) {
        for _ in 0..normal_before {
            self.script_verdict(sensor, SampleVerdict::normal());
        }
        for _ in 0..repeats {
            self.script_verdict(
                sensor,
                SampleVerdict {
                    is_anomaly: true,
                    confidence,
                    suggested_code: Some(code.to_string()),
                },
            );
        }
    }

    pub fn set_classification(&self, code: &str, severity: FaultSeverity, description: &str) {
        self.classifications.lock().insert(
            code.to_string(),
            FaultClassification {
                severity,
                description: description.to_string(),
            },
        );
    }

    pub fn set_recommendations(&self, recommendations: Vec<RepairRecommendation>) {
        *self.recommendations.lock() = recommendations;
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// All calls answer `AnalysisError::Unavailable` while set.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn analyze_calls(&self) -> u64 {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    async fn simulate_backend(&self) -> Result<(), AnalysisError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AnalysisError::Unavailable("scripted outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn analyze_sample(
        &self,
        _vehicle: &VehicleProfile,
        reading: &SensorReading,
    ) -> Result<SampleVerdict, AnalysisError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_backend().await?;
        let verdict = self
            .verdicts
            .lock()
            .get_mut(&reading.sensor)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(SampleVerdict::normal);
        Ok(verdict)
    }

    async fn classify_fault_code(
        &self,
        code: &str,
        _vehicle: &VehicleProfile,
    ) -> Result<FaultClassification, AnalysisError> {
        self.simulate_backend().await?;
        self.classifications
            .lock()
            .get(code)
            .cloned()
            .ok_or_else(|| AnalysisError::Rejected(format!("no classification for {code}")))
    }

    async fn recommend_repairs(
        &self,
        _faults: &[FaultCode],
        _vehicle: &VehicleProfile,
    ) -> Result<Vec<RepairRecommendation>, AnalysisError> {
        self.simulate_backend().await?;
        Ok(self.recommendations.lock().clone())
    }
}

/// One recorded critical-fault escalation.
#[derive(Debug, Clone)]
pub struct CriticalAlert {
    pub technician_id: String,
    pub vehicle_vin: String,
    pub fault: FaultCode,
}

/// One recorded predictive maintenance alert.
#[derive(Debug, Clone)]
pub struct PredictiveAlert {
    pub tenant_id: String,
    pub vehicle_vin: String,
    pub recommendation: RepairRecommendation,
}

/// Notifier double that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    critical: Mutex<Vec<CriticalAlert>>,
    predictive: Mutex<Vec<PredictiveAlert>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn critical_alerts(&self) -> Vec<CriticalAlert> {
        self.critical.lock().clone()
    }

    pub fn critical_count(&self) -> usize {
        self.critical.lock().len()
    }

    pub fn predictive_alerts(&self) -> Vec<PredictiveAlert> {
        self.predictive.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_critical_fault_alert(
        &self,
        technician_id: &str,
        vehicle_vin: &str,
        fault: &FaultCode,
    ) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError("scripted delivery failure".into()));
        }
        self.critical.lock().push(CriticalAlert {
            technician_id: technician_id.to_string(),
            vehicle_vin: vehicle_vin.to_string(),
            fault: fault.clone(),
        });
        Ok(())
    }

    async fn send_predictive_maintenance_alert(
        &self,
        tenant_id: &str,
        vehicle_vin: &str,
        recommendation: &RepairRecommendation,
    ) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError("scripted delivery failure".into()));
        }
        self.predictive.lock().push(PredictiveAlert {
            tenant_id: tenant_id.to_string(),
            vehicle_vin: vehicle_vin.to_string(),
            recommendation: recommendation.clone(),
        });
        Ok(())
    }
}

/// In-memory append-only store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<Vec<SessionRecord>>,
    faults: Mutex<Vec<(Uuid, FaultCode)>>,
    summaries: Mutex<Vec<(Uuid, SensorSummary)>>,
    diagnoses: Mutex<Vec<(Uuid, Diagnosis)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_records(&self) -> Vec<SessionRecord> {
        self.sessions.lock().clone()
    }

    pub fn faults_for(&self, session_id: Uuid) -> Vec<FaultCode> {
        self.faults
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, fault)| fault.clone())
            .collect()
    }

    pub fn summaries_for(&self, session_id: Uuid) -> Vec<SensorSummary> {
        self.summaries
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, summary)| summary.clone())
            .collect()
    }

    pub fn diagnoses_for(&self, session_id: Uuid) -> Vec<Diagnosis> {
        self.diagnoses
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, diagnosis)| diagnosis.clone())
            .collect()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn append_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions.lock().push(record.clone());
        Ok(())
    }

    async fn append_fault(&self, session_id: Uuid, fault: &FaultCode) -> Result<(), StoreError> {
        self.faults.lock().push((session_id, fault.clone()));
        Ok(())
    }

    async fn append_sensor_summary(
        &self,
        session_id: Uuid,
        summary: &SensorSummary,
    ) -> Result<(), StoreError> {
        self.summaries.lock().push((session_id, summary.clone()));
        Ok(())
    }

    async fn append_diagnosis(
        &self,
        session_id: Uuid,
        diagnosis: &Diagnosis,
    ) -> Result<(), StoreError> {
        self.diagnoses.lock().push((session_id, diagnosis.clone()));
        Ok(())
    }
}

/// Fresh collaborator doubles plus handles to inspect them.
pub fn collaborator_doubles() -> (
    Collaborators,
    Arc<ScriptedAnalysis>,
    Arc<RecordingNotifier>,
    Arc<MemoryStore>,
) {
    let analysis = Arc::new(ScriptedAnalysis::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let store = Arc::new(MemoryStore::new());
    let collaborators = Collaborators {
        analysis: Arc::clone(&analysis) as Arc<dyn AnalysisService>,
        notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
        store: Arc::clone(&store) as Arc<dyn SessionStore>,
    };
    (collaborators, analysis, notifier, store)
}
