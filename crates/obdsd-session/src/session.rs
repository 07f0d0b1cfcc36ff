//! The diagnostic session aggregate.
//!
//! Owns the state machine, the session's fault list, its diagnoses and
//! the live-view windows. All mutation goes through methods that
//! enforce the legal transitions; terminal states reject everything.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use obdsd_core::{
    Diagnosis, EngineError, EngineResult, FaultCode, SensorReading, SensorType,
    SessionErrorReason, SessionOutcome, SessionRecord, SessionStatus, VehicleProfile,
};
use serde::Serialize;
use uuid::Uuid;

use crate::fanout::QueueDrops;

/// Result of folding one detection into the session's fault list.
#[derive(Debug, Clone)]
pub struct FaultRecorded {
    /// Entry state after the fold
    pub fault: FaultCode,
    /// First time this code was seen in the session
    pub newly_detected: bool,
    /// Escalate now: first detection at a severity that warrants it.
    /// Repeats never escalate again.
    pub escalate: bool,
}

pub struct DiagnosticSession {
    id: Uuid,
    vehicle: VehicleProfile,
    device_serial: String,
    technician_id: String,
    tenant_id: Option<String>,
    status: SessionStatus,
    outcome: Option<SessionOutcome>,
    error_reason: Option<SessionErrorReason>,
    initiated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    faults: Vec<FaultCode>,
    diagnoses: Vec<Diagnosis>,
    recent: HashMap<SensorType, VecDeque<SensorReading>>,
    last_good: HashMap<SensorType, SensorReading>,
    recent_window: usize,
    total_samples: u64,
}

impl DiagnosticSession {
    pub fn new(
        vehicle: VehicleProfile,
        device_serial: impl Into<String>,
        technician_id: impl Into<String>,
        tenant_id: Option<String>,
        recent_window: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vehicle,
            device_serial: device_serial.into(),
            technician_id: technician_id.into(),
            tenant_id,
            status: SessionStatus::Initiated,
            outcome: None,
            error_reason: None,
            initiated_at: Utc::now(),
            started_at: None,
            ended_at: None,
            faults: Vec::new(),
            diagnoses: Vec::new(),
            recent: HashMap::new(),
            last_good: HashMap::new(),
            recent_window: recent_window.max(1),
            total_samples: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn vehicle(&self) -> &VehicleProfile {
        &self.vehicle
    }

    pub fn device_serial(&self) -> &str {
        &self.device_serial
    }

    pub fn technician_id(&self) -> &str {
        &self.technician_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn error_reason(&self) -> Option<SessionErrorReason> {
        self.error_reason
    }

    pub fn faults(&self) -> &[FaultCode] {
        &self.faults
    }

    pub fn diagnoses(&self) -> &[Diagnosis] {
        &self.diagnoses
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Recent readings for one sensor, oldest first.
    pub fn recent(&self, sensor: SensorType) -> impl Iterator<Item = &SensorReading> {
        self.recent.get(&sensor).into_iter().flatten()
    }

    /// Last clean reading per sensor. Survives into terminal states.
    pub fn last_good(&self, sensor: SensorType) -> Option<&SensorReading> {
        self.last_good.get(&sensor)
    }

    // ---- state machine -------------------------------------------------

    /// Initiated -> InProgress, once a live connection is leased.
    pub fn begin(&mut self) -> EngineResult<()> {
        if self.status != SessionStatus::Initiated {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: SessionStatus::InProgress,
            });
        }
        self.status = SessionStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// InProgress -> Completed. The outcome is mandatory; a session can
    /// not complete straight out of Initiated.
    pub fn complete(&mut self, outcome: SessionOutcome) -> EngineResult<()> {
        if self.status != SessionStatus::InProgress {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: SessionStatus::Completed,
            });
        }
        self.status = SessionStatus::Completed;
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Initiated or InProgress -> Cancelled.
    pub fn cancel(&mut self) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: SessionStatus::Cancelled,
            });
        }
        self.status = SessionStatus::Cancelled;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// InProgress -> Error, with the machine-readable reason.
    pub fn fail(&mut self, reason: SessionErrorReason) -> EngineResult<()> {
        if self.status != SessionStatus::InProgress {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: SessionStatus::Error,
            });
        }
        self.status = SessionStatus::Error;
        self.error_reason = Some(reason);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    // ---- streaming data -------------------------------------------------

    /// Fold one sampled reading into the live-view windows.
    pub fn record_reading(&mut self, reading: SensorReading) {
        self.total_samples += 1;
        if reading.is_good() {
            self.last_good.insert(reading.sensor, reading.clone());
        }
        let window = self.recent.entry(reading.sensor).or_default();
        if window.len() == self.recent_window {
            window.pop_front();
        }
        window.push_back(reading);
    }

    /// Fold one detection into the fault list, idempotent per code: a
    /// repeat bumps the occurrence count instead of adding an entry.
    pub fn record_fault(&mut self, incoming: FaultCode) -> EngineResult<FaultRecorded> {
        if self.status != SessionStatus::InProgress {
            return Err(EngineError::Invalid(format!(
                "session {} is {}, not accepting faults",
                self.id, self.status
            )));
        }
        if let Some(existing) = self.faults.iter_mut().find(|f| f.code == incoming.code) {
            existing.record_repeat();
            // A repeat may raise the severity, never lower it.
            if incoming.severity > existing.severity {
                existing.severity = incoming.severity;
            }
            return Ok(FaultRecorded {
                fault: existing.clone(),
                newly_detected: false,
                escalate: false,
            });
        }
        let escalate = incoming.severity.requires_escalation();
        self.faults.push(incoming.clone());
        Ok(FaultRecorded {
            fault: incoming,
            newly_detected: true,
            escalate,
        })
    }

    // ---- diagnoses -------------------------------------------------------

    /// Attach a diagnosis. Rejected once the session is terminal.
    pub fn add_diagnosis(&mut self, diagnosis: Diagnosis) -> EngineResult<Uuid> {
        if self.status.is_terminal() {
            return Err(EngineError::Invalid(format!(
                "session {} is {}, not accepting diagnoses",
                self.id, self.status
            )));
        }
        let id = diagnosis.id;
        self.diagnoses.push(diagnosis);
        Ok(id)
    }

    /// Attach a review marker to a diagnosis. Allowed in any session
    /// state; an AI diagnosis is typically reviewed after completion.
    pub fn review_diagnosis(&mut self, diagnosis_id: Uuid, reviewer_id: &str) -> EngineResult<()> {
        let diagnosis = self
            .diagnoses
            .iter_mut()
            .find(|d| d.id == diagnosis_id)
            .ok_or_else(|| {
                EngineError::Invalid(format!("no diagnosis {diagnosis_id} on session {}", self.id))
            })?;
        if !diagnosis.attach_review(reviewer_id) {
            return Err(EngineError::Invalid(format!(
                "diagnosis {diagnosis_id} already reviewed"
            )));
        }
        Ok(())
    }

    pub fn diagnosis(&self, diagnosis_id: Uuid) -> Option<&Diagnosis> {
        self.diagnoses.iter().find(|d| d.id == diagnosis_id)
    }

    // ---- projections -----------------------------------------------------

    /// Active streaming time, set once the session ends.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let ended = self.ended_at?;
        Some((ended - started).num_milliseconds().max(0) as u64)
    }

    /// Persistence snapshot for terminal flushes.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id,
            vehicle: self.vehicle.clone(),
            device_serial: self.device_serial.clone(),
            technician_id: self.technician_id.clone(),
            tenant_id: self.tenant_id.clone(),
            status: self.status,
            outcome: self.outcome,
            error_reason: self.error_reason,
            initiated_at: self.initiated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms(),
            fault_count: self.faults.len() as u32,
            diagnosis_count: self.diagnoses.len() as u32,
        }
    }

    /// Live view of the session for technician UIs.
    pub fn view(&self, queue_drops: QueueDrops) -> SessionView {
        let mut last_good: Vec<SensorReading> = self.last_good.values().cloned().collect();
        // Stable order for the serialized view
        last_good.sort_by(|a, b| format!("{:?}", a.sensor).cmp(&format!("{:?}", b.sensor)));
        SessionView {
            session_id: self.id,
            vehicle: self.vehicle.clone(),
            device_serial: self.device_serial.clone(),
            technician_id: self.technician_id.clone(),
            status: self.status,
            outcome: self.outcome,
            error_reason: self.error_reason,
            initiated_at: self.initiated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms(),
            total_samples: self.total_samples,
            faults: self.faults.clone(),
            diagnoses: self.diagnoses.clone(),
            last_good,
            queue_drops,
        }
    }
}

/// Serializable snapshot of a session, fault list, diagnoses, the last
/// known good reading per sensor and the fan-out loss counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub vehicle: VehicleProfile,
    pub device_serial: String,
    pub technician_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<SessionErrorReason>,
    pub initiated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub total_samples: u64,
    pub faults: Vec<FaultCode>,
    pub diagnoses: Vec<Diagnosis>,
    /// Last clean reading per sensor, kept through Error
    pub last_good: Vec<SensorReading>,
    pub queue_drops: QueueDrops,
}
