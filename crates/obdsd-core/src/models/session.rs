//! Diagnostic session status and persistence records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::vehicle::VehicleProfile;

/// Lifecycle of a diagnostic session.
///
/// ```text
///              +-> Completed
///              |
/// Initiated -> InProgress -+-> Cancelled
///     |                    |
///     +-> Cancelled        +-> Error
/// ```
///
/// Completed, Cancelled and Error are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no device connection yet
    #[default]
    Initiated,
    /// Streaming and detecting on a live connection
    InProgress,
    /// Finished by the technician with an outcome
    Completed,
    /// Abandoned by the technician
    Cancelled,
    /// Aborted by the engine
    Error,
}

impl SessionStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Error
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(SessionStatus::Initiated),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Result of a completed session, set by the technician
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    NoIssues,
    IssuesFound,
    RepairRequired,
    FurtherDiagnosisNeeded,
}

/// Machine-readable reason attached to a session in the Error state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorReason {
    /// Device connection lost and not recovered within the loss window
    ConnectionLost,
    /// Sampling or fan-out machinery failed
    PipelineFailure,
}

impl SessionErrorReason {
    /// Stable code for logs and persisted records
    pub fn code(&self) -> &'static str {
        match self {
            SessionErrorReason::ConnectionLost => "connection_lost",
            SessionErrorReason::PipelineFailure => "pipeline_failure",
        }
    }
}

impl fmt::Display for SessionErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Snapshot of a session written to the store on terminal transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub vehicle: VehicleProfile,
    pub device_serial: String,
    pub technician_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
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
    /// Active streaming time in milliseconds, if the session ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub fault_count: u32,
    pub diagnosis_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Initiated.is_terminal());
        assert!(!SessionStatus::InProgress.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Initiated,
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_error_reason_codes() {
        assert_eq!(SessionErrorReason::ConnectionLost.code(), "connection_lost");
        assert_eq!(SessionErrorReason::PipelineFailure.code(), "pipeline_failure");
    }
}
