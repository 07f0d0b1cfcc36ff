//! Fault code models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fault detected during a diagnostic session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultCode {
    /// Trouble code, e.g. "P0300"
    pub code: String,
    /// Human-readable description
    pub description: String,
    /// Severity level
    pub severity: FaultSeverity,
    /// First detection within the session
    pub detected_at: DateTime<Utc>,
    /// Most recent detection within the session
    pub last_detected_at: DateTime<Utc>,
    /// How often the fault was detected within the session
    pub occurrence_count: u32,
    /// Whether the fault is currently active
    pub active: bool,
    /// Pass-through / manufacturer-specific origin
    #[serde(default)]
    pub manufacturer_specific: bool,
}

impl FaultCode {
    /// A newly detected fault with one occurrence
    pub fn new(code: impl Into<String>, description: impl Into<String>, severity: FaultSeverity) -> Self {
        let now = Utc::now();
        Self {
            code: code.into(),
            description: description.into(),
            severity,
            detected_at: now,
            last_detected_at: now,
            occurrence_count: 1,
            active: true,
            manufacturer_specific: false,
        }
    }

    /// Fold a repeated detection into this entry
    pub fn record_repeat(&mut self) {
        self.occurrence_count = self.occurrence_count.saturating_add(1);
        self.last_detected_at = Utc::now();
        self.active = true;
    }
}

/// Fault severity levels, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FaultSeverity {
    /// Informational only
    #[default]
    Info,
    /// Worth attention, not urgent
    Warning,
    /// Malfunction requiring repair
    Error,
    /// Continued operation unsafe
    Critical,
}

impl FaultSeverity {
    /// Severities at or above Error escalate to the assigned technician
    pub fn requires_escalation(&self) -> bool {
        *self >= FaultSeverity::Error
    }
}
