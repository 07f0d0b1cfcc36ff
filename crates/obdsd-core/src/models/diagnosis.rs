//! Diagnosis and repair recommendation models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A diagnosis attached to a session.
///
/// Content is immutable once added; a later technician review only attaches a
/// review marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: Uuid,
    /// What was concluded
    pub summary: String,
    /// Confidence in the conclusion
    pub confidence: Confidence,
    /// Suggested repair actions
    pub recommendations: Vec<RepairRecommendation>,
    /// Who produced the diagnosis
    pub author: DiagnosisAuthor,
    pub created_at: DateTime<Utc>,
    /// Review marker, set at most once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<DiagnosisReview>,
}

impl Diagnosis {
    /// A technician-authored diagnosis
    pub fn technician(
        technician_id: impl Into<String>,
        summary: impl Into<String>,
        confidence: Confidence,
        recommendations: Vec<RepairRecommendation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            summary: summary.into(),
            confidence,
            recommendations,
            author: DiagnosisAuthor::Technician {
                technician_id: technician_id.into(),
            },
            created_at: Utc::now(),
            review: None,
        }
    }

    /// An AI-generated diagnosis, tagged with the producing model version
    pub fn ai(
        model_version: impl Into<String>,
        summary: impl Into<String>,
        confidence: Confidence,
        recommendations: Vec<RepairRecommendation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            summary: summary.into(),
            confidence,
            recommendations,
            author: DiagnosisAuthor::Ai {
                model_version: model_version.into(),
            },
            created_at: Utc::now(),
            review: None,
        }
    }

    /// Attach a review marker. Returns false if already reviewed.
    pub fn attach_review(&mut self, reviewer_id: impl Into<String>) -> bool {
        if self.review.is_some() {
            return false;
        }
        self.review = Some(DiagnosisReview {
            reviewer_id: reviewer_id.into(),
            reviewed_at: Utc::now(),
        });
        true
    }
}

/// Origin of a diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiagnosisAuthor {
    Technician { technician_id: String },
    Ai { model_version: String },
}

/// Confidence attached to a diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
    /// Verified against the vehicle
    Confirmed,
}

/// Review marker attached to a diagnosis by a technician
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisReview {
    pub reviewer_id: String,
    pub reviewed_at: DateTime<Utc>,
}

/// A concrete repair action with effort estimates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecommendation {
    /// What to do, e.g. "Replace ignition coil, cylinder 3"
    pub action: String,
    pub priority: RepairPriority,
    /// Rough parts-and-labour cost estimate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    /// Rough labour time in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_min: Option<u32>,
    /// Parts involved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<String>,
}

/// Urgency of a repair recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairPriority {
    Low,
    Medium,
    High,
    Urgent,
}
