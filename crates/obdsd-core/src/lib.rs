//! obdsd-core - Core domain models and collaborator traits for the OBD session engine
//!
//! This crate provides the shared vocabulary of the engine: devices, sensor
//! readings, fault codes, diagnoses and diagnostic sessions, plus the traits
//! through which external collaborators (AI analysis, notification delivery,
//! persistence) are plugged in.

pub mod collaborators;
pub mod error;
pub mod events;
pub mod models;

pub use collaborators::{
    AnalysisError, AnalysisService, FaultClassification, Notifier, NotifyError, SampleVerdict,
    SessionStore, StoreError,
};
pub use error::{EngineError, EngineResult};
pub use events::{session_topic, technician_topic, EventBus, SessionEvent};
pub use models::*;
