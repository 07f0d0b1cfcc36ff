//! obdsd-session - Streaming pipeline, fault detection and the session engine
//!
//! The [`SessionEngine`] ties the layers together: it leases devices from the
//! connection hub, runs one sampling pipeline per diagnostic session, fans
//! samples out to analysis, live-view and persistence consumers over
//! drop-oldest queues, and drives the session state machine. Fault detection
//! combines per-make threshold tables from the [`registry`] with the AI
//! collaborator behind a hard deadline.

pub mod config;
pub mod detector;
pub mod engine;
pub mod fanout;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod testing;

pub use config::{EngineConfig, ModelProfile, ModelProfileSet};
pub use detector::{severity_for_confidence, Detection, FaultDetector};
pub use engine::{Collaborators, SessionEngine, DEFAULT_SENSORS};
pub use fanout::{DropQueue, Fanout, QueueDrops};
pub use registry::{
    builtin_default_model, AnomalyMapping, AnomalyModel, ModelRegistry, ThresholdRule, DEFAULT_MAKE,
};
pub use session::{DiagnosticSession, FaultRecorded, SessionView};
