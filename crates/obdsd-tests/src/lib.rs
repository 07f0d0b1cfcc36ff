//! Integration tests for the OBD diagnostic session engine
//!
//! This crate contains end-to-end tests that exercise the full stack:
//! - Session engine and lifecycle
//! - Connection hub, transport failover and streaming
//! - Fault detection with the analysis collaborator
//! - Live-view event bus
//!
//! # Running Tests
//!
//! Everything runs in-process against a simulated vehicle behind the mock
//! transport; no hardware or network setup is needed:
//!
//! ```bash
//! cargo test -p obdsd-tests
//! ```
//!
//! Tests that depend on sampling cadence, keepalive or recovery backoff run
//! under tokio's paused clock, so they are fast and deterministic regardless
//! of the configured intervals.
//!
//! # Test Structure
//!
//! - `session_flow_test.rs` - Full session lifecycle with fault detection
//! - `failover_test.rs` - Transport failover and connection loss
//! - `live_view_test.rs` - Live-view event bus behavior

// This crate only contains tests, no library code
