//! obdsd - OBD Diagnostic Session Daemon
//!
//! Runs the diagnostic session engine against a fleet of remote OBD dongles
//! (WiFi, Bluetooth, cellular) and logs the live view of each session.
//!
//! Usage:
//!   obdsd [OPTIONS] [config.toml]
//!
//! Options:
//!   --models <path>          Load model profiles from file or directory
//!   --anomaly-tables <path>  Load per-make anomaly tables from file or directory
//!
//! If no config file is provided, uses a simulated demo device.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use obdsd_core::{
    session_topic, Device, DeviceLifecycle, DeviceTier, FaultCode, KnownProtocol, Notifier,
    NotifyError, RepairRecommendation, SessionEvent, TransportKind, VehicleProfile,
};
use obdsd_device::{
    AuthConfig, ConnectionHub, DeviceConfig, EndpointConfig, MockTransportFactory, MockVehicle,
    SocketTransportFactory, TimingConfig,
};
use obdsd_session::testing::{MemoryStore, ScriptedAnalysis};
use obdsd_session::{Collaborators, EngineConfig, ModelProfileSet, SessionEngine};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DaemonConfig, DemoConfig};

const DEMO_SERIAL: &str = "OBD-DEMO-1";
const DEMO_SECRET: &str = "demo-secret";

/// Parsed command-line arguments
struct Args {
    /// Daemon config file (TOML)
    config_path: Option<String>,
    /// Model profile files/directories (YAML)
    model_profiles: Vec<String>,
    /// Anomaly table files/directories (YAML)
    anomaly_tables: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        model_profiles: Vec::new(),
        anomaly_tables: Vec::new(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--models" | "-m" => {
                if i + 1 < args.len() {
                    result.model_profiles.push(args[i + 1].clone());
                    i += 2;
                } else {
                    tracing::error!("Missing argument for --models");
                    i += 1;
                }
            }
            "--anomaly-tables" | "-a" => {
                if i + 1 < args.len() {
                    result.anomaly_tables.push(args[i + 1].clone());
                    i += 2;
                } else {
                    tracing::error!("Missing argument for --anomaly-tables");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            _ => {
                tracing::warn!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"obdsd - OBD Diagnostic Session Daemon

Usage: obdsd [OPTIONS] [config.toml]

Options:
  -m, --models <path>          Load model profiles from a YAML file or directory
                               Can be specified multiple times
  -a, --anomaly-tables <path>  Load per-make anomaly tables from a YAML file
                               or directory, can be specified multiple times
  -h, --help                   Print this help message

Examples:
  # Run with a simulated demo device
  obdsd

  # Run against a fleet config
  obdsd fleet.toml

  # Run with model profiles and anomaly tables
  obdsd --models config/model-profiles/ fleet.toml
  obdsd -m profiles.yaml -a config/anomaly-tables/ fleet.toml
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obdsd=info,obdsd_session=info,obdsd_device=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting obdsd (OBD Diagnostic Session Daemon)");

    // Parse command-line arguments
    let args = parse_args();

    // Load model profiles from files
    let profiles = load_model_profiles(&args)?;
    if !profiles.is_empty() {
        tracing::info!("Loaded {} model profiles from files", profiles.len());
    }

    // Build the engine from a config file, or fall back to a demo device
    let (engine, demo) = if let Some(ref path) = args.config_path {
        tracing::info!("Loading config from: {}", path);
        let daemon_config = config::load_config_file(path)?;
        build_engine(daemon_config, &profiles)?
    } else {
        tracing::info!("No config file provided, using a simulated demo device");
        (demo_engine(&profiles)?, Some(DemoConfig::default()))
    };

    // Load per-make anomaly tables
    load_anomaly_tables(&args, &engine)?;

    // Kick off the demo session, if one is configured
    if let Some(demo) = demo {
        start_demo_session(&engine, &demo).await?;
    }

    tracing::info!("Engine ready; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}

/// Build the engine from a loaded config: socket transports, every
/// configured device registered with the hub.
fn build_engine(
    config: DaemonConfig,
    profiles: &ModelProfileSet,
) -> anyhow::Result<(SessionEngine, Option<DemoConfig>)> {
    let hub = Arc::new(ConnectionHub::new(Arc::new(SocketTransportFactory)));
    let engine = SessionEngine::new(config.engine.clone(), hub, standin_collaborators());

    for entry in config.devices {
        let device_config = entry.into_device_config(&config.engine, profiles);
        let serial = device_config.device.serial.clone();
        let transports = device_config.preference();
        engine
            .hub()
            .register(device_config)
            .with_context(|| format!("registering device {serial}"))?;
        tracing::info!(serial = %serial, transports = ?transports, "Registered device");
    }

    engine.load_model_profiles(profiles.clone());
    Ok((engine, config.demo))
}

/// Engine wired to an in-process simulated vehicle, for running without
/// hardware. The vehicle carries a stored misfire code so the demo session
/// produces a fault detection on the first trouble-code poll.
fn demo_engine(profiles: &ModelProfileSet) -> anyhow::Result<SessionEngine> {
    let vehicle = Arc::new(MockVehicle::new(DEMO_SERIAL, DEMO_SECRET.as_bytes()).with_standard_sensors());
    vehicle.add_trouble_code("P0300");

    let factory = Arc::new(MockTransportFactory::new(vehicle));
    let hub = Arc::new(ConnectionHub::new(factory));
    let engine = SessionEngine::new(EngineConfig::default(), hub, standin_collaborators());

    engine.hub().register(DeviceConfig {
        device: Device {
            serial: DEMO_SERIAL.to_string(),
            model: "demo".to_string(),
            tier: DeviceTier::Standard,
            supported_protocols: vec![KnownProtocol::Can.into()],
            transport_preference: vec![TransportKind::Wifi, TransportKind::Bluetooth],
            lifecycle: DeviceLifecycle::Registered,
            tenant_id: Some("demo-tenant".to_string()),
        },
        endpoints: vec![
            EndpointConfig::Mock {
                kind: TransportKind::Wifi,
                latency_ms: 2,
            },
            EndpointConfig::Mock {
                kind: TransportKind::Bluetooth,
                latency_ms: 5,
            },
        ],
        auth: AuthConfig {
            secret: DEMO_SECRET.to_string(),
        },
        timings: TimingConfig::default(),
    })?;

    engine.load_model_profiles(profiles.clone());
    Ok(engine)
}

/// Load model profiles from CLI arguments
fn load_model_profiles(args: &Args) -> anyhow::Result<ModelProfileSet> {
    let mut profiles = ModelProfileSet::default();

    for path_str in &args.model_profiles {
        let path = Path::new(path_str);
        if path.is_dir() {
            for file in yaml_files_in(path)? {
                if let Err(e) = load_profile_file(&mut profiles, &file) {
                    tracing::warn!("Failed to load {}: {}", file.display(), e);
                }
            }
        } else if path.is_file() {
            load_profile_file(&mut profiles, path)?;
        } else {
            tracing::warn!("Model profile path not found: {}", path_str);
        }
    }

    Ok(profiles)
}

/// Load a single model profile file
fn load_profile_file(profiles: &mut ModelProfileSet, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let loaded = ModelProfileSet::from_yaml(&content)?;
    tracing::info!("Loaded {} model profiles from {}", loaded.len(), path.display());
    profiles.merge(loaded);
    Ok(())
}

/// Load per-make anomaly tables from CLI arguments into the engine registry
fn load_anomaly_tables(args: &Args, engine: &SessionEngine) -> anyhow::Result<()> {
    for path_str in &args.anomaly_tables {
        let path = Path::new(path_str);
        if path.is_dir() {
            for file in yaml_files_in(path)? {
                if let Err(e) = load_anomaly_file(engine, &file) {
                    tracing::warn!("Failed to load {}: {}", file.display(), e);
                }
            }
        } else if path.is_file() {
            load_anomaly_file(engine, path)?;
        } else {
            tracing::warn!("Anomaly table path not found: {}", path_str);
        }
    }

    Ok(())
}

/// Load a single anomaly table file
fn load_anomaly_file(engine: &SessionEngine, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let count = engine.registry().load_yaml(&content)?;
    tracing::info!("Loaded {} anomaly tables from {}", count, path.display());
    Ok(())
}

/// YAML files directly inside a directory, in name order
fn yaml_files_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext == "yaml" || ext == "yml" {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Start a session against the demo vehicle and log its live view
async fn start_demo_session(engine: &SessionEngine, demo: &DemoConfig) -> anyhow::Result<()> {
    let serial = match &demo.device_serial {
        Some(serial) => serial.clone(),
        None => engine
            .hub()
            .devices()
            .first()
            .map(|d| d.serial.clone())
            .ok_or_else(|| anyhow::anyhow!("demo session requested but no devices registered"))?,
    };

    let vehicle = VehicleProfile::new(&demo.vin, &demo.make, &demo.model, demo.model_year);
    let session_id = engine.create_session(vehicle, &serial, &demo.technician_id, Vec::new())?;

    // Subscribe before activation so the live view sees the session start
    let receiver = engine.subscribe(&session_topic(session_id));
    tokio::spawn(async move {
        let mut events = BroadcastStream::new(receiver);
        while let Some(result) = events.next().await {
            match result {
                Ok(event) => log_event(&event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Live view lagging, events dropped");
                }
            }
        }
    });

    engine.activate_session(session_id).await?;
    tracing::info!(session_id = %session_id, device = %serial, "Demo session running");
    Ok(())
}

/// One log line per live-view event
fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::SessionStarted {
            vehicle_vin,
            device_serial,
            ..
        } => {
            tracing::info!(vin = %vehicle_vin, device = %device_serial, "Session started");
        }
        SessionEvent::Reading { reading, .. } => {
            tracing::debug!(
                sensor = ?reading.sensor,
                value = reading.value,
                unit = %reading.unit,
                "Reading"
            );
        }
        SessionEvent::FaultDetected { fault, .. } => {
            tracing::warn!(
                code = %fault.code,
                severity = ?fault.severity,
                occurrences = fault.occurrence_count,
                "Fault detected"
            );
        }
        SessionEvent::DiagnosisAdded { diagnosis_id, .. } => {
            tracing::info!(diagnosis_id = %diagnosis_id, "Diagnosis added");
        }
        SessionEvent::ConnectionRecovering { device_serial, .. } => {
            tracing::warn!(device = %device_serial, "Connection recovering");
        }
        SessionEvent::ConnectionRecovered {
            device_serial,
            transport,
            ..
        } => {
            tracing::info!(device = %device_serial, transport = %transport, "Connection recovered");
        }
        SessionEvent::SessionCompleted { outcome, .. } => {
            tracing::info!(outcome = ?outcome, "Session completed");
        }
        SessionEvent::SessionCancelled { .. } => {
            tracing::info!("Session cancelled");
        }
        SessionEvent::SessionFailed { reason, .. } => {
            tracing::error!(reason = %reason, "Session failed");
        }
    }
}

/// Logs alerts instead of delivering them. Deployments embed the engine as
/// a library and wire in their own notification fabric; the daemon only
/// exposes the live-view bus.
struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send_critical_fault_alert(
        &self,
        technician_id: &str,
        vehicle_vin: &str,
        fault: &FaultCode,
    ) -> Result<(), NotifyError> {
        tracing::warn!(
            technician_id,
            vehicle_vin,
            code = %fault.code,
            severity = ?fault.severity,
            "Critical fault alert"
        );
        Ok(())
    }

    async fn send_predictive_maintenance_alert(
        &self,
        tenant_id: &str,
        vehicle_vin: &str,
        recommendation: &RepairRecommendation,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            tenant_id,
            vehicle_vin,
            action = %recommendation.action,
            priority = ?recommendation.priority,
            "Predictive maintenance alert"
        );
        Ok(())
    }
}

fn standin_collaborators() -> Collaborators {
    Collaborators {
        analysis: Arc::new(ScriptedAnalysis::new()),
        notifier: Arc::new(LogNotifier),
        store: Arc::new(MemoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_profile_directory_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vw.yaml"), "mk1:\n  tier: professional\n").unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "mk2: [not a profile\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let args = Args {
            config_path: None,
            model_profiles: vec![dir.path().to_string_lossy().into_owned()],
            anomaly_tables: Vec::new(),
        };

        let profiles = load_model_profiles(&args).unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles.get("mk1").is_some());
    }

    #[test]
    fn test_missing_profile_path_is_skipped() {
        let args = Args {
            config_path: None,
            model_profiles: vec!["/nonexistent/profiles".into()],
            anomaly_tables: Vec::new(),
        };
        assert!(load_model_profiles(&args).unwrap().is_empty());
    }
}
