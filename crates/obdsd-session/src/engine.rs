//! The session engine.
//!
//! One engine owns the connection hub, the collaborator handles and
//! every diagnostic session. Each active session runs a pipeline task
//! plus three consumer tasks (analysis, live events, persistence) fed
//! through a drop-oldest fan-out, so a slow collaborator can never
//! stall the sampling loop.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use obdsd_core::{
    session_topic, technician_topic, AnalysisService, Confidence, Diagnosis, EngineError,
    EngineResult, EventBus, Notifier, RepairPriority, SensorReading, SensorSummary, SensorType,
    SessionErrorReason, SessionEvent, SessionOutcome, SessionStatus, SessionStore, VehicleProfile,
};
use obdsd_device::{ConnectionHub, DeviceLease, HubError, StreamConfig, StreamItem};
use obdsd_protocol::DecoderRegistry;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, ModelProfileSet};
use crate::detector::{Detection, FaultDetector};
use crate::fanout::{DropQueue, Fanout};
use crate::pipeline::{self, PipelineContext, PipelineEnd};
use crate::registry::ModelRegistry;
use crate::session::{DiagnosticSession, SessionView};

/// External collaborators the engine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub analysis: Arc<dyn AnalysisService>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn SessionStore>,
}

/// Sensors sampled when a session does not name its own set.
pub const DEFAULT_SENSORS: &[SensorType] = &[
    SensorType::EngineRpm,
    SensorType::VehicleSpeed,
    SensorType::EngineLoad,
    SensorType::CoolantTemp,
    SensorType::ThrottlePosition,
    SensorType::ControlModuleVoltage,
];

struct SessionHandle {
    session: Arc<RwLock<DiagnosticSession>>,
    /// Engine config after model-profile overrides and tier clamping
    effective: EngineConfig,
    sensors: Vec<SensorType>,
    fanout: Arc<Fanout<StreamItem>>,
    lease: Arc<Mutex<Option<DeviceLease>>>,
    shutdown: watch::Sender<bool>,
    /// Consumer tasks; the pipeline task is tracked separately because
    /// it may itself drive the terminal transition.
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    pipeline: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    config: EngineConfig,
    profiles: RwLock<ModelProfileSet>,
    hub: Arc<ConnectionHub>,
    analysis: Arc<dyn AnalysisService>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn SessionStore>,
    events: Arc<EventBus>,
    registry: Arc<ModelRegistry>,
    decoders: Arc<DecoderRegistry>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
}

/// Handle to the engine; clones share the same state.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn new(config: EngineConfig, hub: Arc<ConnectionHub>, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                profiles: RwLock::new(ModelProfileSet::default()),
                hub,
                analysis: collaborators.analysis,
                notifier: collaborators.notifier,
                store: collaborators.store,
                events: Arc::new(EventBus::default()),
                registry: Arc::new(ModelRegistry::with_builtin()),
                decoders: Arc::new(DecoderRegistry::new()),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> Arc<ConnectionHub> {
        Arc::clone(&self.inner.hub)
    }

    /// Anomaly tables; swap one at runtime and running sessions pick it
    /// up on their next sample.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Pass-through decoders for manufacturer-specific traffic.
    pub fn decoders(&self) -> Arc<DecoderRegistry> {
        Arc::clone(&self.inner.decoders)
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    /// Subscribe to a live-view topic (see [`session_topic`] and
    /// [`technician_topic`]).
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe(topic)
    }

    pub fn load_model_profiles(&self, profiles: ModelProfileSet) {
        self.inner.profiles.write().merge(profiles);
    }

    // ---- session lifecycle ------------------------------------------------

    /// Create a session in Initiated. No device I/O happens yet; the
    /// device only has to be registered with the hub.
    pub fn create_session(
        &self,
        vehicle: VehicleProfile,
        device_serial: &str,
        technician_id: &str,
        sensors: Vec<SensorType>,
    ) -> EngineResult<Uuid> {
        let device = self.inner.hub.device(device_serial).ok_or_else(|| {
            EngineError::DeviceUnavailable(format!("device {device_serial} not registered"))
        })?;
        let effective = self
            .inner
            .config
            .for_device(&device, &self.inner.profiles.read());
        let sensors = if sensors.is_empty() {
            DEFAULT_SENSORS.to_vec()
        } else {
            sensors
        };
        let session = DiagnosticSession::new(
            vehicle,
            device_serial,
            technician_id,
            device.tenant_id.clone(),
            effective.recent_window,
        );
        let session_id = session.id();
        let (shutdown, _) = watch::channel(false);
        let handle = Arc::new(SessionHandle {
            session: Arc::new(RwLock::new(session)),
            fanout: Arc::new(Fanout::new(effective.queue_capacity)),
            effective,
            sensors,
            lease: Arc::new(Mutex::new(None)),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
            pipeline: parking_lot::Mutex::new(None),
        });
        self.inner.sessions.write().insert(session_id, handle);
        info!(
            session_id = %session_id,
            device_serial,
            technician_id,
            "Session created"
        );
        Ok(session_id)
    }

    /// Lease the device, start streaming and move the session to
    /// InProgress. On failure the session stays Initiated and the
    /// device goes back to the hub.
    pub async fn activate_session(&self, session_id: Uuid) -> EngineResult<()> {
        let handle = self.inner.handle(session_id)?;
        let (status, serial, technician_id, vin) = {
            let session = handle.session.read();
            (
                session.status(),
                session.device_serial().to_string(),
                session.technician_id().to_string(),
                session.vehicle().vin.clone(),
            )
        };
        if status != SessionStatus::Initiated {
            return Err(EngineError::InvalidTransition {
                from: status,
                to: SessionStatus::InProgress,
            });
        }

        let lease = self.inner.hub.acquire(&serial).await.map_err(map_hub_error)?;
        let Some(protocol) = lease.device().supported_protocols.first().cloned() else {
            return Err(EngineError::Invalid(format!(
                "device {serial} declares no supported protocols"
            )));
        };
        let stream_config = StreamConfig {
            protocol,
            sensors: handle.sensors.clone(),
            interval: handle.effective.sampling_interval(),
            dtc_poll_ticks: handle.effective.dtc_poll_ticks,
            capacity: handle.effective.queue_capacity,
            decoders: Arc::clone(&self.inner.decoders),
        };

        // Subscribe before the first sample so no recovery event can
        // slip past the pipeline.
        let hub_events = lease.subscribe();
        let stream = lease
            .start_streaming(stream_config.clone())
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if let Err(e) = handle.session.write().begin() {
            // Lost a race against cancel; put the device back.
            lease.stop_streaming().await;
            return Err(e);
        }
        *handle.lease.lock().await = Some(lease);

        self.spawn_machinery(&handle, session_id, stream_config, stream, hub_events);

        self.inner.publish_both(
            session_id,
            &technician_id,
            SessionEvent::SessionStarted {
                session_id,
                vehicle_vin: vin,
                device_serial: serial,
            },
        );
        info!(session_id = %session_id, "Session activated");
        Ok(())
    }

    /// [`create_session`](Self::create_session) followed by
    /// [`activate_session`](Self::activate_session).
    pub async fn start_session(
        &self,
        vehicle: VehicleProfile,
        device_serial: &str,
        technician_id: &str,
        sensors: Vec<SensorType>,
    ) -> EngineResult<Uuid> {
        let session_id = self.create_session(vehicle, device_serial, technician_id, sensors)?;
        self.activate_session(session_id).await?;
        Ok(session_id)
    }

    /// Finish an InProgress session with the technician's outcome. Runs
    /// the closing AI review over the accumulated faults, then flushes
    /// the final record.
    pub async fn complete_session(
        &self,
        session_id: Uuid,
        outcome: SessionOutcome,
    ) -> EngineResult<()> {
        let handle = self.inner.handle(session_id)?;
        {
            let session = handle.session.read();
            if session.status() != SessionStatus::InProgress {
                return Err(EngineError::InvalidTransition {
                    from: session.status(),
                    to: SessionStatus::Completed,
                });
            }
        }

        // Stop sampling and drain the consumers first, so every
        // in-flight detection is folded before the closing review.
        self.inner.shutdown_machinery(&handle).await;

        let (vehicle, faults, technician_id, tenant_id) = {
            let session = handle.session.read();
            (
                session.vehicle().clone(),
                session.faults().to_vec(),
                session.technician_id().to_string(),
                session.tenant_id().map(str::to_string),
            )
        };
        if !faults.is_empty() {
            self.closing_review(session_id, &handle, &vehicle, &faults, &technician_id, tenant_id)
                .await;
        }

        handle.session.write().complete(outcome)?;

        let record = handle.session.read().record();
        if let Err(e) = self.inner.store.append_session(&record).await {
            warn!(session_id = %session_id, error = %e, "Session record append failed");
        }
        self.inner.publish_both(
            session_id,
            &technician_id,
            SessionEvent::SessionCompleted {
                session_id,
                outcome,
            },
        );
        info!(session_id = %session_id, outcome = ?outcome, "Session completed");
        Ok(())
    }

    /// Abandon a session from Initiated or InProgress. Stops sampling
    /// immediately and releases the device lease; the connection itself
    /// stays warm for the next acquire.
    pub async fn cancel_session(&self, session_id: Uuid) -> EngineResult<()> {
        let handle = self.inner.handle(session_id)?;
        handle.session.write().cancel()?;
        self.inner.shutdown_machinery(&handle).await;

        let (record, technician_id) = {
            let session = handle.session.read();
            (session.record(), session.technician_id().to_string())
        };
        if let Err(e) = self.inner.store.append_session(&record).await {
            warn!(session_id = %session_id, error = %e, "Session record append failed");
        }
        self.inner.publish_both(
            session_id,
            &technician_id,
            SessionEvent::SessionCancelled { session_id },
        );
        info!(session_id = %session_id, "Session cancelled");
        Ok(())
    }

    // ---- diagnoses ---------------------------------------------------------

    pub async fn add_diagnosis(&self, session_id: Uuid, diagnosis: Diagnosis) -> EngineResult<Uuid> {
        let handle = self.inner.handle(session_id)?;
        let diagnosis_id = handle.session.write().add_diagnosis(diagnosis.clone())?;
        if let Err(e) = self.inner.store.append_diagnosis(session_id, &diagnosis).await {
            warn!(session_id = %session_id, error = %e, "Diagnosis append failed");
        }
        let technician_id = handle.session.read().technician_id().to_string();
        self.inner.publish_both(
            session_id,
            &technician_id,
            SessionEvent::DiagnosisAdded {
                session_id,
                diagnosis_id,
            },
        );
        Ok(diagnosis_id)
    }

    /// Attach a review marker to a diagnosis. Works on terminal
    /// sessions too; reviewing after completion is the normal flow for
    /// AI diagnoses.
    pub async fn review_diagnosis(
        &self,
        session_id: Uuid,
        diagnosis_id: Uuid,
        reviewer_id: &str,
    ) -> EngineResult<()> {
        let handle = self.inner.handle(session_id)?;
        let reviewed = {
            let mut session = handle.session.write();
            session.review_diagnosis(diagnosis_id, reviewer_id)?;
            session
                .diagnosis(diagnosis_id)
                .cloned()
                .ok_or_else(|| EngineError::Internal("reviewed diagnosis vanished".into()))?
        };
        // Re-append so the review lands in the journal.
        if let Err(e) = self.inner.store.append_diagnosis(session_id, &reviewed).await {
            warn!(session_id = %session_id, error = %e, "Diagnosis review append failed");
        }
        Ok(())
    }

    // ---- views --------------------------------------------------------------

    pub fn session_view(&self, session_id: Uuid) -> EngineResult<SessionView> {
        let handle = self.inner.handle(session_id)?;
        let drops = handle.fanout.drops();
        let view = handle.session.read().view(drops);
        Ok(view)
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.inner.sessions.read().keys().copied().collect()
    }

    /// Cancel every non-terminal session; used on daemon shutdown.
    pub async fn shutdown(&self) {
        for session_id in self.session_ids() {
            match self.cancel_session(session_id).await {
                Ok(()) => {}
                Err(EngineError::InvalidTransition { .. }) | Err(EngineError::SessionNotFound(_)) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "Shutdown cancel skipped"),
            }
        }
    }

    // ---- machinery -----------------------------------------------------------

    fn spawn_machinery(
        &self,
        handle: &Arc<SessionHandle>,
        session_id: Uuid,
        stream_config: StreamConfig,
        stream: mpsc::Receiver<StreamItem>,
        hub_events: broadcast::Receiver<obdsd_device::HubEvent>,
    ) {
        let inner = &self.inner;

        let ctx = PipelineContext {
            session_id,
            session: Arc::clone(&handle.session),
            lease: Arc::clone(&handle.lease),
            hub_events,
            fanout: Arc::clone(&handle.fanout),
            stream_config,
            loss_timeout: handle.effective.loss_timeout(),
            events: Arc::clone(&inner.events),
            shutdown: handle.shutdown.subscribe(),
        };
        let weak = Arc::downgrade(inner);
        let pipeline_task = tokio::spawn(async move {
            match pipeline::run(ctx, stream).await {
                PipelineEnd::Stopped => {}
                PipelineEnd::ConnectionLost => {
                    if let Some(inner) = weak.upgrade() {
                        inner
                            .fail_session(session_id, SessionErrorReason::ConnectionLost)
                            .await;
                    }
                }
                PipelineEnd::Failed => {
                    if let Some(inner) = weak.upgrade() {
                        inner
                            .fail_session(session_id, SessionErrorReason::PipelineFailure)
                            .await;
                    }
                }
            }
        });

        let detector = FaultDetector::new(
            Arc::clone(&inner.analysis),
            Arc::clone(&inner.registry),
            handle.effective.ai_timeout(),
        );
        let analysis_task = tokio::spawn(run_analysis(
            Arc::downgrade(inner),
            Arc::clone(&handle.session),
            handle.fanout.analysis(),
            detector,
            session_id,
        ));
        let events_task = tokio::spawn(run_events(
            Arc::downgrade(inner),
            handle.fanout.events(),
            session_id,
        ));
        let persist_task = tokio::spawn(run_persist(
            Arc::downgrade(inner),
            handle.fanout.persist(),
            session_id,
        ));

        *handle.pipeline.lock() = Some(pipeline_task);
        handle
            .tasks
            .lock()
            .extend([analysis_task, events_task, persist_task]);
    }

    /// Closing AI pass over the final fault list: one AI diagnosis plus
    /// predictive maintenance alerts for the owning tenant. Skipped
    /// silently when the collaborator cannot answer in time.
    async fn closing_review(
        &self,
        session_id: Uuid,
        handle: &Arc<SessionHandle>,
        vehicle: &VehicleProfile,
        faults: &[obdsd_core::FaultCode],
        technician_id: &str,
        tenant_id: Option<String>,
    ) {
        let recommendations = match tokio::time::timeout(
            handle.effective.ai_timeout(),
            self.inner.analysis.recommend_repairs(faults, vehicle),
        )
        .await
        {
            Ok(Ok(recommendations)) if !recommendations.is_empty() => recommendations,
            Ok(Ok(_)) => return,
            Ok(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "Repair recommendations unavailable");
                return;
            }
            Err(_) => {
                debug!(session_id = %session_id, "Repair recommendations timed out");
                return;
            }
        };

        let model_version = self
            .inner
            .registry
            .resolve(&vehicle.make)
            .map(|m| m.version.clone())
            .unwrap_or_else(|| "unversioned".to_string());
        let diagnosis = Diagnosis::ai(
            model_version,
            format!("Automated review of {} fault code(s)", faults.len()),
            Confidence::Medium,
            recommendations.clone(),
        );
        let diagnosis_id = diagnosis.id;
        if handle.session.write().add_diagnosis(diagnosis.clone()).is_err() {
            return;
        }
        if let Err(e) = self.inner.store.append_diagnosis(session_id, &diagnosis).await {
            warn!(session_id = %session_id, error = %e, "Diagnosis append failed");
        }
        self.inner.publish_both(
            session_id,
            technician_id,
            SessionEvent::DiagnosisAdded {
                session_id,
                diagnosis_id,
            },
        );

        let Some(tenant_id) = tenant_id else { return };
        for recommendation in recommendations
            .into_iter()
            .filter(|r| r.priority >= RepairPriority::High)
        {
            let notifier = Arc::clone(&self.inner.notifier);
            let tenant_id = tenant_id.clone();
            let vin = vehicle.vin.clone();
            // Fire and forget; delivery failures are logged only.
            tokio::spawn(async move {
                if let Err(e) = notifier
                    .send_predictive_maintenance_alert(&tenant_id, &vin, &recommendation)
                    .await
                {
                    warn!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Predictive maintenance alert delivery failed"
                    );
                }
            });
        }
    }
}

impl EngineInner {
    fn handle(&self, session_id: Uuid) -> EngineResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn publish_both(&self, session_id: Uuid, technician_id: &str, event: SessionEvent) {
        self.events.publish(&session_topic(session_id), event.clone());
        self.events.publish(&technician_topic(technician_id), event);
    }

    /// Stop sampling, release the device lease, close the fan-out and
    /// drain the consumer tasks. Idempotent; safe to call from any
    /// terminal path.
    async fn shutdown_machinery(&self, handle: &Arc<SessionHandle>) {
        let _ = handle.shutdown.send(true);
        let lease = handle.lease.lock().await.take();
        if let Some(lease) = lease {
            lease.stop_streaming().await;
            // Dropping the lease releases the device; the connection
            // stays warm in the hub.
            drop(lease);
        }
        handle.fanout.close();
        let tasks: Vec<JoinHandle<()>> = handle.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session consumer task failed");
            }
        }
    }

    /// Force an InProgress session into Error. Driven by the pipeline
    /// when the device connection is gone for good.
    async fn fail_session(self: &Arc<Self>, session_id: Uuid, reason: SessionErrorReason) {
        let Ok(handle) = self.handle(session_id) else {
            return;
        };
        {
            let mut session = handle.session.write();
            if let Err(e) = session.fail(reason) {
                debug!(session_id = %session_id, error = %e, "Fail skipped, session already terminal");
                return;
            }
        }
        self.shutdown_machinery(&handle).await;

        let (record, technician_id) = {
            let session = handle.session.read();
            (session.record(), session.technician_id().to_string())
        };
        if let Err(e) = self.store.append_session(&record).await {
            warn!(session_id = %session_id, error = %e, "Session record append failed");
        }
        self.publish_both(
            session_id,
            &technician_id,
            SessionEvent::SessionFailed { session_id, reason },
        );
        warn!(session_id = %session_id, reason = %reason, "Session failed");
    }
}

fn map_hub_error(e: HubError) -> EngineError {
    match e {
        HubError::AuthenticationRejected { .. } => EngineError::Authentication(e.to_string()),
        HubError::AllTransportsFailed { .. } => EngineError::Transport(e.to_string()),
        HubError::DeviceNotFound(_)
        | HubError::AlreadyRegistered(_)
        | HubError::DeviceRetired(_)
        | HubError::DeviceBusy(_) => EngineError::DeviceUnavailable(e.to_string()),
    }
}

// ---- consumer loops ----------------------------------------------------------

/// Analysis consumer: every reading goes through the detector, every
/// DTC poll result through classification, and the outcomes fold into
/// the session's fault list.
async fn run_analysis(
    weak: Weak<EngineInner>,
    session: Arc<RwLock<DiagnosticSession>>,
    queue: Arc<DropQueue<StreamItem>>,
    detector: FaultDetector,
    session_id: Uuid,
) {
    while let Some(item) = queue.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let vehicle = session.read().vehicle().clone();
        match item {
            StreamItem::Reading(reading) => {
                for detection in detector.evaluate(&vehicle, &reading).await {
                    fold_detection(&inner, &session, session_id, detection).await;
                }
            }
            StreamItem::TroubleCodes(codes) => {
                for code in codes {
                    let detection = detector.classify(&vehicle, &code).await;
                    fold_detection(&inner, &session, session_id, detection).await;
                }
            }
        }
    }
}

/// Fold one detection into the session; publish, persist, escalate.
async fn fold_detection(
    inner: &Arc<EngineInner>,
    session: &Arc<RwLock<DiagnosticSession>>,
    session_id: Uuid,
    detection: Detection,
) {
    let (folded, technician_id, vin) = {
        let mut session = session.write();
        let folded = match session.record_fault(detection.into_fault()) {
            Ok(folded) => folded,
            // Session went terminal while the item sat in the queue.
            Err(_) => return,
        };
        (
            folded,
            session.technician_id().to_string(),
            session.vehicle().vin.clone(),
        )
    };

    inner.publish_both(
        session_id,
        &technician_id,
        SessionEvent::FaultDetected {
            session_id,
            fault: folded.fault.clone(),
        },
    );
    if let Err(e) = inner.store.append_fault(session_id, &folded.fault).await {
        warn!(session_id = %session_id, code = %folded.fault.code, error = %e, "Fault append failed");
    }

    if folded.escalate {
        let notifier = Arc::clone(&inner.notifier);
        let fault = folded.fault.clone();
        // Fire and forget: delivery must not hold up the analysis queue.
        tokio::spawn(async move {
            if let Err(e) = notifier
                .send_critical_fault_alert(&technician_id, &vin, &fault)
                .await
            {
                warn!(code = %fault.code, error = %e, "Critical fault alert delivery failed");
            }
        });
    }
}

/// Live-view consumer: readings go out on the session topic.
async fn run_events(weak: Weak<EngineInner>, queue: Arc<DropQueue<StreamItem>>, session_id: Uuid) {
    let topic = session_topic(session_id);
    while let Some(item) = queue.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        if let StreamItem::Reading(reading) = item {
            inner
                .events
                .publish(&topic, SessionEvent::Reading { session_id, reading });
        }
    }
}

/// Persistence consumer: folds readings into one summary per sensor
/// and flushes them when the queue closes. Raw samples never hit the
/// store.
async fn run_persist(weak: Weak<EngineInner>, queue: Arc<DropQueue<StreamItem>>, session_id: Uuid) {
    let mut folds: HashMap<SensorType, SummaryFold> = HashMap::new();
    while let Some(item) = queue.recv().await {
        if let StreamItem::Reading(reading) = item {
            match folds.entry(reading.sensor) {
                Entry::Occupied(mut entry) => entry.get_mut().fold(&reading),
                Entry::Vacant(slot) => {
                    slot.insert(SummaryFold::new(&reading));
                }
            }
        }
    }

    let Some(inner) = weak.upgrade() else { return };
    for (_, fold) in folds {
        let summary = fold.into_summary();
        if let Err(e) = inner.store.append_sensor_summary(session_id, &summary).await {
            warn!(
                session_id = %session_id,
                sensor = ?summary.sensor,
                error = %e,
                "Summary append failed"
            );
        }
    }
}

/// Running aggregate of one sensor within a session.
struct SummaryFold {
    sensor: SensorType,
    samples: u64,
    min: f64,
    max: f64,
    sum: f64,
    last: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

impl SummaryFold {
    fn new(reading: &SensorReading) -> Self {
        Self {
            sensor: reading.sensor,
            samples: 1,
            min: reading.value,
            max: reading.value,
            sum: reading.value,
            last: reading.value,
            window_start: reading.timestamp,
            window_end: reading.timestamp,
        }
    }

    fn fold(&mut self, reading: &SensorReading) {
        self.samples += 1;
        self.min = self.min.min(reading.value);
        self.max = self.max.max(reading.value);
        self.sum += reading.value;
        self.last = reading.value;
        self.window_end = reading.timestamp;
    }

    fn into_summary(self) -> SensorSummary {
        SensorSummary {
            sensor: self.sensor,
            samples: self.samples,
            min: self.min,
            max: self.max,
            mean: self.sum / self.samples as f64,
            last: self.last,
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }
}
