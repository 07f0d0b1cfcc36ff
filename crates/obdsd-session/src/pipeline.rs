//! Per-session sampling pipeline.
//!
//! One pipeline task drains the raw stream of its device lease, folds
//! every reading into the session aggregate inline (so any consumer
//! observes a session at least as current as the item it holds) and
//! fans the item out to the consumer queues. Nothing on this path
//! blocks on a consumer.
//!
//! When the raw stream closes unexpectedly the pipeline suspends: it
//! watches the hub's recovery events and restarts the stream on the
//! replacement connection once one is up. The missed span stays a gap
//! in the data; no samples are fabricated. If recovery does not land
//! within the loss window the pipeline ends with `ConnectionLost` and
//! the engine forces the session into Error.

use std::sync::Arc;
use std::time::Duration;

use obdsd_core::{session_topic, EventBus, SessionEvent};
use obdsd_device::{ConnectionError, DeviceLease, HubEvent, StreamConfig, StreamItem};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fanout::Fanout;
use crate::session::DiagnosticSession;

/// How often a suspended pipeline re-probes the lease after a recovery
/// signal, in case the first restart attempt raced the swap.
const REPROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Why a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// Stop requested; completion or cancellation is in progress
    Stopped,
    /// The loss window elapsed or the hub gave the connection up
    ConnectionLost,
    /// The machinery itself failed (lease vanished mid-session)
    Failed,
}

/// Everything one pipeline run needs.
pub struct PipelineContext {
    pub session_id: Uuid,
    pub session: Arc<RwLock<DiagnosticSession>>,
    pub lease: Arc<Mutex<Option<DeviceLease>>>,
    /// Hub recovery events, subscribed before the first item is drained
    pub hub_events: broadcast::Receiver<HubEvent>,
    pub fanout: Arc<Fanout<StreamItem>>,
    pub stream_config: StreamConfig,
    pub loss_timeout: Duration,
    pub events: Arc<EventBus>,
    pub shutdown: watch::Receiver<bool>,
}

enum DrainEnd {
    Stop,
    StreamClosed,
}

enum Suspension {
    Resumed(mpsc::Receiver<StreamItem>),
    Stop,
    Lost,
    Failed,
}

enum StartOutcome {
    Started(mpsc::Receiver<StreamItem>),
    /// Connection not usable yet; probe again
    NotReady,
    /// Lease gone; nothing left to stream from
    Gone,
}

/// Drive one session's stream until stop, loss or failure.
pub async fn run(
    mut ctx: PipelineContext,
    mut stream: mpsc::Receiver<StreamItem>,
) -> PipelineEnd {
    info!(session_id = %ctx.session_id, "Pipeline started");
    loop {
        match drain_stream(&mut ctx, &mut stream).await {
            DrainEnd::Stop => {
                debug!(session_id = %ctx.session_id, "Pipeline stopped");
                return PipelineEnd::Stopped;
            }
            DrainEnd::StreamClosed => {}
        }

        warn!(session_id = %ctx.session_id, "Raw stream closed, suspending until recovery");
        match suspend_until_resumed(&mut ctx).await {
            Suspension::Resumed(next) => stream = next,
            Suspension::Stop => return PipelineEnd::Stopped,
            Suspension::Lost => return PipelineEnd::ConnectionLost,
            Suspension::Failed => return PipelineEnd::Failed,
        }
    }
}

/// Consume the raw stream until it closes or stop is requested.
async fn drain_stream(
    ctx: &mut PipelineContext,
    stream: &mut mpsc::Receiver<StreamItem>,
) -> DrainEnd {
    loop {
        tokio::select! {
            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    return DrainEnd::Stop;
                }
            }
            item = stream.recv() => match item {
                Some(item) => deliver(ctx, item),
                None => return DrainEnd::StreamClosed,
            },
        }
    }
}

/// Fold one item into the session, then fan it out. Synchronous: the
/// sampling path never awaits a consumer.
fn deliver(ctx: &PipelineContext, item: StreamItem) {
    if let StreamItem::Reading(reading) = &item {
        ctx.session.write().record_reading(reading.clone());
    }
    ctx.fanout.publish(item);
}

/// Wait out a connection loss. Ends with a fresh raw stream, a stop
/// request, or the loss verdict once the window elapses.
async fn suspend_until_resumed(ctx: &mut PipelineContext) -> Suspension {
    let deadline = tokio::time::Instant::now() + ctx.loss_timeout;
    let mut recovered = false;
    loop {
        // A stop can land between selects, and the takedown empties
        // the lease; consult the flag before probing it.
        if *ctx.shutdown.borrow() {
            return Suspension::Stop;
        }
        if recovered {
            match start_stream(ctx).await {
                StartOutcome::Started(stream) => return Suspension::Resumed(stream),
                StartOutcome::NotReady => {}
                // The takedown raises the stop flag before it empties
                // the lease, so a gone lease under the flag is a stop.
                StartOutcome::Gone if *ctx.shutdown.borrow() => return Suspension::Stop,
                StartOutcome::Gone => return Suspension::Failed,
            }
        }
        tokio::select! {
            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    return Suspension::Stop;
                }
            }
            event = tokio::time::timeout_at(deadline, ctx.hub_events.recv()) => match event {
                Err(_) => {
                    warn!(session_id = %ctx.session_id, "Loss window elapsed without recovery");
                    return Suspension::Lost;
                }
                Ok(Ok(HubEvent::Recovering { serial })) => {
                    debug!(session_id = %ctx.session_id, serial = %serial, "Recovery in progress");
                    ctx.events.publish(
                        &session_topic(ctx.session_id),
                        SessionEvent::ConnectionRecovering {
                            session_id: ctx.session_id,
                            device_serial: serial,
                        },
                    );
                }
                Ok(Ok(HubEvent::Recovered { serial, transport })) => {
                    info!(
                        session_id = %ctx.session_id,
                        transport = %transport,
                        "Connection recovered, resuming stream"
                    );
                    ctx.events.publish(
                        &session_topic(ctx.session_id),
                        SessionEvent::ConnectionRecovered {
                            session_id: ctx.session_id,
                            device_serial: serial,
                            transport,
                        },
                    );
                    recovered = true;
                }
                Ok(Ok(HubEvent::ConnectionLost { serial, reason })) => {
                    warn!(
                        session_id = %ctx.session_id,
                        serial = %serial,
                        reason = %reason,
                        "Hub gave the connection up"
                    );
                    return Suspension::Lost;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    // A Recovered may be among the skipped events; probe.
                    debug!(session_id = %ctx.session_id, skipped, "Hub event feed lagged");
                    recovered = true;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Suspension::Lost,
            },
            _ = tokio::time::sleep(REPROBE_INTERVAL), if recovered => {}
        }
    }
}

async fn start_stream(ctx: &PipelineContext) -> StartOutcome {
    let lease = ctx.lease.lock().await;
    let Some(lease) = lease.as_ref() else {
        return StartOutcome::Gone;
    };
    match lease.start_streaming(ctx.stream_config.clone()).await {
        Ok(stream) => StartOutcome::Started(stream),
        Err(ConnectionError::AlreadyStreaming) => StartOutcome::NotReady,
        Err(e) if e.is_connection_lost() => StartOutcome::NotReady,
        Err(e) => {
            warn!(session_id = %ctx.session_id, error = %e, "Stream restart failed");
            StartOutcome::Gone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obdsd_core::{KnownProtocol, SensorType, TransportKind, VehicleProfile};
    use obdsd_protocol::DecoderRegistry;

    fn context(
        hub_events: broadcast::Receiver<HubEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> PipelineContext {
        let mut session = DiagnosticSession::new(
            VehicleProfile::new("WVWZZZ1JZXW000001", "Volkswagen", "Golf", 2019),
            "OBD-1",
            "tech-7",
            None,
            16,
        );
        session.begin().expect("fresh session begins");
        PipelineContext {
            session_id: session.id(),
            session: Arc::new(RwLock::new(session)),
            lease: Arc::new(Mutex::new(None)),
            hub_events,
            fanout: Arc::new(Fanout::new(8)),
            stream_config: StreamConfig {
                protocol: KnownProtocol::Can.into(),
                sensors: vec![SensorType::EngineRpm],
                interval: Duration::from_millis(100),
                dtc_poll_ticks: 0,
                capacity: 8,
                decoders: Arc::new(DecoderRegistry::new()),
            },
            loss_timeout: Duration::from_secs(120),
            events: Arc::new(EventBus::default()),
            shutdown,
        }
    }

    fn closed_stream() -> mpsc::Receiver<StreamItem> {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn test_takedown_during_suspension_stops_instead_of_failing() {
        // The takedown raises the stop flag and then empties the lease.
        // A pipeline suspended with an unread recovery signal must read
        // the empty lease as that stop, not as a machinery failure.
        let (shutdown_tx, first_rx) = watch::channel(false);
        shutdown_tx.send(true).expect("receiver alive");
        // Subscribed after the send: the flag is set but not pending,
        // exactly the state of a receiver that lost the select race.
        let shutdown = shutdown_tx.subscribe();
        drop(first_rx);

        let (hub_tx, hub_events) = broadcast::channel(8);
        hub_tx
            .send(HubEvent::Recovered {
                serial: "OBD-1".into(),
                transport: TransportKind::Bluetooth,
            })
            .expect("receiver alive");

        let end = run(context(hub_events, shutdown), closed_stream()).await;
        assert_eq!(end, PipelineEnd::Stopped);
    }

    #[tokio::test]
    async fn test_vanished_lease_without_stop_is_a_failure() {
        // No stop requested: a lease that is gone after recovery is a
        // genuine machinery fault and must be reported as one.
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (hub_tx, hub_events) = broadcast::channel(8);
        hub_tx
            .send(HubEvent::Recovered {
                serial: "OBD-1".into(),
                transport: TransportKind::Wifi,
            })
            .expect("receiver alive");

        let end = run(context(hub_events, shutdown), closed_stream()).await;
        assert_eq!(end, PipelineEnd::Failed);
    }
}
