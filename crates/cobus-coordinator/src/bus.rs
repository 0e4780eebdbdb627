//! ---
//! cobus_section: "05-step-coordination"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Step coordination and bus service composition."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use cobus_common::config::{BusOptions, BusTopology, ConfigError, SignalKind};
use cobus_session::{SessionDescriptor, SessionError, SessionRegistry, SessionState};
use cobus_signal::{SignalError, SignalRegistry};
use cobus_transport::{
    ChannelWrites, Destination, Endpoint, Frame, Incoming, SignalLookup, TransportError,
};
use cobus_common::SimClock;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::channel::BusChannel;
use crate::metrics::BusMetrics;

/// Errors raised by the bus composition and step coordinator.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Signal registry failure (collision, kind conflict).
    #[error(transparent)]
    Signal(#[from] SignalError),
    /// Session registry failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Descriptor-derived configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The startup handshake did not complete within the grace period.
    #[error("TimeoutError: startup handshake not completed within {waited:?}")]
    StartupTimeout {
        /// How long the bus waited.
        waited: Duration,
    },
    /// A session wrote to a signal uid the channel does not carry.
    #[error("ProtocolError: model {model_uid} wrote unknown signal uid {uid} on channel '{channel}'")]
    UnknownSignal {
        /// Offending session.
        model_uid: u32,
        /// Channel the write targeted.
        channel: String,
        /// Unknown uid.
        uid: u32,
    },
    /// A session wrote a value of the wrong kind for a signal.
    #[error("ProtocolError: model {model_uid} violated the kind of signal uid {uid} on channel '{channel}'")]
    SignalKindViolation {
        /// Offending session.
        model_uid: u32,
        /// Channel the write targeted.
        channel: String,
        /// Signal uid.
        uid: u32,
    },
    /// A frame referenced a channel the bus does not manage.
    #[error("ProtocolError: model {model_uid} referenced unknown channel '{channel}'")]
    UnknownChannel {
        /// Offending session.
        model_uid: u32,
        /// Unknown channel name.
        channel: String,
    },
}

impl BusError {
    /// The session a contained (session-scoped) error should evict.
    fn offending_session(&self) -> Option<u32> {
        match self {
            BusError::UnknownSignal { model_uid, .. }
            | BusError::SignalKindViolation { model_uid, .. }
            | BusError::UnknownChannel { model_uid, .. } => Some(*model_uid),
            _ => None,
        }
    }
}

/// Final accounting of one bus run, for the shutdown log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusSummary {
    /// Completed cycles.
    pub cycles: u64,
    /// Simulation time when the run ended.
    pub bus_time: f64,
}

enum HandleOutcome {
    Continue,
    Shutdown(String),
    EndTime,
}

enum RunOutcome {
    Drained,
    External,
    ShutdownFrame(String),
    EndTime,
    Fatal(BusError),
}

/// The bus: transport endpoint, registries and the step coordinator wired
/// into one addressable service.
///
/// All channel state is owned by this object and mutated only from its run
/// loop; transport workers merely feed the endpoint inbox. The merge path
/// never blocks.
pub struct Bus {
    endpoint: Box<dyn Endpoint>,
    options: BusOptions,
    sessions: SessionRegistry,
    registry: SignalRegistry,
    channels: IndexMap<String, BusChannel>,
    clock: SimClock,
    metrics: Option<BusMetrics>,
    sequence: u64,
    cycles: u64,
    quorum_started: Option<Instant>,
}

impl Bus {
    /// Compose a bus from an endpoint and the derived topology.
    pub fn new(
        endpoint: Box<dyn Endpoint>,
        topology: &BusTopology,
        options: BusOptions,
        metrics_registry: Option<Arc<prometheus::Registry>>,
    ) -> Result<Self, BusError> {
        let mut registry = SignalRegistry::new();
        let mut channels = IndexMap::new();
        for (name, channel_topology) in &topology.channels {
            info!(
                "Channel: {} (expected models={})",
                name, channel_topology.expected_model_count
            );
            let channel = BusChannel::new(name.clone(), channel_topology, &mut registry)?;
            channels.insert(name.clone(), channel);
        }
        let metrics = match metrics_registry {
            Some(shared) => match BusMetrics::register(&shared) {
                Ok(metrics) => Some(metrics),
                Err(err) => {
                    warn!(error = %err, "bus metrics registration failed; continuing without");
                    None
                }
            },
            None => None,
        };
        let clock = SimClock::new(options.step_size);
        Ok(Self {
            endpoint,
            options,
            sessions: SessionRegistry::new(),
            registry,
            channels,
            clock,
            metrics,
            sequence: 0,
            cycles: 0,
            quorum_started: None,
        })
    }

    fn network_ready(&self) -> bool {
        self.channels.values().all(BusChannel::network_ready)
    }

    fn has_models(&self) -> bool {
        self.channels.values().any(BusChannel::has_models)
    }

    /// Drive the bus until the simulation ends.
    ///
    /// Termination: an external shutdown signal, a `Shutdown` frame from a
    /// supervising controller, the configured end time, or every session
    /// leaving, whichever comes first. A startup handshake that does not
    /// complete within the configured timeout is fatal.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<BusSummary, BusError> {
        self.endpoint.start().await?;
        info!(
            transport = self.endpoint.name(),
            uid = self.endpoint.uid(),
            step_size = self.options.step_size,
            "bus endpoint started"
        );

        let mut startup_complete = false;
        let mut consecutive_timeouts = 0u32;
        let outcome = loop {
            if !startup_complete && self.network_ready() {
                startup_complete = true;
                info!("Bus network is complete, all models connected.");
            }
            if startup_complete && !self.has_models() {
                break RunOutcome::Drained;
            }

            let incoming = tokio::select! {
                _ = shutdown.recv() => break RunOutcome::External,
                incoming = self.endpoint.recv(self.options.timeout) => incoming,
            };

            match incoming {
                Ok(Incoming::Frame(frame)) => {
                    consecutive_timeouts = 0;
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_frame();
                    }
                    match self.handle_frame(frame).await {
                        Ok(HandleOutcome::Continue) => {}
                        Ok(HandleOutcome::Shutdown(reason)) => {
                            break RunOutcome::ShutdownFrame(reason)
                        }
                        Ok(HandleOutcome::EndTime) => break RunOutcome::EndTime,
                        Err(err) => match err.offending_session() {
                            Some(model_uid) => {
                                warn!(
                                    error = %err,
                                    error_class = "ProtocolError",
                                    model_uid,
                                    cycle_time = self.clock.time(),
                                    "session violation; dropping session"
                                );
                                if let Some(outcome) =
                                    self.drop_session(model_uid, "protocol violation").await?
                                {
                                    break outcome;
                                }
                            }
                            None => break RunOutcome::Fatal(err),
                        },
                    }
                }
                Ok(Incoming::PeerClosed { model_uid }) => match model_uid {
                    Some(model_uid) => {
                        warn!(
                            model_uid,
                            cycle_time = self.clock.time(),
                            "model connection lost mid-run"
                        );
                        if let Some(outcome) =
                            self.drop_session(model_uid, "connection lost").await?
                        {
                            break outcome;
                        }
                    }
                    None => warn!("unattributed connection closed"),
                },
                Err(TransportError::Timeout(waited)) => {
                    if !startup_complete {
                        error!(
                            error_class = "TimeoutError",
                            waited_s = waited.as_secs_f64(),
                            "startup handshake not completed in time; aborting run"
                        );
                        let _ = self.endpoint.close().await;
                        return Err(BusError::StartupTimeout { waited });
                    }
                    consecutive_timeouts += 1;
                    warn!(
                        error_class = "TimeoutError",
                        consecutive_timeouts,
                        cycle_time = self.clock.time(),
                        "no message within timeout; retrying"
                    );
                }
                Err(err) => break RunOutcome::Fatal(err.into()),
            }
        };

        self.finish(outcome).await
    }

    async fn finish(mut self, outcome: RunOutcome) -> Result<BusSummary, BusError> {
        let result = match outcome {
            RunOutcome::Drained => {
                info!("all models exited; leaving run loop");
                Ok(())
            }
            RunOutcome::External => {
                info!("external shutdown signal received");
                self.force_flush().await;
                self.broadcast_shutdown("external signal").await;
                Ok(())
            }
            RunOutcome::ShutdownFrame(reason) => {
                info!(reason = %reason, "shutdown frame received from controller");
                self.force_flush().await;
                self.broadcast_shutdown(&reason).await;
                Ok(())
            }
            RunOutcome::EndTime => {
                info!(bus_time = self.clock.time(), "configured end time reached");
                self.broadcast_shutdown("end time reached").await;
                Ok(())
            }
            RunOutcome::Fatal(err) => Err(err),
        };

        let _ = self.endpoint.close().await;
        info!("exit run loop");
        info!(
            cycles = self.cycles,
            bus_time = self.clock.time(),
            bus_step_size = self.clock.step_size(),
            "bus run summary"
        );
        result.map(|()| BusSummary {
            cycles: self.cycles,
            bus_time: self.clock.time(),
        })
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<HandleOutcome, BusError> {
        match frame {
            Frame::ModelRegister {
                channel,
                model_uid,
                model_name,
                step_size,
                token,
            } => {
                self.handle_register(channel, model_uid, model_name, step_size, token)
                    .await?;
                Ok(HandleOutcome::Continue)
            }
            Frame::SignalIndex {
                channel,
                model_uid,
                token,
                lookups,
            } => {
                self.handle_signal_index(channel, model_uid, token, lookups)
                    .await?;
                Ok(HandleOutcome::Continue)
            }
            Frame::ModelReady {
                model_uid,
                model_time,
                writes,
            } => self.handle_ready(model_uid, model_time, writes).await,
            Frame::ModelExit { model_uid } => {
                info!(model_uid, "ModelExit <--");
                if self.drop_session(model_uid, "model exit").await?.is_some() {
                    // End-time can only trip on a resolve, which drop_session
                    // performs; surface it.
                    return Ok(HandleOutcome::EndTime);
                }
                Ok(HandleOutcome::Continue)
            }
            Frame::Shutdown { reason } => Ok(HandleOutcome::Shutdown(reason)),
            other => {
                warn!(kind = other.kind(), "unexpected frame on bus endpoint dropped");
                Ok(HandleOutcome::Continue)
            }
        }
    }

    async fn handle_register(
        &mut self,
        channel_name: String,
        model_uid: u32,
        model_name: String,
        step_size: f64,
        token: u32,
    ) -> Result<(), BusError> {
        info!(
            channel = %channel_name,
            model_uid,
            model_name = %model_name,
            step_size,
            token,
            "ModelRegister <-- [{channel_name}]"
        );
        if !self.channels.contains_key(&channel_name) {
            return Err(BusError::UnknownChannel {
                model_uid,
                channel: channel_name,
            });
        }

        let handle = self.sessions.admit(SessionDescriptor {
            name: model_name,
            uid: model_uid,
            step_size,
        });
        self.sessions.subscribe(model_uid, &channel_name)?;
        if self.sessions.state(model_uid) == Some(SessionState::Connecting) {
            self.sessions.transition(model_uid, SessionState::Ready)?;
            if let Some(metrics) = &self.metrics {
                metrics.observe_admission();
            }
        }
        if let Some(channel) = self.channels.get_mut(&channel_name) {
            channel.register_model(model_uid);
        }
        self.endpoint.register_notify_peer(model_uid);

        if token != 0 {
            info!(
                channel = %channel_name,
                model_uid,
                token,
                "ModelRegister ACK --> [{channel_name}]"
            );
            self.endpoint
                .send(
                    Destination::Model(model_uid),
                    Frame::ModelRegisterAck {
                        channel: channel_name,
                        model_uid,
                        token,
                    },
                )
                .await?;
        }
        debug!(admission = handle.admission, model_uid, "registration processed");
        Ok(())
    }

    async fn handle_signal_index(
        &mut self,
        channel_name: String,
        model_uid: u32,
        token: u32,
        lookups: Vec<SignalLookup>,
    ) -> Result<(), BusError> {
        if !self.sessions.accepts_frames(model_uid) {
            return Ok(());
        }
        info!(channel = %channel_name, model_uid, "SignalIndex <--> [{channel_name}]");
        let channel = self
            .channels
            .get_mut(&channel_name)
            .ok_or_else(|| BusError::UnknownChannel {
                model_uid,
                channel: channel_name.clone(),
            })?;

        let mut resolved = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            // Undeclared names resolve on demand as scalars; declared names
            // keep their configured kind.
            let kind = channel
                .signals()
                .get_by_name(&lookup.name)
                .map(|value| value.kind())
                .unwrap_or(SignalKind::Scalar);
            let uid = channel.ensure_signal(&lookup.name, kind, &mut self.registry)?;
            info!(channel = %channel_name, "SignalLookup: {} [UID={uid}]", lookup.name);
            resolved.push(SignalLookup {
                name: lookup.name,
                uid,
            });
        }

        self.endpoint
            .send(
                Destination::Model(model_uid),
                Frame::SignalIndexAck {
                    channel: channel_name,
                    model_uid,
                    token,
                    lookups: resolved,
                },
            )
            .await?;
        Ok(())
    }

    async fn handle_ready(
        &mut self,
        model_uid: u32,
        model_time: f64,
        writes: Vec<ChannelWrites>,
    ) -> Result<HandleOutcome, BusError> {
        if !self.sessions.accepts_frames(model_uid) {
            return Ok(HandleOutcome::Continue);
        }
        let Some(session) = self.sessions.get(model_uid) else {
            return Ok(HandleOutcome::Continue);
        };
        self.sequence += 1;
        let sequence = self.sequence;
        if self.quorum_started.is_none() {
            self.quorum_started = Some(Instant::now());
        }
        info!(model_uid, sequence, "Notify/ModelReady <-- model_time={model_time:.6}");

        if let Err(err) = self.sessions.transition(model_uid, SessionState::Stepping) {
            warn!(model_uid, error = %err, "ready before registration completed");
        }

        let mut write_count = 0usize;
        for channel_writes in &writes {
            let channel = self.channels.get_mut(&channel_writes.channel).ok_or_else(|| {
                BusError::UnknownChannel {
                    model_uid,
                    channel: channel_writes.channel.clone(),
                }
            })?;
            channel.apply_writes(model_uid, session.admission, sequence, channel_writes)?;
            channel.mark_ready(model_uid);
            write_count += channel_writes.scalars.len() + channel_writes.binaries.len();
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_writes(write_count);
        }

        if self.maybe_resolve().await? && self.end_time_reached() {
            return Ok(HandleOutcome::EndTime);
        }
        Ok(HandleOutcome::Continue)
    }

    fn end_time_reached(&self) -> bool {
        match self.options.end_time {
            // Half-step tolerance keeps the comparison off the float edge.
            Some(end_time) => self.clock.time() >= end_time - self.clock.step_size() * 0.5,
            None => false,
        }
    }

    /// Remove a session from every channel's accounting and re-evaluate
    /// quorum, since the remaining sessions may now close the cycle.
    ///
    /// Returns a run outcome when the removal cascaded into the end of the
    /// run (end time reached on the resolve that followed).
    async fn drop_session(
        &mut self,
        model_uid: u32,
        reason: &str,
    ) -> Result<Option<RunOutcome>, BusError> {
        let Some(session) = self.sessions.remove(model_uid) else {
            warn!(model_uid, reason, "drop requested for unknown session");
            return Ok(None);
        };
        warn!(
            model_uid,
            model_name = %session.name,
            reason,
            cycle_time = self.clock.time(),
            "session removed from expected-count accounting"
        );
        for channel_name in &session.channels {
            if let Some(channel) = self.channels.get_mut(channel_name) {
                channel.remove_model(model_uid);
                channel.drop_staged_for(session.admission);
            }
        }
        if self.has_models() && self.maybe_resolve().await? && self.end_time_reached() {
            return Ok(Some(RunOutcome::EndTime));
        }
        Ok(None)
    }

    /// Resolve the bus when every channel has reached quorum.
    async fn maybe_resolve(&mut self) -> Result<bool, BusError> {
        if !self.network_ready() || !self.has_models() {
            return Ok(false);
        }
        if !self.channels.values().all(BusChannel::models_ready) {
            return Ok(false);
        }
        self.resolve_and_notify().await?;
        Ok(true)
    }

    /// Merge every channel and broadcast the released step.
    async fn resolve_and_notify(&mut self) -> Result<(), BusError> {
        let model_time = self.clock.advance();
        let schedule_time = self.clock.schedule_time();
        info!("Notify/ModelStart --> model_time={model_time:.6} schedule_time={schedule_time:.6}");

        let mut merged_channels = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values_mut() {
            info!("SignalVector --> [{}]", channel.name());
            merged_channels.push(channel.merge());
        }

        self.endpoint
            .send(
                Destination::Broadcast,
                Frame::ModelStart {
                    model_time,
                    schedule_time,
                    channels: merged_channels,
                },
            )
            .await?;

        for channel in self.channels.values_mut() {
            channel.mark_broadcast();
            channel.finish_cycle();
        }
        for handle in self.sessions.handles() {
            if self.sessions.state(handle.uid) == Some(SessionState::Stepping) {
                self.sessions.transition(handle.uid, SessionState::Ready)?;
            }
        }

        self.cycles += 1;
        if let Some(metrics) = &self.metrics {
            metrics.observe_cycle();
            if let Some(started) = self.quorum_started.take() {
                metrics.observe_quorum_wait(started.elapsed());
            }
        }
        self.quorum_started = None;
        Ok(())
    }

    /// Flush channels stuck in `AwaitingQuorum` at shutdown with whatever
    /// partial data is present; failures are logged and shutdown continues.
    async fn force_flush(&mut self) {
        let pending: Vec<String> = self
            .channels
            .values()
            .filter(|channel| channel.has_pending_writes())
            .map(|channel| channel.name().to_owned())
            .collect();
        if pending.is_empty() {
            return;
        }
        for name in &pending {
            warn!(channel = %name, "force-flushing partial cycle at shutdown");
        }
        if let Err(err) = self.resolve_and_notify().await {
            warn!(error = %err, "force flush failed");
        }
    }

    async fn broadcast_shutdown(&mut self, reason: &str) {
        let frame = Frame::Shutdown {
            reason: reason.to_owned(),
        };
        if let Err(err) = self.endpoint.send(Destination::Broadcast, frame).await {
            warn!(error = %err, "shutdown broadcast failed");
        }
    }
}
