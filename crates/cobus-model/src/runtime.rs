//! ---
//! cobus_section: "06-model-runtime"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Model-side runtime and built-in behaviors."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use cobus_common::config::{BusOptions, ModelTopology, SignalKind};
use cobus_transport::{
    ChannelWrites, Destination, Endpoint, Frame, Incoming, ScalarWrite, SignalLookup,
    TransportError,
};
use tracing::{debug, info, warn};

use crate::behavior::{ModelBehavior, ModelError, ModelVectors};

/// Final accounting of one model run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSummary {
    /// Number of completed steps.
    pub steps: u64,
    /// Model time when the run ended.
    pub model_time: f64,
}

/// Model-side runtime: handshake, signal resolution, step loop.
pub struct ModelRuntime {
    endpoint: Box<dyn Endpoint>,
    options: BusOptions,
    topology: ModelTopology,
    vectors: ModelVectors,
    behavior: Box<dyn ModelBehavior>,
    token_counter: u32,
}

impl ModelRuntime {
    /// Assemble a runtime from its endpoint, topology and behavior.
    pub fn new(
        endpoint: Box<dyn Endpoint>,
        topology: ModelTopology,
        options: BusOptions,
        behavior: Box<dyn ModelBehavior>,
    ) -> Self {
        let vectors = ModelVectors::from_topology(&topology);
        Self {
            endpoint,
            options,
            topology,
            vectors,
            behavior,
            token_counter: 0,
        }
    }

    fn next_token(&mut self) -> u32 {
        self.token_counter += 1;
        self.token_counter
    }

    /// Connect, register, resolve signals, and run the step loop to the end
    /// time (or until the bus shuts the run down).
    pub async fn run(mut self) -> Result<ModelSummary, ModelError> {
        self.endpoint.start().await?;
        info!(
            transport = self.endpoint.name(),
            model_uid = self.topology.uid,
            model_name = %self.topology.name,
            "model endpoint started"
        );

        self.register_all().await?;
        self.resolve_signals().await?;

        let mut steps: u64 = 0;
        let mut model_time = 0.0f64;
        let mut stop_time = 0.0f64;
        let summary = loop {
            if let Some(end_time) = self.options.end_time {
                if model_time >= end_time - self.options.step_size * 0.5 {
                    info!(model_time, end_time, "end time reached; leaving step loop");
                    self.send_exit().await;
                    break ModelSummary { steps, model_time };
                }
            }

            self.behavior.step(&mut self.vectors, model_time, stop_time)?;
            steps += 1;
            self.send_ready(model_time).await?;

            match self.await_start().await? {
                StepRelease::Start {
                    model_time: released,
                    schedule_time,
                } => {
                    model_time = released;
                    stop_time = schedule_time;
                }
                StepRelease::Shutdown(reason) => {
                    info!(reason = %reason, "bus requested shutdown");
                    break ModelSummary { steps, model_time };
                }
            }
        };

        let _ = self.endpoint.close().await;
        info!(
            steps = summary.steps,
            model_time = summary.model_time,
            "model run summary"
        );
        Ok(summary)
    }

    /// Register on every subscribed channel and wait for each ack.
    async fn register_all(&mut self) -> Result<(), ModelError> {
        let channels: Vec<String> = self.topology.channels.keys().cloned().collect();
        for channel in channels {
            let token = self.next_token();
            info!(
                channel = %channel,
                model_uid = self.topology.uid,
                token,
                "ModelRegister --> [{channel}]"
            );
            self.endpoint
                .send(
                    Destination::Bus,
                    Frame::ModelRegister {
                        channel: channel.clone(),
                        model_uid: self.topology.uid,
                        model_name: self.topology.name.clone(),
                        step_size: self.options.step_size,
                        token,
                    },
                )
                .await?;
            self.await_ack(token, &channel).await?;
        }
        Ok(())
    }

    async fn await_ack(&mut self, token: u32, channel: &str) -> Result<(), ModelError> {
        loop {
            match self.endpoint.recv(self.options.timeout).await {
                Ok(Incoming::Frame(Frame::ModelRegisterAck {
                    token: acked,
                    channel: acked_channel,
                    ..
                })) if acked == token && acked_channel == channel => {
                    debug!(channel = %channel, token, "registration acknowledged");
                    return Ok(());
                }
                Ok(Incoming::Frame(Frame::Shutdown { reason })) => {
                    warn!(reason = %reason, "bus shut down during handshake");
                    return Err(ModelError::BusConnectionLost);
                }
                Ok(Incoming::Frame(other)) => {
                    debug!(kind = other.kind(), "unexpected frame during handshake dropped");
                }
                Ok(Incoming::PeerClosed { .. }) => return Err(ModelError::BusConnectionLost),
                Err(TransportError::Timeout(waited)) => {
                    return Err(ModelError::HandshakeTimeout(waited))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Resolve every declared signal name to its uid via the bus.
    async fn resolve_signals(&mut self) -> Result<(), ModelError> {
        let channels: Vec<String> = self.topology.channels.keys().cloned().collect();
        for channel_name in channels {
            let declared = self.topology.channels[&channel_name].signals.clone();
            if declared.is_empty() {
                continue;
            }
            let token = self.next_token();
            let lookups = declared
                .keys()
                .map(|name| SignalLookup {
                    name: name.clone(),
                    uid: 0,
                })
                .collect();
            info!(channel = %channel_name, token, "SignalIndex --> [{channel_name}]");
            self.endpoint
                .send(
                    Destination::Bus,
                    Frame::SignalIndex {
                        channel: channel_name.clone(),
                        model_uid: self.topology.uid,
                        token,
                        lookups,
                    },
                )
                .await?;

            let resolved = self.await_index_ack(token, &channel_name).await?;
            let vector = self.vectors.channel_mut(&channel_name)?;
            for lookup in resolved {
                let kind = declared
                    .get(&lookup.name)
                    .copied()
                    .unwrap_or(SignalKind::Scalar);
                vector.store_mut().ensure(&lookup.name, lookup.uid, kind);
                info!(channel = %channel_name, "SignalLookup: {} [UID={}]", lookup.name, lookup.uid);
            }
        }
        Ok(())
    }

    async fn await_index_ack(
        &mut self,
        token: u32,
        channel: &str,
    ) -> Result<Vec<SignalLookup>, ModelError> {
        loop {
            match self.endpoint.recv(self.options.timeout).await {
                Ok(Incoming::Frame(Frame::SignalIndexAck {
                    token: acked,
                    channel: acked_channel,
                    lookups,
                    ..
                })) if acked == token && acked_channel == channel => return Ok(lookups),
                Ok(Incoming::Frame(Frame::Shutdown { reason })) => {
                    warn!(reason = %reason, "bus shut down during signal resolution");
                    return Err(ModelError::BusConnectionLost);
                }
                Ok(Incoming::Frame(other)) => {
                    debug!(kind = other.kind(), "unexpected frame during signal resolution dropped");
                }
                Ok(Incoming::PeerClosed { .. }) => return Err(ModelError::BusConnectionLost),
                Err(TransportError::Timeout(waited)) => {
                    return Err(ModelError::HandshakeTimeout(waited))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Collect the cycle's writes and submit them.
    ///
    /// Every subscribed channel gets an entry, even when empty: the empty
    /// entry is what marks the session ready on that channel.
    async fn send_ready(&mut self, model_time: f64) -> Result<(), ModelError> {
        let mut writes = Vec::new();
        for (channel_name, vector) in self.vectors.iter_mut() {
            let mut channel_writes = ChannelWrites::new(channel_name.clone());
            for slot in vector.store_mut().iter_mut() {
                match slot.kind() {
                    SignalKind::Scalar => {
                        if slot.changed() {
                            channel_writes.scalars.push(ScalarWrite {
                                uid: slot.uid(),
                                value: slot.pending(),
                            });
                        }
                    }
                    SignalKind::Binary => {
                        let data = slot.take_bin();
                        if !data.is_empty() {
                            channel_writes
                                .binaries
                                .push(cobus_transport::BinaryWrite {
                                    uid: slot.uid(),
                                    data,
                                });
                        }
                    }
                }
            }
            vector.store_mut().resolve_all();
            writes.push(channel_writes);
        }

        info!(
            model_uid = self.topology.uid,
            "Notify/ModelReady --> model_time={model_time:.6}"
        );
        self.endpoint
            .send(
                Destination::Bus,
                Frame::ModelReady {
                    model_uid: self.topology.uid,
                    model_time,
                    writes,
                },
            )
            .await?;
        Ok(())
    }

    /// Wait for the merged broadcast releasing the next step.
    async fn await_start(&mut self) -> Result<StepRelease, ModelError> {
        loop {
            match self.endpoint.recv(self.options.timeout).await {
                Ok(Incoming::Frame(Frame::ModelStart {
                    model_time,
                    schedule_time,
                    channels,
                })) => {
                    info!(
                        model_uid = self.topology.uid,
                        "Notify/ModelStart <-- model_time={model_time:.6} schedule_time={schedule_time:.6}"
                    );
                    self.apply_broadcast(channels);
                    return Ok(StepRelease::Start {
                        model_time,
                        schedule_time,
                    });
                }
                Ok(Incoming::Frame(Frame::Shutdown { reason })) => {
                    return Ok(StepRelease::Shutdown(reason))
                }
                Ok(Incoming::Frame(other)) => {
                    debug!(kind = other.kind(), "unexpected frame in step loop dropped");
                }
                Ok(Incoming::PeerClosed { .. }) => return Err(ModelError::BusConnectionLost),
                Err(TransportError::Timeout(waited)) => {
                    return Err(ModelError::HandshakeTimeout(waited))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Apply the merged channel state to the local vectors.
    fn apply_broadcast(&mut self, channels: Vec<ChannelWrites>) {
        for channel_writes in channels {
            let Ok(vector) = self.vectors.channel_mut(&channel_writes.channel) else {
                // Broadcasts carry every bus channel; unsubscribed ones are
                // not an error for this model.
                continue;
            };
            for scalar in &channel_writes.scalars {
                if let Some(slot) = vector.store_mut().get_mut(scalar.uid) {
                    slot.set_value(scalar.value);
                    info!(
                        "SignalValue: {} = {:.6} [name={}]",
                        scalar.uid,
                        scalar.value,
                        slot.name()
                    );
                } else {
                    warn!(uid = scalar.uid, "broadcast scalar for unknown uid dropped");
                }
            }
            for binary in &channel_writes.binaries {
                if let Some(slot) = vector.store_mut().get_mut(binary.uid) {
                    slot.set_bin(binary.data.clone());
                    debug!(
                        uid = binary.uid,
                        len = binary.data.len(),
                        "binary broadcast applied"
                    );
                } else {
                    warn!(uid = binary.uid, "broadcast binary for unknown uid dropped");
                }
            }
        }
    }

    async fn send_exit(&mut self) {
        info!(model_uid = self.topology.uid, "ModelExit -->");
        if let Err(err) = self
            .endpoint
            .send(
                Destination::Bus,
                Frame::ModelExit {
                    model_uid: self.topology.uid,
                },
            )
            .await
        {
            warn!(error = %err, "exit notification failed");
        }
    }
}

enum StepRelease {
    Start { model_time: f64, schedule_time: f64 },
    Shutdown(String),
}
