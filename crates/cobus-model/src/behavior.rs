//! ---
//! cobus_section: "06-model-runtime"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Model-side runtime and built-in behaviors."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::time::Duration;

use cobus_common::config::{ConfigError, ModelTopology, SignalKind};
use cobus_signal::{SignalError, SignalStore};
use cobus_transport::TransportError;
use indexmap::IndexMap;
use tracing::info;

/// Errors raised by the model runtime and behaviors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Descriptor-derived configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Signal registry failure.
    #[error(transparent)]
    Signal(#[from] SignalError),
    /// The bus did not answer a handshake request in time.
    #[error("TimeoutError: bus did not answer within {0:?}")]
    HandshakeTimeout(Duration),
    /// The bus connection dropped mid-run.
    #[error("TransportError: bus connection lost")]
    BusConnectionLost,
    /// No model descriptor selects a known behavior.
    #[error("ConfigError: unknown model behavior '{0}'")]
    UnknownBehavior(String),
    /// A behavior referenced a signal the vectors do not carry.
    #[error("ProtocolError: signal '{signal}' not present on channel '{channel}'")]
    UnknownSignal {
        /// Channel that was addressed.
        channel: String,
        /// Missing signal name.
        signal: String,
    },
    /// A behavior referenced a channel the model is not subscribed to.
    #[error("ProtocolError: model is not subscribed to channel '{0}'")]
    UnknownChannel(String),
}

/// Model-local view of one subscribed channel.
#[derive(Debug)]
pub struct ChannelVector {
    /// Instance-local alias of the channel.
    pub alias: String,
    store: SignalStore,
}

impl ChannelVector {
    fn new(alias: String) -> Self {
        Self {
            alias,
            store: SignalStore::new(),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    /// Mutable access to the underlying store.
    pub fn store_mut(&mut self) -> &mut SignalStore {
        &mut self.store
    }

    /// Current value of a scalar signal.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.store.get_by_name(name).map(|value| value.value())
    }

    /// Write a scalar signal.
    pub fn write_scalar(&mut self, name: &str, value: f64) -> bool {
        match self.store.iter_mut().find(|slot| slot.name() == name) {
            Some(slot) => {
                slot.write(value);
                true
            }
            None => false,
        }
    }

    /// Borrow the accumulated binary buffer of a signal.
    pub fn binary(&self, name: &str) -> Option<&[u8]> {
        self.store.get_by_name(name).map(|value| value.bin())
    }

    /// Take the binary buffer of a signal, marking it consumed.
    pub fn consume_binary(&mut self, name: &str) -> Option<Vec<u8>> {
        self.store
            .iter_mut()
            .find(|slot| slot.name() == name)
            .map(|slot| slot.take_bin())
    }

    /// Append outgoing binary payload bytes to a signal.
    pub fn append_binary(&mut self, name: &str, data: &[u8]) -> bool {
        match self.store.iter_mut().find(|slot| slot.name() == name) {
            Some(slot) => {
                slot.append(data);
                true
            }
            None => false,
        }
    }

    /// First declared signal of the given kind, if any.
    pub fn first_of_kind(&self, kind: SignalKind) -> Option<String> {
        self.store
            .iter()
            .find(|value| value.kind() == kind)
            .map(|value| value.name().to_owned())
    }
}

/// All channel vectors of one model instance, keyed by bus channel name.
#[derive(Debug, Default)]
pub struct ModelVectors {
    channels: IndexMap<String, ChannelVector>,
}

impl ModelVectors {
    /// Build empty vectors for the instance's subscriptions.
    pub fn from_topology(topology: &ModelTopology) -> Self {
        let mut channels = IndexMap::new();
        for (name, channel) in &topology.channels {
            channels.insert(name.clone(), ChannelVector::new(channel.alias.clone()));
        }
        Self { channels }
    }

    /// Borrow one channel vector.
    pub fn channel(&self, name: &str) -> Result<&ChannelVector, ModelError> {
        self.channels
            .get(name)
            .ok_or_else(|| ModelError::UnknownChannel(name.to_owned()))
    }

    /// Mutably borrow one channel vector.
    pub fn channel_mut(&mut self, name: &str) -> Result<&mut ChannelVector, ModelError> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownChannel(name.to_owned()))
    }

    /// Iterate channel vectors in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChannelVector)> {
        self.channels.iter()
    }

    /// Iterate channel vectors mutably in subscription order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ChannelVector)> {
        self.channels.iter_mut()
    }
}

/// One model's per-step computation over its signal vectors.
pub trait ModelBehavior: Send + std::fmt::Debug {
    /// Advance the model from `model_time` to `stop_time`.
    fn step(
        &mut self,
        vectors: &mut ModelVectors,
        model_time: f64,
        stop_time: f64,
    ) -> Result<(), ModelError>;
}

/// Scalar test behavior: increments one counter signal every step.
#[derive(Debug)]
pub struct CounterModel {
    channel: String,
    signal: String,
}

impl CounterModel {
    /// Bind the counter to the instance's first scalar signal.
    pub fn from_topology(topology: &ModelTopology) -> Result<Self, ModelError> {
        for (channel_name, channel) in &topology.channels {
            if let Some((signal, _)) = channel
                .signals
                .iter()
                .find(|(_, kind)| **kind == SignalKind::Scalar)
            {
                return Ok(Self {
                    channel: channel_name.clone(),
                    signal: signal.clone(),
                });
            }
        }
        Err(ModelError::UnknownBehavior(
            "counter requires a scalar signal".to_owned(),
        ))
    }
}

impl ModelBehavior for CounterModel {
    fn step(
        &mut self,
        vectors: &mut ModelVectors,
        _model_time: f64,
        _stop_time: f64,
    ) -> Result<(), ModelError> {
        let vector = vectors.channel_mut(&self.channel)?;
        let current = vector
            .scalar(&self.signal)
            .ok_or_else(|| ModelError::UnknownSignal {
                channel: self.channel.clone(),
                signal: self.signal.clone(),
            })?;
        vector.write_scalar(&self.signal, current + 1.0);
        Ok(())
    }
}

/// Binary test behavior: prints what it received and emits a fixed sequence
/// of null-terminated payloads, one per step.
#[derive(Debug)]
pub struct BinarySequenceModel {
    channel: String,
    signal: String,
    index: usize,
}

impl BinarySequenceModel {
    const MESSAGES: [&'static str; 4] = ["one", "two", "three", "four"];

    /// Bind the sequence to the instance's first binary signal.
    pub fn from_topology(topology: &ModelTopology) -> Result<Self, ModelError> {
        for (channel_name, channel) in &topology.channels {
            if let Some((signal, _)) = channel
                .signals
                .iter()
                .find(|(_, kind)| **kind == SignalKind::Binary)
            {
                return Ok(Self {
                    channel: channel_name.clone(),
                    signal: signal.clone(),
                    index: 0,
                });
            }
        }
        Err(ModelError::UnknownBehavior(
            "binary-sequence requires a binary signal".to_owned(),
        ))
    }
}

impl ModelBehavior for BinarySequenceModel {
    fn step(
        &mut self,
        vectors: &mut ModelVectors,
        _model_time: f64,
        _stop_time: f64,
    ) -> Result<(), ModelError> {
        let vector = vectors.channel_mut(&self.channel)?;

        if let Some(data) = vector.consume_binary(&self.signal) {
            if !data.is_empty() {
                // Embedded terminators become spaces so the combined buffer
                // prints as one line; the final terminator is dropped.
                let mut text = data[..data.len().saturating_sub(1)].to_vec();
                for byte in &mut text {
                    if *byte == 0 {
                        *byte = b' ';
                    }
                }
                info!(
                    "RECV: {} (buffer size={})",
                    String::from_utf8_lossy(&text),
                    data.len()
                );
            }
        }

        if self.index < Self::MESSAGES.len() {
            let mut payload = Self::MESSAGES[self.index].as_bytes().to_vec();
            payload.push(0);
            if !vector.append_binary(&self.signal, &payload) {
                return Err(ModelError::UnknownSignal {
                    channel: self.channel.clone(),
                    signal: self.signal.clone(),
                });
            }
            self.index += 1;
        }
        Ok(())
    }
}

/// Instantiate a built-in behavior by its descriptor name.
pub fn behavior_for(
    name: &str,
    topology: &ModelTopology,
) -> Result<Box<dyn ModelBehavior>, ModelError> {
    match name {
        "counter" => Ok(Box::new(CounterModel::from_topology(topology)?)),
        "binary-sequence" => Ok(Box::new(BinarySequenceModel::from_topology(topology)?)),
        other => Err(ModelError::UnknownBehavior(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobus_common::config::{ModelChannel, ModelTopology};
    use cobus_common::stable_hash32;

    fn topology() -> ModelTopology {
        let mut signals = IndexMap::new();
        signals.insert("raw".to_owned(), SignalKind::Binary);
        signals.insert("counter".to_owned(), SignalKind::Scalar);
        let mut channels = IndexMap::new();
        channels.insert(
            "binary_channel".to_owned(),
            ModelChannel {
                alias: "raw_channel".to_owned(),
                signals,
            },
        );
        ModelTopology {
            name: "m".to_owned(),
            uid: 42,
            behavior: None,
            channels,
        }
    }

    fn vectors() -> ModelVectors {
        let topology = topology();
        let mut vectors = ModelVectors::from_topology(&topology);
        {
            let vector = vectors.channel_mut("binary_channel").expect("channel");
            for (name, kind) in &topology.channels["binary_channel"].signals {
                vector.store_mut().ensure(name, stable_hash32(name), *kind);
            }
        }
        vectors
    }

    #[test]
    fn counter_increments_from_broadcast_value() {
        let topology = topology();
        let mut behavior = CounterModel::from_topology(&topology).expect("behavior");
        let mut vectors = vectors();
        behavior.step(&mut vectors, 0.0, 0.005).expect("step");
        let vector = vectors.channel("binary_channel").expect("channel");
        let slot = vector.store().get_by_name("counter").expect("slot");
        assert_eq!(slot.pending(), 1.0);
    }

    #[test]
    fn binary_sequence_emits_and_consumes() {
        let topology = topology();
        let mut behavior = BinarySequenceModel::from_topology(&topology).expect("behavior");
        let mut vectors = vectors();

        behavior.step(&mut vectors, 0.0, 0.005).expect("step");
        {
            let vector = vectors.channel("binary_channel").expect("channel");
            assert_eq!(vector.binary("raw"), Some(&b"one\0"[..]));
        }

        // Simulate the bus echoing the combined buffer back.
        {
            let vector = vectors.channel_mut("binary_channel").expect("channel");
            vector.consume_binary("raw");
            vector.append_binary("raw", b"one\0one\0");
        }
        behavior.step(&mut vectors, 0.005, 0.010).expect("step");
        let vector = vectors.channel("binary_channel").expect("channel");
        assert_eq!(vector.binary("raw"), Some(&b"two\0"[..]));
    }

    #[test]
    fn unknown_behavior_name_is_rejected() {
        let topology = topology();
        let err = behavior_for("warp-drive", &topology).expect_err("must fail");
        assert!(matches!(err, ModelError::UnknownBehavior(_)));
    }
}
