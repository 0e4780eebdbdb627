//! ---
//! cobus_section: "01-core-functionality"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Shared primitives and utilities for the bus runtime."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hash::stable_hash32;

/// Default bus step size in seconds.
pub const DEFAULT_STEP_SIZE: f64 = 0.005;
/// Reserved instance uid used by the bus endpoint itself.
pub const BUS_MODEL_UID: u32 = 8_000_008;
/// Default wait-message timeout for a bus instance, in seconds.
pub const DEFAULT_BUS_TIMEOUT_SECS: f64 = 1.0;
/// Default wait-message timeout for a model instance, in seconds.
pub const DEFAULT_MODEL_TIMEOUT_SECS: f64 = 60.0;
/// Default transport URI when none is configured.
pub const DEFAULT_URI: &str = "redis://localhost:6379";
/// Channel used when a stack carries no channel configuration at all.
pub const FALLBACK_CHANNEL: &str = "test";

/// Errors raised while loading or deriving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A descriptor file could not be read.
    #[error("ConfigError: failed to read descriptor {path}: {source}")]
    Io {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A descriptor document could not be parsed.
    #[error("ConfigError: invalid descriptor document in {path}: {source}")]
    Yaml {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
    /// No `Stack` descriptor was present in any supplied file.
    #[error("ConfigError: no Stack descriptor found in supplied files")]
    MissingStack,
    /// The named instance is absent from every loaded stack.
    #[error("ConfigError: instance '{0}' not found in any Stack descriptor")]
    UnknownInstance(String),
    /// A bus channel was declared twice with conflicting expected counts.
    #[error(
        "ConfigError: channel '{channel}' declared with conflicting expectedModelCount ({first} vs {second})"
    )]
    ExpectedCountMismatch {
        /// Channel name.
        channel: String,
        /// First declared count.
        first: u32,
        /// Conflicting declared count.
        second: u32,
    },
    /// A bus channel is missing a usable expected count.
    #[error("ConfigError: channel '{0}' requires expectedModelCount >= 1")]
    MissingExpectedCount(String),
}

/// Value kind carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Fixed-width numeric value (f64 on the wire).
    #[default]
    Scalar,
    /// Variable-length binary payload.
    Binary,
}

/// Top-level descriptor document, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Descriptor {
    /// Simulation topology: instances and their channel bindings.
    Stack(StackDescriptor),
    /// Named signals belonging to one channel.
    SignalGroup(SignalGroupDescriptor),
    /// Runtime description of one model (behavior selection).
    Model(ModelDescriptor),
}

/// Common descriptor metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Descriptor name.
    pub name: String,
}

/// `kind: Stack` descriptor payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDescriptor {
    /// Descriptor metadata.
    pub metadata: Metadata,
    /// Stack contents.
    pub spec: StackSpec,
}

/// Stack body: the participating instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    /// Model instances, including the bus instance itself.
    pub models: Vec<InstanceSpec>,
}

/// One instance entry within a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Instance name (matched against `--name`).
    pub name: String,
    /// Stable instance uid; derived from the name when omitted.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Model descriptor name selecting the runtime behavior (models only).
    #[serde(default)]
    pub model: Option<String>,
    /// Channel bindings for this instance.
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,
}

/// Channel binding of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Bus-wide channel name.
    pub name: String,
    /// Instance-local alias for the channel.
    #[serde(default)]
    pub alias: Option<String>,
    /// Number of models expected on this channel (bus instance entries only).
    #[serde(default, rename = "expectedModelCount")]
    pub expected_model_count: Option<u32>,
}

/// `kind: SignalGroup` descriptor payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalGroupDescriptor {
    /// Descriptor metadata.
    pub metadata: Metadata,
    /// Signal group contents.
    pub spec: SignalGroupSpec,
}

/// Signal group body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalGroupSpec {
    /// Channel the signals belong to.
    pub channel: String,
    /// Signals within the channel.
    pub signals: Vec<SignalSpec>,
}

/// One named signal within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Signal name (identifier source).
    pub name: String,
    /// Value kind; scalar when omitted.
    #[serde(default)]
    pub kind: SignalKind,
}

/// `kind: Model` descriptor payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Descriptor metadata.
    pub metadata: Metadata,
    /// Model contents.
    pub spec: ModelSpec,
}

/// Model body: the behavior the runner should instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Built-in behavior name (e.g. `counter`, `binary-sequence`).
    pub behavior: String,
    /// Optional model-local step size override.
    #[serde(default)]
    pub step_size: Option<f64>,
}

/// All descriptors loaded from the files handed to a daemon.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    /// Loaded stack descriptors.
    pub stacks: Vec<StackDescriptor>,
    /// Loaded signal group descriptors.
    pub signal_groups: Vec<SignalGroupDescriptor>,
    /// Loaded model descriptors.
    pub models: Vec<ModelDescriptor>,
}

impl DescriptorSet {
    /// Load every document from the supplied descriptor files.
    ///
    /// Files may contain multiple YAML documents; unknown kinds are rejected
    /// by the `kind` tag.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for path in paths {
            let path = path.as_ref();
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            for document in serde_yaml::Deserializer::from_str(&text) {
                let descriptor =
                    Descriptor::deserialize(document).map_err(|source| ConfigError::Yaml {
                        path: path.to_path_buf(),
                        source,
                    })?;
                match descriptor {
                    Descriptor::Stack(stack) => set.stacks.push(stack),
                    Descriptor::SignalGroup(group) => set.signal_groups.push(group),
                    Descriptor::Model(model) => set.models.push(model),
                }
            }
            debug!(path = %path.display(), "descriptor file loaded");
        }
        Ok(set)
    }

    /// Signals declared for the named channel, in declaration order.
    pub fn signals_for_channel(&self, channel: &str) -> IndexMap<String, SignalKind> {
        let mut signals = IndexMap::new();
        for group in &self.signal_groups {
            if group.spec.channel != channel {
                continue;
            }
            for signal in &group.spec.signals {
                signals.insert(signal.name.clone(), signal.kind);
            }
        }
        signals
    }

    fn instance(&self, name: &str) -> Result<&InstanceSpec, ConfigError> {
        if self.stacks.is_empty() {
            return Err(ConfigError::MissingStack);
        }
        self.stacks
            .iter()
            .flat_map(|stack| stack.spec.models.iter())
            .find(|instance| instance.name == name)
            .ok_or_else(|| ConfigError::UnknownInstance(name.to_owned()))
    }

    /// Derive the bus-side topology for the named bus instance.
    ///
    /// The step coordinator consumes only this derived form: channel name to
    /// expected model count plus the declared signals per channel.
    pub fn bus_topology(&self, instance: &str) -> Result<BusTopology, ConfigError> {
        let entry = self.instance(instance)?;
        let mut channels: IndexMap<String, ChannelTopology> = IndexMap::new();
        for binding in &entry.channels {
            let expected = binding
                .expected_model_count
                .filter(|count| *count >= 1)
                .ok_or_else(|| ConfigError::MissingExpectedCount(binding.name.clone()))?;
            if let Some(existing) = channels.get(&binding.name) {
                if existing.expected_model_count != expected {
                    return Err(ConfigError::ExpectedCountMismatch {
                        channel: binding.name.clone(),
                        first: existing.expected_model_count,
                        second: expected,
                    });
                }
                continue;
            }
            channels.insert(
                binding.name.clone(),
                ChannelTopology {
                    expected_model_count: expected,
                    signals: self.signals_for_channel(&binding.name),
                },
            );
        }
        Ok(BusTopology { channels })
    }

    /// Derive the model-side topology for the named model instance.
    pub fn model_topology(&self, instance: &str) -> Result<ModelTopology, ConfigError> {
        let entry = self.instance(instance)?;
        let uid = entry.uid.unwrap_or_else(|| stable_hash32(&entry.name));
        let behavior = entry.model.as_ref().and_then(|model_name| {
            self.models
                .iter()
                .find(|model| &model.metadata.name == model_name)
                .map(|model| model.spec.clone())
        });
        let channels = entry
            .channels
            .iter()
            .map(|binding| {
                let alias = binding.alias.clone().unwrap_or_else(|| binding.name.clone());
                (
                    binding.name.clone(),
                    ModelChannel {
                        alias,
                        signals: self.signals_for_channel(&binding.name),
                    },
                )
            })
            .collect();
        Ok(ModelTopology {
            name: entry.name.clone(),
            uid,
            behavior,
            channels,
        })
    }
}

/// Derived bus topology: what the coordinator needs and nothing more.
#[derive(Debug, Clone)]
pub struct BusTopology {
    /// Channels managed by the bus, in declaration order.
    pub channels: IndexMap<String, ChannelTopology>,
}

/// Per-channel derived configuration.
#[derive(Debug, Clone)]
pub struct ChannelTopology {
    /// Number of distinct sessions required to close a cycle.
    pub expected_model_count: u32,
    /// Declared signals and their kinds.
    pub signals: IndexMap<String, SignalKind>,
}

/// Derived model topology for one instance.
#[derive(Debug, Clone)]
pub struct ModelTopology {
    /// Instance name.
    pub name: String,
    /// Stable instance uid.
    pub uid: u32,
    /// Selected runtime behavior, when a model descriptor matched.
    pub behavior: Option<ModelSpec>,
    /// Channel subscriptions keyed by bus channel name.
    pub channels: IndexMap<String, ModelChannel>,
}

/// Model-side view of one subscribed channel.
#[derive(Debug, Clone)]
pub struct ModelChannel {
    /// Instance-local alias.
    pub alias: String,
    /// Declared signals and their kinds.
    pub signals: IndexMap<String, SignalKind>,
}

/// Runtime options shared by the bus and model daemons, assembled from CLI
/// arguments by the binaries.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Instance name used to locate the stack entry.
    pub name: String,
    /// Instance uid announced on the transport.
    pub uid: u32,
    /// Transport family override; the URI scheme decides when absent.
    pub transport: Option<String>,
    /// Transport URI.
    pub uri: String,
    /// Fixed simulation step size in seconds.
    pub step_size: f64,
    /// Optional simulation end time in seconds.
    pub end_time: Option<f64>,
    /// Wait-message timeout.
    pub timeout: Duration,
}

impl BusOptions {
    /// Options preset for a bus instance.
    pub fn bus(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: BUS_MODEL_UID,
            transport: None,
            uri: DEFAULT_URI.to_owned(),
            step_size: DEFAULT_STEP_SIZE,
            end_time: None,
            timeout: Duration::from_secs_f64(DEFAULT_BUS_TIMEOUT_SECS),
        }
    }

    /// Options preset for a model instance.
    pub fn model(name: impl Into<String>) -> Self {
        let name = name.into();
        let uid = stable_hash32(&name);
        Self {
            name,
            uid,
            transport: None,
            uri: DEFAULT_URI.to_owned(),
            step_size: DEFAULT_STEP_SIZE,
            end_time: None,
            timeout: Duration::from_secs_f64(DEFAULT_MODEL_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
kind: Stack
metadata:
  name: default
spec:
  models:
    - name: simbus
      uid: 8000008
      channels:
        - name: binary_channel
          expectedModelCount: 2
    - name: binary_model_instance
      uid: 42
      model: binary-model
      channels:
        - name: binary_channel
          alias: raw_channel
---
kind: SignalGroup
metadata:
  name: binary_channel
spec:
  channel: binary_channel
  signals:
    - name: raw
      kind: binary
---
kind: Model
metadata:
  name: binary-model
spec:
  behavior: binary-sequence
"#;

    fn write_stack() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), STACK).expect("write stack");
        file
    }

    #[test]
    fn multi_document_descriptors_load() {
        let file = write_stack();
        let set = DescriptorSet::load(&[file.path()]).expect("load descriptors");
        assert_eq!(set.stacks.len(), 1);
        assert_eq!(set.signal_groups.len(), 1);
        assert_eq!(set.models.len(), 1);
    }

    #[test]
    fn bus_topology_carries_expected_counts_and_signals() {
        let file = write_stack();
        let set = DescriptorSet::load(&[file.path()]).expect("load descriptors");
        let topology = set.bus_topology("simbus").expect("bus topology");
        let channel = topology.channels.get("binary_channel").expect("channel");
        assert_eq!(channel.expected_model_count, 2);
        assert_eq!(channel.signals.get("raw"), Some(&SignalKind::Binary));
    }

    #[test]
    fn model_topology_resolves_alias_and_behavior() {
        let file = write_stack();
        let set = DescriptorSet::load(&[file.path()]).expect("load descriptors");
        let topology = set
            .model_topology("binary_model_instance")
            .expect("model topology");
        assert_eq!(topology.uid, 42);
        let channel = topology.channels.get("binary_channel").expect("channel");
        assert_eq!(channel.alias, "raw_channel");
        assert_eq!(
            topology.behavior.as_ref().map(|spec| spec.behavior.as_str()),
            Some("binary-sequence")
        );
    }

    #[test]
    fn missing_expected_count_is_a_config_error() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(
            file.path(),
            r#"
kind: Stack
metadata:
  name: default
spec:
  models:
    - name: simbus
      channels:
        - name: scalar_channel
"#,
        )
        .expect("write stack");
        let set = DescriptorSet::load(&[file.path()]).expect("load descriptors");
        let err = set.bus_topology("simbus").expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingExpectedCount(_)));
    }

    #[test]
    fn unknown_instance_is_reported() {
        let file = write_stack();
        let set = DescriptorSet::load(&[file.path()]).expect("load descriptors");
        let err = set.model_topology("absent").expect_err("must fail");
        assert!(matches!(err, ConfigError::UnknownInstance(name) if name == "absent"));
    }
}
