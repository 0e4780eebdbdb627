//! ---
//! cobus_section: "06-model-runtime"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Model-side runtime and built-in behaviors."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! Model-side runtime for Cobus.
//!
//! A model connects to the bus, registers on its subscribed channels,
//! resolves signal uids, and then repeats the step cycle: run its behavior
//! against the local signal vectors, submit the writes, and wait for the
//! merged broadcast that releases the next step.

#![warn(missing_docs)]

pub mod behavior;
pub mod runtime;

pub use behavior::{
    behavior_for, BinarySequenceModel, ChannelVector, CounterModel, ModelBehavior, ModelError,
    ModelVectors,
};
pub use runtime::{ModelRuntime, ModelSummary};
