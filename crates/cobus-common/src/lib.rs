//! ---
//! cobus_section: "01-core-functionality"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Shared primitives and utilities for the bus runtime."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! Core shared primitives for the Cobus co-simulation workspace.
//! This crate exposes descriptor/configuration loading, the tracing
//! bootstrap, stable hashing, and the fixed-step simulation clock consumed
//! across the workspace.

#![warn(missing_docs)]

pub mod config;
pub mod hash;
pub mod logging;
pub mod time;

pub use config::{
    BusOptions, BusTopology, ChannelBinding, ChannelTopology, ConfigError, DescriptorSet,
    ModelTopology, SignalKind, BUS_MODEL_UID, DEFAULT_BUS_TIMEOUT_SECS, DEFAULT_MODEL_TIMEOUT_SECS,
    DEFAULT_STEP_SIZE, DEFAULT_URI, FALLBACK_CHANNEL,
};
pub use hash::stable_hash32;
pub use logging::{init_tracing, level_directive};
pub use time::SimClock;
