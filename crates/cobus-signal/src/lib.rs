//! ---
//! cobus_section: "02-signal-data-model"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Signal registry and typed signal value storage."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! Signal identity and value model for the Cobus workspace.
//!
//! Signal identifiers are a stable hash of the signal name so that the bus
//! and every model process derive identical ids without coordination. Values
//! are typed as scalar doubles or variable-length binary payloads.

#![warn(missing_docs)]

pub mod registry;
pub mod value;

pub use cobus_common::config::SignalKind;
pub use registry::{SignalError, SignalRegistry};
pub use value::{SignalStore, SignalValue};
