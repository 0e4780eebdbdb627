//! ---
//! cobus_section: "03-session-lifecycle"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Model session registry and lifecycle state machine."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! Session tracking for connected model instances.
//!
//! The bus owns one [`SessionRegistry`]; every connected model is a
//! [`ModelSession`] that moves through `Connecting -> Ready -> Stepping`
//! each cycle and terminally into `Disconnected`. Admission order is
//! recorded per session and is the deterministic ordering key for binary
//! signal merging.

#![warn(missing_docs)]

pub mod registry;

pub use registry::{
    ModelSession, SessionDescriptor, SessionError, SessionHandle, SessionRegistry, SessionState,
};
