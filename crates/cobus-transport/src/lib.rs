//! ---
//! cobus_section: "04-transport-endpoints"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Transport endpoints and protocol frame codec."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! Transport layer for the Cobus protocol.
//!
//! One [`Endpoint`] trait fronts all backends; callers are transport
//! agnostic. The URI scheme selects the backend: `unix:///path` (local
//! stream socket), `redis://host[:port]` (broker pub/sub),
//! `posix:///name` (POSIX message queue), and `loopback://name`
//! (in-process pair used by the integration suites).
//!
//! Every backend funnels received frames through a single-consumer inbox,
//! so the coordinator observes one serialized arrival order no matter how
//! many connections feed it.

#![warn(missing_docs)]

pub mod endpoint;
pub mod frame;
pub mod loopback;
#[cfg(unix)]
pub mod posix;
pub mod redis;
pub mod unix;

pub use endpoint::{
    create_endpoint, Destination, Endpoint, Incoming, TransportError, TransportKind,
};
pub use frame::{
    read_frame, write_frame, BinaryWrite, ChannelWrites, Frame, ScalarWrite, SignalLookup,
    FRAME_SCHEMA_VERSION,
};

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
