//! ---
//! cobus_section: "05-step-coordination"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Step coordination and bus service composition."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
//! The step coordinator: the part of Cobus that makes N independent model
//! processes advance through discrete simulation steps in lockstep.
//!
//! Per channel and cycle, writes are collected until every expected session
//! has reported, merged under a deterministic policy, and broadcast back
//! together with the next step boundary. The merge itself is pure and
//! synchronous; everything received arrives through the transport's
//! single-consumer inbox, so no two tasks ever touch a channel's write
//! buffer concurrently.

#![warn(missing_docs)]

pub mod bus;
pub mod channel;
pub mod metrics;

pub use bus::{Bus, BusError, BusSummary};
pub use channel::{BusChannel, CyclePhase};
pub use metrics::BusMetrics;
