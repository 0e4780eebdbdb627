//! ---
//! cobus_section: "05-step-coordination"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Step coordination and bus service composition."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use cobus_common::config::{ChannelTopology, SignalKind};
use cobus_signal::{SignalRegistry, SignalStore};
use cobus_transport::{BinaryWrite, ChannelWrites, ScalarWrite};
use tracing::{debug, info, warn};

use crate::bus::BusError;

/// Cycle state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Accepting writes from any admitted, subscribed session.
    Open,
    /// At least one write received, fewer than the expected count.
    AwaitingQuorum,
    /// All expected sessions wrote; merged value computed.
    Merged,
    /// Merged value sent; resets to `Open` for the next cycle.
    Broadcast,
}

/// One binary write staged for the cycle, keyed for deterministic merging.
#[derive(Debug, Clone)]
struct StagedBinary {
    /// Admission index of the writing session.
    admission: u32,
    /// Receive sequence, stamped by the coordinator's single consumer.
    sequence: u64,
    uid: u32,
    data: Vec<u8>,
}

/// Per-channel state owned by the step coordinator.
///
/// Quorum accounting follows two sets: the sessions registered on the
/// channel and the subset that reported ready this cycle. A session that
/// disconnects is removed from both immediately, and the expected count
/// follows it down, so the remaining sessions can still close the cycle.
#[derive(Debug)]
pub struct BusChannel {
    name: String,
    expected_model_count: u32,
    signals: SignalStore,
    register_set: BTreeSet<u32>,
    ready_set: BTreeSet<u32>,
    phase: CyclePhase,
    staged: Vec<StagedBinary>,
}

impl BusChannel {
    /// Create a channel from its derived topology, pre-registering the
    /// declared signals so their uids appear in the startup log.
    pub fn new(
        name: impl Into<String>,
        topology: &ChannelTopology,
        registry: &mut SignalRegistry,
    ) -> Result<Self, BusError> {
        let name = name.into();
        let mut signals = SignalStore::new();
        for (index, (signal_name, kind)) in topology.signals.iter().enumerate() {
            let uid = registry.register(signal_name, *kind)?;
            signals.ensure(signal_name, uid, *kind);
            info!(channel = %name, "[{index}] uid={uid}, name={signal_name}");
        }
        Ok(Self {
            name,
            expected_model_count: topology.expected_model_count,
            signals,
            register_set: BTreeSet::new(),
            ready_set: BTreeSet::new(),
            phase: CyclePhase::Open,
            staged: Vec::new(),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current cycle phase.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Sessions currently expected each cycle.
    pub fn expected_model_count(&self) -> u32 {
        self.expected_model_count
    }

    /// Record a session registration on this channel.
    pub fn register_model(&mut self, model_uid: u32) {
        self.register_set.insert(model_uid);
    }

    /// Whether all expected sessions have registered.
    pub fn network_ready(&self) -> bool {
        self.register_set.len() as u32 == self.expected_model_count
    }

    /// Whether any session is still registered.
    pub fn has_models(&self) -> bool {
        !self.register_set.is_empty()
    }

    /// Remove a session from the channel's accounting entirely.
    ///
    /// The expected count follows the removal so quorum stays reachable for
    /// the sessions that remain. Staged binary data is keyed by admission
    /// index; callers discard it via [`BusChannel::drop_staged_for`].
    pub fn remove_model(&mut self, model_uid: u32) -> bool {
        if !self.register_set.remove(&model_uid) {
            return false;
        }
        self.ready_set.remove(&model_uid);
        self.expected_model_count = self.expected_model_count.saturating_sub(1);
        true
    }

    /// Discard staged writes originating from the given admission index.
    pub fn drop_staged_for(&mut self, admission: u32) {
        self.staged.retain(|staged| staged.admission != admission);
    }

    /// Apply one session's writes for the current cycle.
    ///
    /// Scalars land on the signal's pending slot immediately (last arrival
    /// wins); binaries are staged with the session's admission index and the
    /// receive sequence, and only concatenated at merge time.
    pub fn apply_writes(
        &mut self,
        model_uid: u32,
        admission: u32,
        sequence: u64,
        writes: &ChannelWrites,
    ) -> Result<(), BusError> {
        for scalar in &writes.scalars {
            let value = self
                .signals
                .get_mut(scalar.uid)
                .ok_or(BusError::UnknownSignal {
                    model_uid,
                    channel: self.name.clone(),
                    uid: scalar.uid,
                })?;
            if value.kind() != SignalKind::Scalar {
                return Err(BusError::SignalKindViolation {
                    model_uid,
                    channel: self.name.clone(),
                    uid: scalar.uid,
                });
            }
            let previous = value.write(scalar.value);
            info!(
                channel = %self.name,
                model_uid,
                sequence,
                "SignalWrite: {} = {:.6} [name={}, prev={:.6}]",
                scalar.uid,
                scalar.value,
                value.name(),
                previous
            );
        }

        for binary in &writes.binaries {
            let value = self
                .signals
                .get(binary.uid)
                .ok_or(BusError::UnknownSignal {
                    model_uid,
                    channel: self.name.clone(),
                    uid: binary.uid,
                })?;
            if value.kind() != SignalKind::Binary {
                return Err(BusError::SignalKindViolation {
                    model_uid,
                    channel: self.name.clone(),
                    uid: binary.uid,
                });
            }
            debug!(
                channel = %self.name,
                model_uid,
                sequence,
                uid = binary.uid,
                len = binary.data.len(),
                "binary write staged"
            );
            self.staged.push(StagedBinary {
                admission,
                sequence,
                uid: binary.uid,
                data: binary.data.clone(),
            });
        }

        if self.phase == CyclePhase::Open {
            self.phase = CyclePhase::AwaitingQuorum;
        }
        Ok(())
    }

    /// Record that a session finished writing for this cycle.
    pub fn mark_ready(&mut self, model_uid: u32) {
        if self.register_set.contains(&model_uid) {
            self.ready_set.insert(model_uid);
            if self.phase == CyclePhase::Open {
                self.phase = CyclePhase::AwaitingQuorum;
            }
        } else {
            warn!(channel = %self.name, model_uid, "ready from unregistered session ignored");
        }
    }

    /// Quorum closure: exactly when every registered, expected session has
    /// reported ready; never earlier, never requiring more.
    pub fn models_ready(&self) -> bool {
        self.network_ready() && self.ready_set.len() as u32 == self.expected_model_count
    }

    /// Merge the cycle's writes into the broadcast value.
    ///
    /// Binary payloads concatenate in session admission order; the sort is
    /// stable, so multiple writes from one session keep their arrival order.
    /// Scalars were already applied arrival-ordered; only changed values are
    /// included in the broadcast.
    pub fn merge(&mut self) -> ChannelWrites {
        self.staged.sort_by_key(|staged| staged.admission);
        for staged in self.staged.drain(..) {
            if let Some(value) = self.signals.get_mut(staged.uid) {
                value.append(&staged.data);
                info!(
                    channel = %self.name,
                    sequence = staged.sequence,
                    "SignalValue: {} = <binary> (len={}) [name={}]",
                    staged.uid,
                    value.bin().len(),
                    value.name()
                );
            }
        }

        let mut merged = ChannelWrites::new(self.name.clone());
        for value in self.signals.iter() {
            match value.kind() {
                SignalKind::Scalar => {
                    if value.changed() {
                        info!(
                            channel = %self.name,
                            "SignalValue: {} = {:.6} [name={}]",
                            value.uid(),
                            value.pending(),
                            value.name()
                        );
                        merged.scalars.push(ScalarWrite {
                            uid: value.uid(),
                            value: value.pending(),
                        });
                    }
                }
                SignalKind::Binary => {
                    if !value.bin().is_empty() {
                        merged.binaries.push(BinaryWrite {
                            uid: value.uid(),
                            data: value.bin().to_vec(),
                        });
                    }
                }
            }
        }
        self.phase = CyclePhase::Merged;
        merged
    }

    /// Close the cycle after the merged value was broadcast.
    pub fn finish_cycle(&mut self) {
        self.signals.resolve_all();
        self.ready_set.clear();
        self.phase = CyclePhase::Open;
    }

    /// Mark the merged value as sent.
    pub fn mark_broadcast(&mut self) {
        self.phase = CyclePhase::Broadcast;
    }

    /// Whether the channel holds writes that have not been broadcast.
    pub fn has_pending_writes(&self) -> bool {
        self.phase == CyclePhase::AwaitingQuorum
    }

    /// Signal uid for a name declared on this channel.
    pub fn signal_uid(&self, name: &str) -> Option<u32> {
        self.signals.get_by_name(name).map(|value| value.uid())
    }

    /// Access the channel's signal store (read only).
    pub fn signals(&self) -> &SignalStore {
        &self.signals
    }

    /// Register a signal discovered through a lookup request.
    pub fn ensure_signal(
        &mut self,
        name: &str,
        kind: SignalKind,
        registry: &mut SignalRegistry,
    ) -> Result<u32, BusError> {
        let uid = registry.register(name, kind)?;
        self.signals.ensure(name, uid, kind);
        Ok(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobus_common::config::ChannelTopology;
    use indexmap::IndexMap;

    fn topology(expected: u32) -> ChannelTopology {
        let mut signals = IndexMap::new();
        signals.insert("counter".to_owned(), SignalKind::Scalar);
        signals.insert("raw".to_owned(), SignalKind::Binary);
        ChannelTopology {
            expected_model_count: expected,
            signals,
        }
    }

    fn channel(expected: u32) -> (BusChannel, SignalRegistry) {
        let mut registry = SignalRegistry::new();
        let channel =
            BusChannel::new("test", &topology(expected), &mut registry).expect("channel");
        (channel, registry)
    }

    fn binary_writes(channel: &BusChannel, data: &[u8]) -> ChannelWrites {
        let uid = channel.signal_uid("raw").expect("raw uid");
        ChannelWrites {
            channel: "test".into(),
            scalars: Vec::new(),
            binaries: vec![BinaryWrite {
                uid,
                data: data.to_vec(),
            }],
        }
    }

    #[test]
    fn quorum_closes_exactly_at_expected_count() {
        let (mut channel, _registry) = channel(2);
        channel.register_model(1);
        channel.register_model(2);
        assert!(channel.network_ready());

        channel.mark_ready(1);
        assert!(!channel.models_ready(), "one of two is not quorum");
        assert_eq!(channel.phase(), CyclePhase::AwaitingQuorum);
        channel.mark_ready(2);
        assert!(channel.models_ready(), "second distinct session closes quorum");
        // A repeat ready from the same session never over-counts.
        channel.mark_ready(2);
        assert!(channel.models_ready());
    }

    #[test]
    fn binary_merge_follows_admission_order_not_arrival() {
        let (mut channel, _registry) = channel(2);
        channel.register_model(1);
        channel.register_model(2);

        // Session with admission index 1 arrives first on the wire.
        let writes_b = binary_writes(&channel, b"two\0");
        channel
            .apply_writes(2, 1, 10, &writes_b)
            .expect("apply");
        let writes_a = binary_writes(&channel, b"one\0");
        channel
            .apply_writes(1, 0, 11, &writes_a)
            .expect("apply");
        channel.mark_ready(2);
        channel.mark_ready(1);
        assert!(channel.models_ready());

        let merged = channel.merge();
        assert_eq!(merged.binaries.len(), 1);
        assert_eq!(merged.binaries[0].data, b"one\0two\0".to_vec());
        channel.finish_cycle();
        assert_eq!(channel.phase(), CyclePhase::Open);
    }

    #[test]
    fn scalar_last_arrival_wins() {
        let (mut channel, _registry) = channel(2);
        channel.register_model(1);
        channel.register_model(2);
        let uid = channel.signal_uid("counter").expect("uid");

        let first = ChannelWrites {
            channel: "test".into(),
            scalars: vec![ScalarWrite { uid, value: 1.0 }],
            binaries: Vec::new(),
        };
        let second = ChannelWrites {
            channel: "test".into(),
            scalars: vec![ScalarWrite { uid, value: 2.0 }],
            binaries: Vec::new(),
        };
        channel.apply_writes(1, 0, 1, &first).expect("apply");
        channel.apply_writes(2, 1, 2, &second).expect("apply");
        channel.mark_ready(1);
        channel.mark_ready(2);

        let merged = channel.merge();
        assert_eq!(merged.scalars, vec![ScalarWrite { uid, value: 2.0 }]);
    }

    #[test]
    fn unchanged_scalars_are_not_rebroadcast() {
        let (mut channel, _registry) = channel(1);
        channel.register_model(1);
        let uid = channel.signal_uid("counter").expect("uid");
        let writes = ChannelWrites {
            channel: "test".into(),
            scalars: vec![ScalarWrite { uid, value: 5.0 }],
            binaries: Vec::new(),
        };
        channel.apply_writes(1, 0, 1, &writes).expect("apply");
        channel.mark_ready(1);
        let merged = channel.merge();
        assert_eq!(merged.scalars.len(), 1);
        channel.finish_cycle();

        // Same value next cycle: no delta, nothing to broadcast.
        channel.apply_writes(1, 0, 2, &writes).expect("apply");
        channel.mark_ready(1);
        let merged = channel.merge();
        assert!(merged.scalars.is_empty());
    }

    #[test]
    fn removal_keeps_quorum_reachable() {
        let (mut channel, _registry) = channel(2);
        channel.register_model(1);
        channel.register_model(2);
        channel.mark_ready(1);
        assert!(!channel.models_ready());

        assert!(channel.remove_model(2));
        assert_eq!(channel.expected_model_count(), 1);
        assert!(channel.models_ready(), "remaining session closes quorum");
        assert!(channel.has_models());
    }

    #[test]
    fn unknown_signal_write_is_a_protocol_error() {
        let (mut channel, _registry) = channel(1);
        channel.register_model(1);
        let writes = ChannelWrites {
            channel: "test".into(),
            scalars: vec![ScalarWrite {
                uid: 12345,
                value: 1.0,
            }],
            binaries: Vec::new(),
        };
        let err = channel
            .apply_writes(1, 0, 1, &writes)
            .expect_err("must fail");
        assert!(matches!(err, BusError::UnknownSignal { uid: 12345, .. }));
    }

    #[test]
    fn kind_violation_is_a_protocol_error() {
        let (mut channel, _registry) = channel(1);
        channel.register_model(1);
        let uid = channel.signal_uid("counter").expect("uid");
        let writes = ChannelWrites {
            channel: "test".into(),
            scalars: Vec::new(),
            binaries: vec![BinaryWrite {
                uid,
                data: b"x".to_vec(),
            }],
        };
        let err = channel
            .apply_writes(1, 0, 1, &writes)
            .expect_err("must fail");
        assert!(matches!(err, BusError::SignalKindViolation { .. }));
    }
}
