//! ---
//! cobus_section: "02-signal-data-model"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Signal registry and typed signal value storage."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use cobus_common::config::SignalKind;
use indexmap::IndexMap;

/// One signal's current and pending state.
///
/// Scalars are double-buffered: `value` is what the last broadcast carried,
/// `pending` is the most recent write this cycle. Only signals whose pending
/// value differs from the broadcast value are re-sent, so an unchanged scalar
/// produces no traffic. Binary signals accumulate into a buffer that is
/// consumed (cleared) by the broadcast.
#[derive(Debug, Clone)]
pub struct SignalValue {
    name: String,
    uid: u32,
    kind: SignalKind,
    value: f64,
    pending: f64,
    bin: Vec<u8>,
}

impl SignalValue {
    /// Create a signal value slot.
    pub fn new(name: impl Into<String>, uid: u32, kind: SignalKind) -> Self {
        Self {
            name: name.into(),
            uid,
            kind,
            value: 0.0,
            pending: 0.0,
            bin: Vec::new(),
        }
    }

    /// Signal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable uid.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Value kind.
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Last broadcast scalar value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Pending scalar value for the current cycle.
    pub fn pending(&self) -> f64 {
        self.pending
    }

    /// Record a scalar write, returning the previous pending value.
    pub fn write(&mut self, value: f64) -> f64 {
        let previous = self.pending;
        self.pending = value;
        previous
    }

    /// Overwrite both buffers with an authoritative (broadcast) value.
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
        self.pending = value;
    }

    /// Whether the pending scalar differs from the broadcast value.
    pub fn changed(&self) -> bool {
        self.value != self.pending
    }

    /// Append binary payload bytes to the accumulation buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.bin.extend_from_slice(data);
    }

    /// Current binary buffer contents.
    pub fn bin(&self) -> &[u8] {
        &self.bin
    }

    /// Replace the binary buffer wholesale.
    pub fn set_bin(&mut self, data: Vec<u8>) {
        self.bin = data;
    }

    /// Take the binary buffer, leaving the slot empty.
    pub fn take_bin(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bin)
    }

    /// Commit the cycle: pending scalar becomes current, binary is consumed.
    pub fn resolve(&mut self) {
        self.value = self.pending;
        self.bin.clear();
    }
}

/// Ordered per-channel collection of signal values, keyed by uid.
#[derive(Debug, Clone, Default)]
pub struct SignalStore {
    values: IndexMap<u32, SignalValue>,
}

impl SignalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a slot for the signal if absent, returning a mutable handle.
    pub fn ensure(&mut self, name: &str, uid: u32, kind: SignalKind) -> &mut SignalValue {
        self.values
            .entry(uid)
            .or_insert_with(|| SignalValue::new(name, uid, kind))
    }

    /// Borrow a signal by uid.
    pub fn get(&self, uid: u32) -> Option<&SignalValue> {
        self.values.get(&uid)
    }

    /// Mutably borrow a signal by uid.
    pub fn get_mut(&mut self, uid: u32) -> Option<&mut SignalValue> {
        self.values.get_mut(&uid)
    }

    /// Borrow a signal by name.
    pub fn get_by_name(&self, name: &str) -> Option<&SignalValue> {
        self.values.values().find(|value| value.name() == name)
    }

    /// Iterate signals in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SignalValue> {
        self.values.values()
    }

    /// Iterate signals mutably in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SignalValue> {
        self.values.values_mut()
    }

    /// Commit every signal for the finished cycle.
    pub fn resolve_all(&mut self) {
        for value in self.values.values_mut() {
            value.resolve();
        }
    }

    /// Number of signals in the store.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no signals.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_double_buffering_tracks_changes() {
        let mut value = SignalValue::new("foo", 1, SignalKind::Scalar);
        assert!(!value.changed());
        let previous = value.write(4.8);
        assert_eq!(previous, 0.0);
        assert!(value.changed());
        value.resolve();
        assert!(!value.changed());
        assert_eq!(value.value(), 4.8);
    }

    #[test]
    fn binary_buffer_accumulates_and_is_consumed_on_resolve() {
        let mut value = SignalValue::new("raw", 2, SignalKind::Binary);
        value.append(b"one\0");
        value.append(b"one\0");
        assert_eq!(value.bin(), b"one\0one\0");
        value.resolve();
        assert!(value.bin().is_empty());
    }

    #[test]
    fn store_ensures_slots_once() {
        let mut store = SignalStore::new();
        store.ensure("foo", 1, SignalKind::Scalar).write(1.0);
        store.ensure("foo", 1, SignalKind::Scalar).write(2.0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).map(SignalValue::pending), Some(2.0));
        assert!(store.get_by_name("foo").is_some());
    }
}
