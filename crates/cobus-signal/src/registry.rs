//! ---
//! cobus_section: "02-signal-data-model"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Signal registry and typed signal value storage."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::collections::HashMap;

use cobus_common::config::SignalKind;
use cobus_common::hash::stable_hash32;
use indexmap::IndexMap;
use tracing::trace;

/// Errors raised while registering signals.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalError {
    /// Two distinct names hashed to the same uid.
    #[error("ProtocolError: signal uid collision: '{incoming}' and '{existing}' both hash to {uid}")]
    Collision {
        /// The colliding uid.
        uid: u32,
        /// Name already registered under the uid.
        existing: String,
        /// Name whose registration was rejected.
        incoming: String,
    },
    /// A name was re-registered with a different value kind.
    #[error("ProtocolError: signal '{name}' re-registered as {incoming:?}, previously {existing:?}")]
    KindMismatch {
        /// Signal name.
        name: String,
        /// Kind recorded at first registration.
        existing: SignalKind,
        /// Conflicting kind.
        incoming: SignalKind,
    },
    /// Lookup for a uid no registration produced.
    #[error("ProtocolError: unknown signal uid {0}")]
    UnknownUid(u32),
}

#[derive(Debug, Clone)]
struct SignalInfo {
    name: String,
    kind: SignalKind,
}

/// Name/uid/kind mapping for every signal known to a process.
///
/// Uids derive from a stable hash of the name, so independently built
/// registries agree without exchanging state. Registration is idempotent
/// for a given `(name, kind)` pair; hash collisions across distinct names
/// are rejected rather than silently remapped.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    by_uid: IndexMap<u32, SignalInfo>,
    by_name: HashMap<String, u32>,
}

impl SignalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal name, returning its stable uid.
    pub fn register(&mut self, name: &str, kind: SignalKind) -> Result<u32, SignalError> {
        if let Some(uid) = self.by_name.get(name) {
            let info = &self.by_uid[uid];
            if info.kind != kind {
                return Err(SignalError::KindMismatch {
                    name: name.to_owned(),
                    existing: info.kind,
                    incoming: kind,
                });
            }
            return Ok(*uid);
        }

        let uid = stable_hash32(name);
        if let Some(info) = self.by_uid.get(&uid) {
            if info.name != name {
                return Err(SignalError::Collision {
                    uid,
                    existing: info.name.clone(),
                    incoming: name.to_owned(),
                });
            }
        }
        self.by_uid.insert(
            uid,
            SignalInfo {
                name: name.to_owned(),
                kind,
            },
        );
        self.by_name.insert(name.to_owned(), uid);
        trace!(uid, name, ?kind, "signal registered");
        Ok(uid)
    }

    /// Resolve a uid back to its name, for tracing and log output.
    pub fn lookup(&self, uid: u32) -> Result<&str, SignalError> {
        self.by_uid
            .get(&uid)
            .map(|info| info.name.as_str())
            .ok_or(SignalError::UnknownUid(uid))
    }

    /// Value kind of a registered uid.
    pub fn type_of(&self, uid: u32) -> Result<SignalKind, SignalError> {
        self.by_uid
            .get(&uid)
            .map(|info| info.kind)
            .ok_or(SignalError::UnknownUid(uid))
    }

    /// Whether the uid is known to this registry.
    pub fn contains(&self, uid: u32) -> bool {
        self.by_uid.contains_key(&uid)
    }

    /// Number of registered signals.
    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}
