//! ---
//! cobus_section: "03-session-lifecycle"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Model session registry and lifecycle state machine."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Errors raised by the session registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The uid does not belong to any admitted session.
    #[error("ProtocolError: unknown session uid {0}")]
    UnknownSession(u32),
    /// A state transition outside the lifecycle graph was requested.
    #[error("ProtocolError: session {uid} cannot move {from:?} -> {to:?}")]
    IllegalTransition {
        /// Session uid.
        uid: u32,
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
}

/// Lifecycle state of a connected model session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake received, registration not yet acknowledged.
    Connecting,
    /// Admitted and waiting at the step boundary.
    Ready,
    /// Writes submitted for the current cycle.
    Stepping,
    /// Terminal: the session left or its connection dropped.
    Disconnected,
}

impl SessionState {
    fn can_move_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (SessionState::Connecting, SessionState::Ready)
                | (SessionState::Ready, SessionState::Stepping)
                | (SessionState::Stepping, SessionState::Ready)
                | (_, SessionState::Disconnected)
        )
    }
}

/// Identity a model announces on its first handshake.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    /// Instance name.
    pub name: String,
    /// Stable instance uid.
    pub uid: u32,
    /// Step size the model declared.
    pub step_size: f64,
}

/// Cheap handle identifying an admitted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session uid.
    pub uid: u32,
    /// Admission index, the deterministic merge-ordering key.
    pub admission: u32,
}

/// One admitted model session.
#[derive(Debug, Clone)]
pub struct ModelSession {
    /// Instance name.
    pub name: String,
    /// Stable instance uid.
    pub uid: u32,
    /// Admission index (monotonic, assigned at admit time).
    pub admission: u32,
    /// Channels the session subscribed to, in subscription order.
    pub channels: Vec<String>,
    /// Step size the model declared.
    pub step_size: f64,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Wall-clock admission timestamp, for log correlation.
    pub admitted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_admission: u32,
    sessions: IndexMap<u32, ModelSession>,
}

/// Registry of every model session the bus has admitted.
///
/// Admission order is preserved: handles returned by
/// [`SessionRegistry::list_for_channel`] are sorted by admission index, and
/// that order is what binary merge concatenation follows.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session on first handshake, or return the existing handle.
    pub fn admit(&self, descriptor: SessionDescriptor) -> SessionHandle {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.sessions.get(&descriptor.uid) {
            return SessionHandle {
                uid: existing.uid,
                admission: existing.admission,
            };
        }
        let admission = inner.next_admission;
        inner.next_admission += 1;
        let session = ModelSession {
            name: descriptor.name,
            uid: descriptor.uid,
            admission,
            channels: Vec::new(),
            step_size: descriptor.step_size,
            state: SessionState::Connecting,
            admitted_at: Utc::now(),
        };
        debug!(
            model_uid = session.uid,
            model_name = %session.name,
            admission,
            "session admitted"
        );
        inner.sessions.insert(session.uid, session);
        SessionHandle {
            uid: descriptor.uid,
            admission,
        }
    }

    /// Record a channel subscription for an admitted session.
    pub fn subscribe(&self, uid: u32, channel: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&uid)
            .ok_or(SessionError::UnknownSession(uid))?;
        if !session.channels.iter().any(|name| name == channel) {
            session.channels.push(channel.to_owned());
        }
        Ok(())
    }

    /// Move a session along the lifecycle graph.
    pub fn transition(&self, uid: u32, to: SessionState) -> Result<SessionState, SessionError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&uid)
            .ok_or(SessionError::UnknownSession(uid))?;
        if session.state == to {
            return Ok(to);
        }
        if !session.state.can_move_to(to) {
            return Err(SessionError::IllegalTransition {
                uid,
                from: session.state,
                to,
            });
        }
        debug!(model_uid = uid, from = ?session.state, to = ?to, "session state change");
        session.state = to;
        Ok(to)
    }

    /// Remove a session entirely, returning its final record.
    ///
    /// Used on disconnect and exit; the session is marked `Disconnected`
    /// first so a copy of the record reflects the terminal state.
    pub fn remove(&self, uid: u32) -> Option<ModelSession> {
        let mut inner = self.inner.lock();
        let mut session = inner.sessions.shift_remove(&uid)?;
        session.state = SessionState::Disconnected;
        debug!(model_uid = uid, model_name = %session.name, "session removed");
        Some(session)
    }

    /// Current state of a session, if admitted.
    pub fn state(&self, uid: u32) -> Option<SessionState> {
        self.inner.lock().sessions.get(&uid).map(|s| s.state)
    }

    /// Clone the full session record.
    pub fn get(&self, uid: u32) -> Option<ModelSession> {
        self.inner.lock().sessions.get(&uid).cloned()
    }

    /// Handles of every admitted session, in admission order.
    pub fn handles(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock();
        let mut handles: Vec<SessionHandle> = inner
            .sessions
            .values()
            .map(|session| SessionHandle {
                uid: session.uid,
                admission: session.admission,
            })
            .collect();
        handles.sort_by_key(|handle| handle.admission);
        handles
    }

    /// Handles of sessions subscribed to a channel, in admission order.
    pub fn list_for_channel(&self, channel: &str) -> Vec<SessionHandle> {
        let inner = self.inner.lock();
        let mut handles: Vec<SessionHandle> = inner
            .sessions
            .values()
            .filter(|session| session.channels.iter().any(|name| name == channel))
            .map(|session| SessionHandle {
                uid: session.uid,
                admission: session.admission,
            })
            .collect();
        handles.sort_by_key(|handle| handle.admission);
        handles
    }

    /// Whether a frame from this uid should be processed at all.
    ///
    /// Frames from unknown or disconnected sessions are dropped by the
    /// coordinator with a warning; this is the check backing that policy.
    pub fn accepts_frames(&self, uid: u32) -> bool {
        match self.state(uid) {
            Some(SessionState::Disconnected) | None => {
                warn!(model_uid = uid, "dropping frame from unadmitted or disconnected session");
                false
            }
            Some(_) => true,
        }
    }

    /// Number of admitted sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no sessions remain.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, uid: u32) -> SessionDescriptor {
        SessionDescriptor {
            name: name.to_owned(),
            uid,
            step_size: 0.005,
        }
    }

    #[test]
    fn admission_indexes_are_monotonic() {
        let registry = SessionRegistry::new();
        let a = registry.admit(descriptor("a", 1));
        let b = registry.admit(descriptor("b", 2));
        assert_eq!(a.admission, 0);
        assert_eq!(b.admission, 1);
        // Re-admission returns the original handle.
        assert_eq!(registry.admit(descriptor("a", 1)).admission, 0);
    }

    #[test]
    fn lifecycle_transitions_are_validated() {
        let registry = SessionRegistry::new();
        let handle = registry.admit(descriptor("a", 1));
        registry
            .transition(handle.uid, SessionState::Ready)
            .expect("connecting -> ready");
        registry
            .transition(handle.uid, SessionState::Stepping)
            .expect("ready -> stepping");
        registry
            .transition(handle.uid, SessionState::Ready)
            .expect("stepping -> ready");
        let err = registry
            .transition(handle.uid, SessionState::Connecting)
            .expect_err("ready -> connecting is illegal");
        assert!(matches!(err, SessionError::IllegalTransition { .. }));
    }

    #[test]
    fn channel_listing_follows_admission_order() {
        let registry = SessionRegistry::new();
        let b = registry.admit(descriptor("b", 2));
        let a = registry.admit(descriptor("a", 1));
        registry.subscribe(a.uid, "ch").expect("subscribe");
        registry.subscribe(b.uid, "ch").expect("subscribe");
        let handles = registry.list_for_channel("ch");
        assert_eq!(
            handles.iter().map(|h| h.uid).collect::<Vec<_>>(),
            vec![2, 1],
            "admission order, not subscription order"
        );
    }

    #[test]
    fn disconnected_sessions_stop_accepting_frames() {
        let registry = SessionRegistry::new();
        let handle = registry.admit(descriptor("a", 1));
        assert!(registry.accepts_frames(handle.uid));
        registry.remove(handle.uid);
        assert!(!registry.accepts_frames(handle.uid));
        assert!(!registry.accepts_frames(99));
    }
}
