//! ---
//! cobus_section: "04-transport-endpoints"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Transport endpoints and protocol frame codec."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::frame::Frame;
use crate::Result;

/// Errors raised by the transport layer.
///
/// Display strings lead with the error class from the protocol taxonomy
/// (`TransportError`, `TimeoutError`, `ProtocolError`, `ConfigError`) since
/// external harnesses classify failures by matching captured log output.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote endpoint refused or never accepted the connection.
    #[error("TransportError: connection refused for {uri}: {reason}")]
    ConnectionRefused {
        /// URI that was dialled.
        uri: String,
        /// Underlying failure description.
        reason: String,
    },
    /// An established connection dropped.
    #[error("TransportError: connection lost: {0}")]
    ConnectionLost(String),
    /// No message arrived within the allowed wait.
    #[error("TimeoutError: no message received within {0:?}")]
    Timeout(Duration),
    /// A frame failed to decode or violated framing limits.
    #[error("ProtocolError: malformed frame: {0}")]
    MalformedFrame(String),
    /// The URI scheme maps to no known backend.
    #[error("ConfigError: unsupported transport URI '{0}'")]
    UnsupportedScheme(String),
    /// `--transport` and the URI scheme disagree.
    #[error("ConfigError: transport '{transport}' does not serve URI '{uri}'")]
    SchemeMismatch {
        /// Requested transport family.
        transport: String,
        /// Offending URI.
        uri: String,
    },
    /// Operation not available on this endpoint kind.
    #[error("TransportError: operation unsupported on this endpoint: {0}")]
    Unsupported(&'static str),
    /// The endpoint was closed while the operation was in flight.
    #[error("TransportError: endpoint closed")]
    Closed,
    /// Wrapper for IO errors on stream transports.
    #[error("TransportError: io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for broker (redis) client errors.
    #[error("TransportError: broker error: {0}")]
    Broker(#[from] redis::RedisError),
}

impl TransportError {
    /// Whether the condition is worth retrying at the session level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::ConnectionRefused { .. }
        )
    }
}

/// Transport families selectable via `--transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local stream socket (`unix://`).
    Unix,
    /// Broker pub/sub (`redis://`).
    Redis,
    /// POSIX message queue (`posix://`).
    Posix,
    /// In-process pair for tests and single-process integration.
    Loopback,
}

impl TransportKind {
    /// Parse a `--transport` name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unix" | "socket" => Some(Self::Unix),
            "redis" | "redispubsub" => Some(Self::Redis),
            "posix" | "mq" => Some(Self::Posix),
            "loopback" => Some(Self::Loopback),
            _ => None,
        }
    }

    /// Backend selected by a URI scheme prefix.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let scheme = uri.split_once("://").map(|(scheme, _)| scheme)?;
        match scheme {
            "unix" => Some(Self::Unix),
            "redis" => Some(Self::Redis),
            "posix" => Some(Self::Posix),
            "loopback" => Some(Self::Loopback),
            _ => None,
        }
    }

    /// Transport name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Redis => "redis",
            Self::Posix => "posix",
            Self::Loopback => "loopback",
        }
    }
}

/// Where a frame should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The bus endpoint (model side only).
    Bus,
    /// One model endpoint by uid (bus side only).
    Model(u32),
    /// Every connected model (bus side only).
    Broadcast,
}

/// What a receive can yield besides a decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A decoded protocol frame.
    Frame(Frame),
    /// A peer connection closed without a `ModelExit`.
    ///
    /// `model_uid` is known once the peer sent at least one attributable
    /// frame; stream transports surface this so the coordinator can apply
    /// crash semantics without waiting for a timeout.
    PeerClosed {
        /// Uid of the vanished peer, when attributable.
        model_uid: Option<u32>,
    },
}

/// Point-to-multipoint message endpoint.
///
/// Implementations deliver whole frames with at least the coordinator's
/// required ordering: everything received is funnelled through one
/// single-consumer queue, so [`Endpoint::recv`] observes a serialized
/// arrival order.
#[async_trait]
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    /// Transport name for logging/metrics.
    fn name(&self) -> &'static str;

    /// Uid this endpoint announces.
    fn uid(&self) -> u32;

    /// Bind, connect or subscribe; must be called once before send/recv.
    async fn start(&self) -> Result<()>;

    /// Deliver a frame to the destination.
    async fn send(&self, destination: Destination, frame: Frame) -> Result<()>;

    /// Receive the next item, waiting at most `timeout`.
    async fn recv(&self, timeout: Duration) -> Result<Incoming>;

    /// Record a peer uid for point-to-point fan-out backends.
    ///
    /// Backends with native broadcast ignore this.
    fn register_notify_peer(&self, model_uid: u32);

    /// Release transport resources.
    async fn close(&self) -> Result<()>;
}

/// Single-consumer inbox every backend funnels received items through.
#[derive(Debug)]
pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<Incoming>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Incoming> {
        self.tx.clone()
    }

    pub(crate) async fn recv(&self, timeout: Duration) -> Result<Incoming> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(incoming)) => Ok(incoming),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Create an endpoint for the given transport and URI.
///
/// The URI scheme selects the backend; when `transport` is supplied it must
/// agree with the scheme. `bus_mode` selects the bus side of each backend
/// (listener/owner) over the model side (dialler).
pub async fn create_endpoint(
    transport: Option<&str>,
    uri: &str,
    uid: u32,
    bus_mode: bool,
    timeout: Duration,
) -> Result<Box<dyn Endpoint>> {
    let kind =
        TransportKind::from_uri(uri).ok_or_else(|| TransportError::UnsupportedScheme(uri.into()))?;
    if let Some(name) = transport {
        let requested = TransportKind::from_name(name)
            .ok_or_else(|| TransportError::UnsupportedScheme(name.into()))?;
        if requested != kind {
            return Err(TransportError::SchemeMismatch {
                transport: name.into(),
                uri: uri.into(),
            });
        }
    }

    let endpoint: Box<dyn Endpoint> = match kind {
        TransportKind::Unix => Box::new(crate::unix::UnixEndpoint::create(
            uri, uid, bus_mode, timeout,
        )?),
        TransportKind::Redis => Box::new(crate::redis::RedisEndpoint::create(
            uri, uid, bus_mode, timeout,
        )?),
        #[cfg(unix)]
        TransportKind::Posix => Box::new(crate::posix::PosixMqEndpoint::create(
            uri, uid, bus_mode, timeout,
        )?),
        #[cfg(not(unix))]
        TransportKind::Posix => return Err(TransportError::UnsupportedScheme(uri.into())),
        TransportKind::Loopback => {
            Box::new(crate::loopback::LoopbackEndpoint::create(uri, uid, bus_mode)?)
        }
    };
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_scheme_selects_backend() {
        assert_eq!(
            TransportKind::from_uri("unix:///tmp/bus.sock"),
            Some(TransportKind::Unix)
        );
        assert_eq!(
            TransportKind::from_uri("redis://localhost:6379"),
            Some(TransportKind::Redis)
        );
        assert_eq!(
            TransportKind::from_uri("posix:///cobus"),
            Some(TransportKind::Posix)
        );
        assert_eq!(TransportKind::from_uri("ftp://nope"), None);
        assert_eq!(TransportKind::from_uri("no-scheme"), None);
    }

    #[test]
    fn transport_names_alias_families() {
        assert_eq!(
            TransportKind::from_name("redispubsub"),
            Some(TransportKind::Redis)
        );
        assert_eq!(TransportKind::from_name("mq"), Some(TransportKind::Posix));
        assert_eq!(TransportKind::from_name("bogus"), None);
    }

    #[tokio::test]
    async fn scheme_mismatch_is_a_config_error() {
        let err = create_endpoint(
            Some("redis"),
            "unix:///tmp/bus.sock",
            1,
            false,
            Duration::from_secs(1),
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, TransportError::SchemeMismatch { .. }));
    }

    #[tokio::test]
    async fn inbox_times_out_with_distinguishable_error() {
        let inbox = Inbox::new();
        let err = inbox
            .recv(Duration::from_millis(10))
            .await
            .expect_err("must time out");
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("TimeoutError"));
    }
}
