//! ---
//! cobus_section: "04-transport-endpoints"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Transport endpoints and protocol frame codec."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::endpoint::{Destination, Endpoint, Incoming, TransportError};
use crate::frame::Frame;
use crate::Result;

/// Process-wide table of named loopback hubs, keyed by the URI authority.
static HUBS: Lazy<Mutex<HashMap<String, Arc<Hub>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Shared state of one loopback bus: the inbox feeding the bus endpoint and
/// the per-model delivery channels.
#[derive(Debug)]
struct Hub {
    to_bus: mpsc::UnboundedSender<Incoming>,
    bus_rx: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    models: Mutex<HashMap<u32, mpsc::UnboundedSender<Incoming>>>,
}

impl Hub {
    fn new() -> Self {
        let (to_bus, bus_rx) = mpsc::unbounded_channel();
        Self {
            to_bus,
            bus_rx: Mutex::new(Some(bus_rx)),
            models: Mutex::new(HashMap::new()),
        }
    }
}

fn hub_for(name: &str) -> Arc<Hub> {
    let mut hubs = HUBS.lock();
    hubs.entry(name.to_owned())
        .or_insert_with(|| Arc::new(Hub::new()))
        .clone()
}

fn hub_name(uri: &str) -> Result<String> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| TransportError::UnsupportedScheme(uri.into()))?;
    if scheme != "loopback" || rest.is_empty() {
        return Err(TransportError::UnsupportedScheme(uri.into()));
    }
    Ok(rest.to_owned())
}

/// In-process endpoint pair.
///
/// A whole simulation stack runs inside one process: the bus endpoint claims
/// the hub inbox, each model endpoint gets its own delivery channel. Used by
/// the integration suites and any single-process composition.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    hub_name: String,
    hub: Arc<Hub>,
    uid: u32,
    bus_mode: bool,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

impl LoopbackEndpoint {
    /// Create an endpoint attached to the named in-process hub.
    pub fn create(uri: &str, uid: u32, bus_mode: bool) -> Result<Self> {
        let name = hub_name(uri)?;
        let hub = hub_for(&name);
        let rx = if bus_mode {
            hub.bus_rx.lock().take().ok_or_else(|| {
                TransportError::ConnectionRefused {
                    uri: uri.into(),
                    reason: "loopback hub already has a bus endpoint".into(),
                }
            })?
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            hub.models.lock().insert(uid, tx);
            rx
        };
        debug!(hub = %name, uid, bus_mode, "loopback endpoint attached");
        Ok(Self {
            hub_name: name,
            hub,
            uid,
            bus_mode,
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Endpoint for LoopbackEndpoint {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, destination: Destination, frame: Frame) -> Result<()> {
        match (self.bus_mode, destination) {
            (false, Destination::Bus) => self
                .hub
                .to_bus
                .send(Incoming::Frame(frame))
                .map_err(|_| TransportError::Closed),
            (true, Destination::Model(uid)) => {
                let models = self.hub.models.lock();
                match models.get(&uid) {
                    Some(tx) => tx
                        .send(Incoming::Frame(frame))
                        .map_err(|_| TransportError::Closed),
                    None => {
                        warn!(model_uid = uid, "loopback send to unknown model dropped");
                        Ok(())
                    }
                }
            }
            (true, Destination::Broadcast) => {
                let models = self.hub.models.lock();
                for tx in models.values() {
                    // A receiver dropped mid-broadcast is a vanished model,
                    // handled by crash semantics, not a send failure.
                    let _ = tx.send(Incoming::Frame(frame.clone()));
                }
                Ok(())
            }
            (_, destination) => {
                warn!(?destination, bus_mode = self.bus_mode, "loopback destination rejected");
                Err(TransportError::Unsupported(
                    "destination not served by this endpoint side",
                ))
            }
        }
    }

    async fn recv(&self, timeout: Duration) -> Result<Incoming> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(incoming)) => Ok(incoming),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    fn register_notify_peer(&self, _model_uid: u32) {
        // Delivery channels are registered at endpoint creation.
    }

    async fn close(&self) -> Result<()> {
        if self.bus_mode {
            HUBS.lock().remove(&self.hub_name);
        } else {
            self.hub.models.lock().remove(&self.uid);
            // Surface the departure so a bus that never saw ModelExit can
            // apply crash semantics.
            let _ = self.hub.to_bus.send(Incoming::PeerClosed {
                model_uid: Some(self.uid),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_model_to_bus_and_back() {
        let bus = LoopbackEndpoint::create("loopback://pair-basic", 8_000_008, true)
            .expect("bus endpoint");
        let model =
            LoopbackEndpoint::create("loopback://pair-basic", 42, false).expect("model endpoint");

        model
            .send(
                Destination::Bus,
                Frame::ModelExit { model_uid: 42 },
            )
            .await
            .expect("send to bus");
        let incoming = bus.recv(Duration::from_millis(100)).await.expect("recv");
        assert_eq!(incoming, Incoming::Frame(Frame::ModelExit { model_uid: 42 }));

        bus.send(
            Destination::Model(42),
            Frame::Shutdown {
                reason: "done".into(),
            },
        )
        .await
        .expect("send to model");
        let incoming = model.recv(Duration::from_millis(100)).await.expect("recv");
        assert!(matches!(incoming, Incoming::Frame(Frame::Shutdown { .. })));

        bus.close().await.expect("close");
    }

    #[tokio::test]
    async fn model_close_surfaces_peer_closed() {
        let bus =
            LoopbackEndpoint::create("loopback://pair-close", 8_000_008, true).expect("bus");
        let model = LoopbackEndpoint::create("loopback://pair-close", 7, false).expect("model");
        model.close().await.expect("close model");
        let incoming = bus.recv(Duration::from_millis(100)).await.expect("recv");
        assert_eq!(incoming, Incoming::PeerClosed { model_uid: Some(7) });
        bus.close().await.expect("close bus");
    }

    #[tokio::test]
    async fn second_bus_endpoint_is_refused() {
        let _bus =
            LoopbackEndpoint::create("loopback://pair-dup", 8_000_008, true).expect("bus");
        let err = LoopbackEndpoint::create("loopback://pair-dup", 8_000_009, true)
            .expect_err("must refuse");
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
        _bus.close().await.expect("close");
    }
}
