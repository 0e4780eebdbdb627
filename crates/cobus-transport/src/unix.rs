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
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::{Destination, Endpoint, Inbox, Incoming, TransportError};
use crate::frame::{read_frame, write_frame, Frame};
use crate::Result;

const ACCEPT_ERROR_LIMIT: u32 = 10;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

fn socket_path(uri: &str) -> Result<PathBuf> {
    let rest = uri
        .strip_prefix("unix://")
        .ok_or_else(|| TransportError::UnsupportedScheme(uri.into()))?;
    if rest.is_empty() {
        return Err(TransportError::UnsupportedScheme(uri.into()));
    }
    Ok(PathBuf::from(rest))
}

type PeerWriters = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Frame>>>>;

/// Local stream socket endpoint.
///
/// The bus side binds a listener and serves one reader/writer task pair per
/// connected model; the model side dials the socket with bounded retries.
/// Peer EOF is surfaced as [`Incoming::PeerClosed`] so the coordinator can
/// apply crash semantics immediately.
#[derive(Debug)]
pub struct UnixEndpoint {
    path: PathBuf,
    uid: u32,
    bus_mode: bool,
    timeout: Duration,
    inbox: Inbox,
    peers: PeerWriters,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnixEndpoint {
    /// Create an endpoint for `unix:///path`.
    pub fn create(uri: &str, uid: u32, bus_mode: bool, timeout: Duration) -> Result<Self> {
        Ok(Self {
            path: socket_path(uri)?,
            uid,
            bus_mode,
            timeout,
            inbox: Inbox::new(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn start_bus(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "bus socket listening");

        let inbox_tx = self.inbox.sender();
        let peers = self.peers.clone();
        let accept_task = tokio::spawn(async move {
            let mut error_count = 0u32;
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        error_count = 0;
                        debug!("model connected to bus socket");
                        spawn_connection(stream, inbox_tx.clone(), peers.clone());
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept bus connection");
                        error_count += 1;
                        if error_count > ACCEPT_ERROR_LIMIT {
                            error!("too many consecutive accept errors; stopping listener");
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.tasks.lock().push(accept_task);
        Ok(())
    }

    async fn start_model(&self) -> Result<()> {
        let started = tokio::time::Instant::now();
        let stream = loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => break stream,
                Err(err) if started.elapsed() < self.timeout => {
                    debug!(path = %self.path.display(), error = %err, "bus socket not ready; retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => {
                    return Err(TransportError::ConnectionRefused {
                        uri: format!("unix://{}", self.path.display()),
                        reason: err.to_string(),
                    });
                }
            }
        };
        info!(path = %self.path.display(), model_uid = self.uid, "connected to bus socket");

        let (mut read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        let writer_task = tokio::spawn(write_loop(write_half, out_rx));

        let inbox_tx = self.inbox.sender();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if inbox_tx.send(Incoming::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = inbox_tx.send(Incoming::PeerClosed { model_uid: None });
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "bus stream failed");
                        let _ = inbox_tx.send(Incoming::PeerClosed { model_uid: None });
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(writer_task);
        tasks.push(reader_task);
        Ok(())
    }
}

/// Serve one accepted model connection: a writer task draining the outbound
/// queue and a reader loop feeding the shared inbox. The peer's uid becomes
/// known with its first attributable frame, at which point the writer is
/// published for directed sends.
fn spawn_connection(
    stream: UnixStream,
    inbox_tx: mpsc::UnboundedSender<Incoming>,
    peers: PeerWriters,
) {
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, out_rx));
    tokio::spawn(async move {
        let mut peer_uid: Option<u32> = None;
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(frame)) => {
                    if peer_uid.is_none() {
                        if let Some(uid) = frame.source_uid() {
                            peers.lock().insert(uid, out_tx.clone());
                            peer_uid = Some(uid);
                        }
                    }
                    if inbox_tx.send(Incoming::Frame(frame)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(model_uid = ?peer_uid, "model stream closed");
                    let _ = inbox_tx.send(Incoming::PeerClosed { model_uid: peer_uid });
                    break;
                }
                Err(err) => {
                    // Malformed input is fatal for this connection only.
                    warn!(model_uid = ?peer_uid, error = %err, "dropping model connection");
                    let _ = inbox_tx.send(Incoming::PeerClosed { model_uid: peer_uid });
                    break;
                }
            }
        }
        if let Some(uid) = peer_uid {
            peers.lock().remove(&uid);
        }
    });
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            warn!(error = %err, "stream write failed; stopping writer");
            break;
        }
    }
}

#[async_trait]
impl Endpoint for UnixEndpoint {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    async fn start(&self) -> Result<()> {
        if self.bus_mode {
            self.start_bus().await
        } else {
            self.start_model().await
        }
    }

    async fn send(&self, destination: Destination, frame: Frame) -> Result<()> {
        match (self.bus_mode, destination) {
            (false, Destination::Bus) => {
                let outbound = self.outbound.lock();
                let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
                tx.send(frame).map_err(|_| TransportError::Closed)
            }
            (true, Destination::Model(uid)) => {
                let peers = self.peers.lock();
                match peers.get(&uid) {
                    Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
                    None => {
                        warn!(model_uid = uid, "send to unknown model dropped");
                        Ok(())
                    }
                }
            }
            (true, Destination::Broadcast) => {
                let peers = self.peers.lock();
                for tx in peers.values() {
                    let _ = tx.send(frame.clone());
                }
                Ok(())
            }
            (_, destination) => {
                warn!(?destination, bus_mode = self.bus_mode, "destination rejected");
                Err(TransportError::Unsupported(
                    "destination not served by this endpoint side",
                ))
            }
        }
    }

    async fn recv(&self, timeout: Duration) -> Result<Incoming> {
        self.inbox.recv(timeout).await
    }

    fn register_notify_peer(&self, _model_uid: u32) {
        // Directed writers are published when the peer's first frame arrives.
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.outbound.lock() = None;
        if self.bus_mode && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        Ok(())
    }
}
