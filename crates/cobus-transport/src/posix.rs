//! ---
//! cobus_section: "04-transport-endpoints"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Transport endpoints and protocol frame codec."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{Destination, Endpoint, Inbox, Incoming, TransportError};
use crate::frame::Frame;
use crate::Result;

/// Portable POSIX defaults: `msgsize_max` is commonly 8192 and `msg_max` 10,
/// and exceeding either requires privileges. Frames above the message size
/// are rejected at send time.
const MAX_MSG_LEN: usize = 8192;
const QUEUE_CAPACITY: usize = 8;
/// Poll interval of the blocking receive thread; bounds shutdown latency.
const RECV_POLL: Duration = Duration::from_millis(200);

fn queue_base(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("posix://")
        .ok_or_else(|| TransportError::UnsupportedScheme(uri.into()))?;
    let name = rest.trim_start_matches('/');
    if name.is_empty() {
        return Err(TransportError::UnsupportedScheme(uri.into()));
    }
    Ok(format!("/{name}"))
}

fn bus_queue(base: &str) -> String {
    format!("{base}-bus")
}

fn model_queue(base: &str, uid: u32) -> String {
    format!("{base}-model-{uid}")
}

/// POSIX message queue endpoint over `posix:///name`.
///
/// Each party owns one receive queue: the bus `/name-bus`, each model
/// `/name-model-<uid>`. Broadcast is a fan-out over the notify peers the
/// coordinator registered; queue handles for peers are opened lazily and
/// cached. Blocking queue operations run on the blocking thread pool.
#[derive(Debug)]
pub struct PosixMqEndpoint {
    base: String,
    uid: u32,
    bus_mode: bool,
    inbox: Inbox,
    stop: Arc<AtomicBool>,
    peers: Mutex<HashSet<u32>>,
    writers: Mutex<HashMap<String, Arc<posixmq::PosixMq>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PosixMqEndpoint {
    /// Create an endpoint for `posix:///name`.
    pub fn create(uri: &str, uid: u32, bus_mode: bool, _timeout: Duration) -> Result<Self> {
        Ok(Self {
            base: queue_base(uri)?,
            uid,
            bus_mode,
            inbox: Inbox::new(),
            stop: Arc::new(AtomicBool::new(false)),
            peers: Mutex::new(HashSet::new()),
            writers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn own_queue(&self) -> String {
        if self.bus_mode {
            bus_queue(&self.base)
        } else {
            model_queue(&self.base, self.uid)
        }
    }

    fn writer(&self, name: &str) -> Result<Arc<posixmq::PosixMq>> {
        let mut writers = self.writers.lock();
        if let Some(mq) = writers.get(name) {
            return Ok(mq.clone());
        }
        let mq = posixmq::OpenOptions::writeonly()
            .create()
            .capacity(QUEUE_CAPACITY)
            .max_msg_len(MAX_MSG_LEN)
            .open(name)?;
        let mq = Arc::new(mq);
        writers.insert(name.to_owned(), mq.clone());
        Ok(mq)
    }

    async fn send_to_queue(&self, name: String, payload: Arc<Vec<u8>>) -> Result<()> {
        let mq = self.writer(&name)?;
        tokio::task::spawn_blocking(move || mq.send(0, &payload))
            .await
            .map_err(|_| TransportError::Closed)??;
        Ok(())
    }
}

#[async_trait]
impl Endpoint for PosixMqEndpoint {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    async fn start(&self) -> Result<()> {
        let queue_name = self.own_queue();
        let mq = posixmq::OpenOptions::readonly()
            .create()
            .capacity(QUEUE_CAPACITY)
            .max_msg_len(MAX_MSG_LEN)
            .open(&queue_name)
            .map_err(|err| TransportError::ConnectionRefused {
                uri: format!("posix://{}", self.base),
                reason: err.to_string(),
            })?;
        info!(queue = %queue_name, "message queue opened");

        let stop = self.stop.clone();
        let inbox_tx = self.inbox.sender();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; MAX_MSG_LEN];
            while !stop.load(Ordering::Relaxed) {
                match mq.recv_timeout(&mut buffer, RECV_POLL) {
                    Ok((_priority, length)) => match Frame::decode(&buffer[..length]) {
                        Ok(frame) => {
                            if inbox_tx.send(Incoming::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "malformed queue frame dropped");
                        }
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(err) => {
                        warn!(error = %err, "message queue receive failed; stopping reader");
                        break;
                    }
                }
            }
            debug!(queue = %queue_name, "queue reader stopped");
        });
        self.tasks.lock().push(reader_task);
        Ok(())
    }

    async fn send(&self, destination: Destination, frame: Frame) -> Result<()> {
        let payload = Arc::new(frame.encode()?);
        if payload.len() > MAX_MSG_LEN {
            return Err(TransportError::MalformedFrame(format!(
                "frame of {} bytes exceeds queue message size {MAX_MSG_LEN}",
                payload.len()
            )));
        }
        match (self.bus_mode, destination) {
            (false, Destination::Bus) => self.send_to_queue(bus_queue(&self.base), payload).await,
            (true, Destination::Model(uid)) => {
                self.send_to_queue(model_queue(&self.base, uid), payload)
                    .await
            }
            (true, Destination::Broadcast) => {
                let peers: Vec<u32> = self.peers.lock().iter().copied().collect();
                for uid in peers {
                    if let Err(err) = self
                        .send_to_queue(model_queue(&self.base, uid), payload.clone())
                        .await
                    {
                        warn!(model_uid = uid, error = %err, "broadcast to model queue failed");
                    }
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

    fn register_notify_peer(&self, model_uid: u32) {
        self.peers.lock().insert(model_uid);
    }

    async fn close(&self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.writers.lock().clear();
        let queue_name = self.own_queue();
        if let Err(err) = posixmq::remove_queue(&queue_name) {
            debug!(queue = %queue_name, error = %err, "queue unlink skipped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_derive_from_uri() {
        assert_eq!(queue_base("posix:///cobus").expect("base"), "/cobus");
        assert_eq!(bus_queue("/cobus"), "/cobus-bus");
        assert_eq!(model_queue("/cobus", 42), "/cobus-model-42");
        assert!(queue_base("posix://").is_err());
    }

    #[tokio::test]
    async fn frames_roundtrip_over_the_queue() {
        // Queue creation can be restricted in minimal environments; skip
        // rather than fail when the kernel refuses.
        let base_uri = format!("posix:///cobus-test-{}", std::process::id());
        let bus = PosixMqEndpoint::create(&base_uri, 8_000_008, true, Duration::from_secs(1))
            .expect("bus endpoint");
        if bus.start().await.is_err() {
            return;
        }
        let model =
            PosixMqEndpoint::create(&base_uri, 42, false, Duration::from_secs(1)).expect("model");
        model.start().await.expect("start model");

        model
            .send(Destination::Bus, Frame::ModelExit { model_uid: 42 })
            .await
            .expect("send");
        let incoming = bus.recv(Duration::from_secs(2)).await.expect("recv");
        assert_eq!(incoming, Incoming::Frame(Frame::ModelExit { model_uid: 42 }));

        bus.register_notify_peer(42);
        bus.send(
            Destination::Broadcast,
            Frame::Shutdown {
                reason: "test".into(),
            },
        )
        .await
        .expect("broadcast");
        let incoming = model.recv(Duration::from_secs(2)).await.expect("recv");
        assert!(matches!(incoming, Incoming::Frame(Frame::Shutdown { .. })));

        model.close().await.expect("close model");
        bus.close().await.expect("close bus");
    }
}
