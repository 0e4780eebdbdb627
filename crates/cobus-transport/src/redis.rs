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
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{Destination, Endpoint, Inbox, Incoming, TransportError};
use crate::frame::Frame;
use crate::Result;

/// Topic the bus consumes; every model publishes here.
const TOPIC_BUS: &str = "cobus.bus";
/// Topic every model subscribes to for merged-state broadcasts.
const TOPIC_NOTIFY: &str = "cobus.notify";

fn model_topic(uid: u32) -> String {
    format!("cobus.model.{uid}")
}

fn topic_for(bus_mode: bool, destination: Destination) -> Result<String> {
    match (bus_mode, destination) {
        (false, Destination::Bus) => Ok(TOPIC_BUS.to_owned()),
        (true, Destination::Model(uid)) => Ok(model_topic(uid)),
        (true, Destination::Broadcast) => Ok(TOPIC_NOTIFY.to_owned()),
        _ => Err(TransportError::Unsupported(
            "destination not served by this endpoint side",
        )),
    }
}

/// Broker pub/sub endpoint over `redis://host[:port]`.
///
/// Point-to-multipoint comes for free from the broker: the bus publishes
/// merged state on a notify topic all models subscribe to, and answers
/// handshakes on per-model topics. Peer disconnects are invisible to a
/// broker transport, so crash semantics rely on the protocol (`ModelExit`)
/// and on timeouts.
#[derive(Debug)]
pub struct RedisEndpoint {
    uri: String,
    uid: u32,
    bus_mode: bool,
    inbox: Inbox,
    client: redis::Client,
    publish: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisEndpoint {
    /// Create an endpoint for the broker at `uri`.
    pub fn create(uri: &str, uid: u32, bus_mode: bool, _timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(uri)?;
        Ok(Self {
            uri: uri.to_owned(),
            uid,
            bus_mode,
            inbox: Inbox::new(),
            client,
            publish: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn subscriptions(&self) -> Vec<String> {
        if self.bus_mode {
            vec![TOPIC_BUS.to_owned()]
        } else {
            vec![TOPIC_NOTIFY.to_owned(), model_topic(self.uid)]
        }
    }
}

#[async_trait]
impl Endpoint for RedisEndpoint {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    async fn start(&self) -> Result<()> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| TransportError::ConnectionRefused {
                uri: self.uri.clone(),
                reason: err.to_string(),
            })?;
        *self.publish.lock().await = Some(connection);

        let mut pubsub =
            self.client
                .get_async_pubsub()
                .await
                .map_err(|err| TransportError::ConnectionRefused {
                    uri: self.uri.clone(),
                    reason: err.to_string(),
                })?;
        let topics = self.subscriptions();
        for topic in &topics {
            pubsub.subscribe(topic).await?;
        }
        info!(uri = %self.uri, ?topics, "broker subscriptions established");

        let inbox_tx = self.inbox.sender();
        let reader_task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "unreadable broker payload dropped");
                        continue;
                    }
                };
                match Frame::decode(&payload) {
                    Ok(frame) => {
                        if inbox_tx.send(Incoming::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed broker frame dropped");
                    }
                }
            }
            debug!("broker subscription stream ended");
        });
        self.tasks.lock().push(reader_task);
        Ok(())
    }

    async fn send(&self, destination: Destination, frame: Frame) -> Result<()> {
        let topic = topic_for(self.bus_mode, destination)?;
        let payload = frame.encode()?;
        let mut guard = self.publish.lock().await;
        let connection = guard.as_mut().ok_or(TransportError::Closed)?;
        connection.publish::<_, _, ()>(topic, payload).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Incoming> {
        self.inbox.recv(timeout).await
    }

    fn register_notify_peer(&self, _model_uid: u32) {
        // Broadcast is native on the notify topic.
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.publish.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_endpoint_side() {
        assert_eq!(topic_for(false, Destination::Bus).expect("topic"), TOPIC_BUS);
        assert_eq!(
            topic_for(true, Destination::Model(42)).expect("topic"),
            "cobus.model.42"
        );
        assert_eq!(
            topic_for(true, Destination::Broadcast).expect("topic"),
            TOPIC_NOTIFY
        );
        assert!(topic_for(false, Destination::Broadcast).is_err());
    }

    #[test]
    fn invalid_broker_uri_is_rejected_at_create() {
        let err = RedisEndpoint::create("redis://host:not_a_port", 1, false, Duration::from_secs(1))
            .err()
            .expect("must fail");
        assert!(matches!(err, TransportError::Broker(_)));
    }
}
