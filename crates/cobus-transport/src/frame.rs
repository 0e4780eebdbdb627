//! ---
//! cobus_section: "04-transport-endpoints"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Transport endpoints and protocol frame codec."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::TransportError;
use crate::Result;

/// Schema version carried by every encoded frame.
pub const FRAME_SCHEMA_VERSION: u16 = 1;

/// Upper bound on an encoded frame; larger length prefixes are treated as
/// stream corruption.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One scalar signal write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarWrite {
    /// Signal uid.
    pub uid: u32,
    /// Written value.
    pub value: f64,
}

/// One binary signal write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryWrite {
    /// Signal uid.
    pub uid: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// All writes one party submits for a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWrites {
    /// Channel name.
    pub channel: String,
    /// Scalar writes.
    #[serde(default)]
    pub scalars: Vec<ScalarWrite>,
    /// Binary writes.
    #[serde(default)]
    pub binaries: Vec<BinaryWrite>,
}

impl ChannelWrites {
    /// Empty write set for a channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            scalars: Vec::new(),
            binaries: Vec::new(),
        }
    }

    /// Whether the set carries no writes at all.
    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.binaries.is_empty()
    }
}

/// Name-to-uid resolution entry; `uid == 0` marks an unresolved name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalLookup {
    /// Signal name.
    pub name: String,
    /// Resolved uid, or 0 when requesting resolution.
    pub uid: u32,
}

/// Protocol frames exchanged between models and the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// Model announces itself on one channel; `token` requests an ack.
    ModelRegister {
        /// Channel being joined.
        channel: String,
        /// Model instance uid.
        model_uid: u32,
        /// Model instance name.
        model_name: String,
        /// Step size the model runs at.
        step_size: f64,
        /// Correlation token echoed in the ack.
        token: u32,
    },
    /// Bus acknowledges a registration.
    ModelRegisterAck {
        /// Channel that was joined.
        channel: String,
        /// Model instance uid.
        model_uid: u32,
        /// Echoed correlation token.
        token: u32,
    },
    /// Model requests signal name resolution on a channel.
    SignalIndex {
        /// Channel the signals belong to.
        channel: String,
        /// Model instance uid.
        model_uid: u32,
        /// Correlation token echoed in the ack.
        token: u32,
        /// Names to resolve (uid 0) or confirmed entries in the ack.
        lookups: Vec<SignalLookup>,
    },
    /// Bus answers a signal index request with resolved uids.
    SignalIndexAck {
        /// Channel the signals belong to.
        channel: String,
        /// Model instance uid the answer targets.
        model_uid: u32,
        /// Echoed correlation token.
        token: u32,
        /// Resolved entries.
        lookups: Vec<SignalLookup>,
    },
    /// Model finished its step: writes for the current cycle.
    ModelReady {
        /// Model instance uid.
        model_uid: u32,
        /// Model-local simulation time.
        model_time: f64,
        /// Writes per subscribed channel.
        writes: Vec<ChannelWrites>,
    },
    /// Bus releases the next step with the merged channel state.
    ModelStart {
        /// Global simulation time of the released cycle.
        model_time: f64,
        /// Step boundary models should run to.
        schedule_time: f64,
        /// Merged state per channel.
        channels: Vec<ChannelWrites>,
    },
    /// Model leaves the simulation.
    ModelExit {
        /// Model instance uid.
        model_uid: u32,
    },
    /// Supervising controller requests an orderly stop.
    Shutdown {
        /// Human-readable reason, logged by every receiver.
        reason: String,
    },
}

impl Frame {
    /// Frame kind as a static string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ModelRegister { .. } => "model_register",
            Frame::ModelRegisterAck { .. } => "model_register_ack",
            Frame::SignalIndex { .. } => "signal_index",
            Frame::SignalIndexAck { .. } => "signal_index_ack",
            Frame::ModelReady { .. } => "model_ready",
            Frame::ModelStart { .. } => "model_start",
            Frame::ModelExit { .. } => "model_exit",
            Frame::Shutdown { .. } => "shutdown",
        }
    }

    /// Uid of the model that originated the frame, when it carries one.
    pub fn source_uid(&self) -> Option<u32> {
        match self {
            Frame::ModelRegister { model_uid, .. }
            | Frame::ModelRegisterAck { model_uid, .. }
            | Frame::SignalIndex { model_uid, .. }
            | Frame::SignalIndexAck { model_uid, .. }
            | Frame::ModelReady { model_uid, .. }
            | Frame::ModelExit { model_uid } => Some(*model_uid),
            Frame::ModelStart { .. } | Frame::Shutdown { .. } => None,
        }
    }

    /// Encode the frame with its schema version.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let envelope = WireEnvelope {
            schema_version: FRAME_SCHEMA_VERSION,
            frame: self.clone(),
        };
        serde_cbor::to_vec(&envelope)
            .map_err(|err| TransportError::MalformedFrame(err.to_string()))
    }

    /// Decode an encoded frame, validating the schema version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: WireEnvelope = serde_cbor::from_slice(bytes)
            .map_err(|err| TransportError::MalformedFrame(err.to_string()))?;
        if envelope.schema_version != FRAME_SCHEMA_VERSION {
            return Err(TransportError::MalformedFrame(format!(
                "schema version {} unsupported (expected {})",
                envelope.schema_version, FRAME_SCHEMA_VERSION
            )));
        }
        Ok(envelope.frame)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    schema_version: u16,
    frame: Frame,
}

/// Write one length-prefixed frame to a stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode()?;
    let len = u32::try_from(body.len())
        .map_err(|_| TransportError::MalformedFrame("frame exceeds u32 length".into()))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame from a stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary; an EOF
/// inside a frame is reported as a malformed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::MalformedFrame(format!(
            "length prefix {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| TransportError::MalformedFrame(format!("truncated frame body: {err}")))?;
    Frame::decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ready() -> Frame {
        Frame::ModelReady {
            model_uid: 42,
            model_time: 0.005,
            writes: vec![ChannelWrites {
                channel: "binary_channel".into(),
                scalars: vec![ScalarWrite { uid: 7, value: 4.8 }],
                binaries: vec![BinaryWrite {
                    uid: 9,
                    data: b"one\0".to_vec(),
                }],
            }],
        }
    }

    #[test]
    fn encode_decode_roundtrip_preserves_frames() {
        let frame = sample_ready();
        let bytes = frame.encode().expect("encode");
        let decoded = Frame::decode(&bytes).expect("decode");
        assert_eq!(frame, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Frame::decode(b"not cbor at all").expect_err("must fail");
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn source_uid_is_present_on_model_frames_only() {
        assert_eq!(sample_ready().source_uid(), Some(42));
        let start = Frame::ModelStart {
            model_time: 0.0,
            schedule_time: 0.005,
            channels: Vec::new(),
        };
        assert_eq!(start.source_uid(), None);
    }

    #[tokio::test]
    async fn stream_framing_roundtrip() {
        let frame = sample_ready();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).await.expect("write");
        let mut cursor = std::io::Cursor::new(buffer);
        let decoded = read_frame(&mut cursor).await.expect("read");
        assert_eq!(decoded, Some(frame));
        // Clean EOF after the frame boundary.
        let end = read_frame(&mut cursor).await.expect("read eof");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let frame = sample_ready();
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).await.expect("write");
        buffer.truncate(buffer.len() - 2);
        let mut cursor = std::io::Cursor::new(buffer);
        let err = read_frame(&mut cursor).await.expect_err("must fail");
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }
}
