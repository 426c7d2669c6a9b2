//! Wire framing for the node-to-node messaging fabric.
//!
//! Messages are framed as `(topic, payload-bytes)` where payload is a
//! canonical map-serialization (spec.md §4.2). Frames on the wire are a
//! `u32` big-endian length prefix followed by a JSON-encoded [`Envelope`],
//! the same length-prefix idiom the teacher's binary protocol uses in
//! `ws/protocol.rs`, just carrying a self-describing payload instead of a
//! fixed binary layout.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size accepted from a peer, guarding against a
/// corrupt/malicious length prefix causing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// One message on the wire: a topic name and a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| TransportError::Framing(format!("encode failed: {e}")))?;
        let len = u32::try_from(body.len())
            .map_err(|_| TransportError::Framing("payload too large to frame".to_string()))?;

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes)
            .map_err(|e| TransportError::Framing(format!("decode failed: {e}")))
    }
}

/// Write one length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let frame = envelope.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| TransportError::Send(e.to_string()))
}

/// Read one length-prefixed frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Envelope, TransportError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Framing(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Framing(format!(
            "frame of {len} bytes exceeds max of {MAX_FRAME_BYTES}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TransportError::Framing(e.to_string()))?;

    Envelope::decode(&body)
}
