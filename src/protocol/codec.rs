//! Length-prefixed framing for the Hive Protocol.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON-encoded
//! [`HiveMessage`]. Partial reads and writes are absorbed by the
//! underlying [`LengthDelimitedCodec`].

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::message::HiveMessage;

/// Connection-level protocol failures. Any of these closes the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unexpected {0} message")]
    UnexpectedMessage(String),

    #[error("incompatible cluster epoch: expected {expected}, got {got}")]
    IncompatibleEpoch { expected: u64, got: u64 },

    #[error("incompatible version: expected {expected}, got {got}")]
    IncompatibleVersion { expected: u16, got: u16 },

    #[error("invalid capacity {0}")]
    InvalidCapacity(u32),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec turning a byte stream into [`HiveMessage`]s.
#[derive(Debug)]
pub struct HiveCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl HiveCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for HiveCodec {
    fn default() -> Self {
        Self::new(crate::config::ProtocolConfig::default().max_frame_bytes)
    }
}

impl Decoder for HiveCodec {
    type Item = HiveMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HiveMessage>, ProtocolError> {
        let frame = match self.inner.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if is_length_error(&e) => {
                return Err(ProtocolError::FrameTooLarge {
                    max: self.max_frame_bytes,
                })
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl Encoder<HiveMessage> for HiveCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: HiveMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload =
            serde_json::to_vec(&msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if payload.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                max: self.max_frame_bytes,
            });
        }
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

fn is_length_error(e: &std::io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}
