//! Length-prefixed framing for [`Message`] values.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (JSON payload)  |
//! +----------------+------------------+
//! ```
//!
//! Framing is delegated to [`LengthDelimitedCodec`]; this codec only adds the
//! JSON layer and the policy for payloads that fail to parse.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::length_delimited::LengthDelimitedCodecError;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::warn;

use crate::protocol::Message;

/// Maximum frame payload (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// What to do with a well-framed payload that is not a valid [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Log and continue with the next frame.
    #[default]
    Skip,
    /// Surface the error, which ends the stream.
    Fail,
}

#[derive(Debug)]
pub struct JsonRpcCodec {
    frames: LengthDelimitedCodec,
    max_len: usize,
    policy: MalformedPolicy,
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonRpcCodec {
    /// Codec for control connections: malformed payloads are dropped.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(MAX_MESSAGE_SIZE, MalformedPolicy::Skip)
    }

    /// Codec for worker links: a malformed payload ends the link.
    #[must_use]
    pub fn strict() -> Self {
        Self::with_limits(MAX_MESSAGE_SIZE, MalformedPolicy::Fail)
    }

    #[must_use]
    pub fn with_limits(max_len: usize, policy: MalformedPolicy) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_len)
            .new_codec();
        Self {
            frames,
            max_len,
            policy,
        }
    }

    fn frame_error(&self, err: io::Error) -> CodecError {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
        {
            CodecError::MessageTooLarge {
                max: self.max_len,
            }
        } else {
            CodecError::Io(err)
        }
    }
}

impl Decoder for JsonRpcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(frame) = self
                .frames
                .decode(src)
                .map_err(|e| self.frame_error(e))?
            else {
                return Ok(None);
            };

            match serde_json::from_slice::<Message>(&frame) {
                Ok(message) => return Ok(Some(message)),
                Err(e) if self.policy == MalformedPolicy::Skip => {
                    warn!("Dropping malformed frame ({} bytes): {e}", frame.len());
                }
                Err(e) => return Err(CodecError::Json(e)),
            }
        }
    }
}

impl Encoder<Message> for JsonRpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_len {
            return Err(CodecError::MessageTooLarge { max: self.max_len });
        }
        self.frames
            .encode(Bytes::from(payload), dst)
            .map_err(|e| self.frame_error(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large (max: {max} bytes)")]
    MessageTooLarge { max: usize },
}
