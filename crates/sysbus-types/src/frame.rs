//! # Wire Framing
//!
//! Frame layout:
//!
//! ```text
//! +----------------+-----------------------------------------+
//! | length: u32 BE | bincode({ version: u16, message })      |
//! +----------------+-----------------------------------------+
//! ```
//!
//! The version is checked before the message is handed to the bus.

use crate::errors::FrameError;
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Default maximum body size (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct WireFrameRef<'a> {
    version: u16,
    message: &'a Message,
}

#[derive(Deserialize)]
struct WireFrame {
    version: u16,
    message: Message,
}

/// Encodes and decodes frames with a body size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    /// Create a codec accepting bodies up to `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Maximum accepted body size.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode one message into a length-prefixed frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes, FrameError> {
        let body = bincode::serialize(&WireFrameRef {
            version: PROTOCOL_VERSION,
            message,
        })
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

        if body.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                size: body.len(),
                limit: self.max_frame_bytes,
            });
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode exactly one complete frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, FrameError> {
        if frame.len() < LENGTH_PREFIX {
            return Err(FrameError::Truncated {
                expected: LENGTH_PREFIX,
                actual: frame.len(),
            });
        }
        let (prefix, body) = frame.split_at(LENGTH_PREFIX);
        let announced = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        self.check_size(announced)?;
        if body.len() < announced {
            return Err(FrameError::Truncated {
                expected: announced,
                actual: body.len(),
            });
        }
        if body.len() > announced {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after frame",
                body.len() - announced
            )));
        }
        Self::decode_body(body)
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Message, FrameError> {
        // The version is the leading u16 of the body in bincode's fixed-int layout.
        if body.len() < 2 {
            return Err(FrameError::Truncated {
                expected: 2,
                actual: body.len(),
            });
        }
        let version = u16::from_le_bytes([body[0], body[1]]);
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion {
                received: version,
                supported: PROTOCOL_VERSION,
            });
        }

        let frame: WireFrame =
            bincode::deserialize(body).map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok(frame.message)
    }
}

/// Incremental decoder for byte-stream transports.
///
/// Feed received bytes into a `BytesMut` and call [`FrameDecoder::decode_next`]
/// until it returns `Ok(None)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
}

impl FrameDecoder {
    /// Create a decoder using `codec`'s size limit.
    #[must_use]
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec }
    }

    /// Extract the next complete frame from `buf`, if one is buffered.
    ///
    /// Bytes of a rejected frame are consumed so decoding can resume at the next frame.
    pub fn decode_next(&self, buf: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let announced = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if let Err(e) = self.codec.check_size(announced) {
            // The stream cannot be resynchronised past an oversized length.
            buf.clear();
            return Err(e);
        }
        if buf.len() < LENGTH_PREFIX + announced {
            buf.reserve(LENGTH_PREFIX + announced - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(announced);
        FrameCodec::decode_body(&body).map(Some)
    }
}
