//! Frame encoding and decoding.
//!
//! Every message on either transport is one frame:
//!
//! ```text
//! +------------------+------------------+---------------------+
//! | Length           | Tag              | Payload             |
//! | 4 bytes (LE i32) | 4 bytes (LE i32) | `length` bytes      |
//! +------------------+------------------+---------------------+
//! ```
//!
//! Tag 0 marks a notification. Any other tag is either a request the peer
//! is waiting on, or the response to one of ours.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::NetResult;
use crate::core::constants::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, NOTIFICATION_TAG};

/// Errors that can occur during frame parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Length field is negative.
    #[error("negative frame length: {0}")]
    NegativeLength(i32),

    /// Payload exceeds the wire bound.
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge {
        /// Declared or attempted payload size.
        size: usize,
    },

    /// Not enough bytes for a header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Datagram size disagrees with its length field.
    #[error("length mismatch: header says {declared}, but {actual} payload bytes present")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
    },
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Declared payload length.
    pub length: i32,
    /// Transaction tag (0 for notifications).
    pub tag: i32,
}

impl FrameHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    /// Parse header from bytes.
    ///
    /// Only the size of `bytes` is checked; use [`FrameHeader::payload_len`]
    /// to validate the length field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tag = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        Ok(Self { length, tag })
    }

    /// Validated payload length.
    pub fn payload_len(&self) -> Result<usize, FrameError> {
        validate_length(self.length)
    }
}

fn validate_length(length: i32) -> Result<usize, FrameError> {
    let size = usize::try_from(length).map_err(|_| FrameError::NegativeLength(length))?;
    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { size });
    }
    Ok(size)
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transaction tag (0 for notifications).
    pub tag: i32,
    /// Message body.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with an explicit tag.
    pub fn new(tag: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Create a notification frame.
    pub fn notification(payload: impl Into<Bytes>) -> Self {
        Self::new(NOTIFICATION_TAG, payload)
    }

    /// Check if this frame is a notification.
    pub fn is_notification(&self) -> bool {
        self.tag == NOTIFICATION_TAG
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode_frame(self.tag, &self.payload)
    }

    /// Decode a frame carried in a single datagram.
    ///
    /// The datagram must hold exactly one header and the declared payload.
    pub fn decode_datagram(data: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::from_bytes(data)?;
        let declared = header.payload_len()?;
        let actual = data.len() - FRAME_HEADER_SIZE;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            tag: header.tag,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..]),
        })
    }
}

/// Encode a frame from its parts.
///
/// Used for notifications (tag 0), requests (freshly allocated tag) and
/// responses (tag echoed from the request) alike.
pub fn encode_frame(tag: i32, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
        });
    }

    let header = FrameHeader {
        // Bounded by MAX_PAYLOAD_SIZE above, so the cast cannot truncate.
        length: payload.len() as i32,
        tag,
    };

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame from a byte stream.
///
/// Short reads are retried until the frame is complete. A peer that closes
/// mid-frame yields an `UnexpectedEof` I/O error; a bad length field yields a
/// [`FrameError`]. Either way the stream is no longer usable.
pub async fn read_frame<R>(reader: &mut R) -> NetResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut word = [0u8; 4];

    reader.read_exact(&mut word).await?;
    let len = validate_length(i32::from_le_bytes(word))?;

    reader.read_exact(&mut word).await?;
    let tag = i32::from_le_bytes(word);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        tag,
        payload: Bytes::from(payload),
    })
}
