//! Length-prefixed, checksummed frames for replication connections.
//!
//! Every message exchanged between two nodes (handshake, syncup, and the
//! log stream itself) travels in one frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: Big-endian u32 of payload size (excludes header)
//! - **Checksum**: CRC32 of the payload
//! - **Payload**: bincode-serialized message
//!
//! The codec is generic over any serde type. The decoder is incremental so
//! the same code serves in-memory channels (whole frames) and TCP streams
//! (arbitrary fragments).

use std::io::{self, Read};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while framing messages.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    /// A zero-length frame was received.
    #[error("empty frame")]
    EmptyFrame,

    /// Payload checksum doesn't match the header.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Failed to deserialize the payload.
    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// Failed to serialize the payload.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// The stream ended inside a frame.
    #[error("truncated frame: have {have} bytes, need {need} more")]
    Truncated { have: usize, need: usize },
}

impl FramingError {
    /// Returns true if the connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FramingError::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes messages into frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    max_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Creates an encoder with the default size limit.
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Creates an encoder with a custom size limit.
    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size > 0, "max_size must be positive");
        Self { max_size }
    }

    /// Encodes `message` into a complete frame.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, FramingError> {
        let payload =
            bincode::serialize(message).map_err(|e| FramingError::Serialize(e.to_string()))?;

        let length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= self.max_size)
            .ok_or(FramingError::FrameTooLarge {
                size: payload.len(),
                max: self.max_size,
            })?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);

        debug_assert_eq!(frame.len(), HEADER_SIZE + payload.len());
        Ok(frame)
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Incremental frame decoder.
///
/// Feed bytes with [`FrameDecoder::extend`] and pull messages with
/// [`FrameDecoder::decode`] until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    max_size: u32,
    buffer: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder with a custom size limit.
    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size > 0, "max_size must be positive");
        Self {
            max_size,
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of bytes still missing from the current frame.
    pub fn bytes_needed(&self) -> usize {
        match self.peek_length() {
            Some(length) => (HEADER_SIZE + length).saturating_sub(self.buffer.len()),
            None => HEADER_SIZE - self.buffer.len(),
        }
    }

    fn peek_length(&self) -> Option<usize> {
        let header: [u8; 4] = self.buffer.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    /// Attempts to decode one message from the buffer.
    ///
    /// Returns `Ok(None)` if a complete frame has not arrived yet. Consumed
    /// bytes are removed from the buffer only on success.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FramingError> {
        let Some(length) = self.peek_length() else {
            return Ok(None);
        };
        if length > self.max_size as usize {
            return Err(FramingError::FrameTooLarge {
                size: length,
                max: self.max_size,
            });
        }
        if length == 0 {
            return Err(FramingError::EmptyFrame);
        }
        let total = HEADER_SIZE + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let expected = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]);
        let payload = &self.buffer[HEADER_SIZE..total];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(FramingError::ChecksumMismatch { expected, actual });
        }

        let message =
            bincode::deserialize(payload).map_err(|e| FramingError::Deserialize(e.to_string()))?;
        self.buffer.drain(..total);
        Ok(Some(message))
    }

    /// Reads from `reader` once and decodes a message if one is complete.
    ///
    /// `WouldBlock` and `TimedOut` from a reader with a read timeout are
    /// reported as `Ok(None)`.
    pub fn read_message<R: Read, T: DeserializeOwned>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<T>, FramingError> {
        if let Some(message) = self.decode()? {
            return Ok(Some(message));
        }

        let mut chunk = [0u8; 8192];
        match reader.read(&mut chunk) {
            Ok(0) => Err(FramingError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                if self.buffer.is_empty() {
                    "connection closed".to_string()
                } else {
                    FramingError::Truncated {
                        have: self.buffer.len(),
                        need: self.bytes_needed(),
                    }
                    .to_string()
                },
            ))),
            Ok(n) => {
                self.extend(&chunk[..n]);
                self.decode()
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(FramingError::Io(e)),
        }
    }

    /// Discards any buffered data.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
