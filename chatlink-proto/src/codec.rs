//! Text encoding for [`Frame`]s.
//!
//! Frames travel as JSON text messages; one transport message carries
//! exactly one frame, so no additional framing is needed.

use crate::frame::Frame;

/// Maximum accepted size of an inbound frame (1 MiB; images are inline).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The payload is not a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The payload exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes a [`Frame`] as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`Frame`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` for oversized input and
/// `CodecError::Malformed` if the text is not a known frame.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}
