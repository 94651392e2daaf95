//! Protocol error types
//!
//! All frame-layer errors are non-retryable: the link that produced one is
//! marked unhealthy by its owner.

use crate::frame::MessageKind;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Fewer than 21 bytes were available where a header was expected.
    #[error("Frame header too short: {0} bytes")]
    ShortHeader(usize),

    /// The header declared a payload larger than the configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u32 },

    /// The header carried a message kind outside the known range.
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    /// The payload bytes did not decode as the record for this kind.
    #[error("Payload decode failed for {kind:?}: {reason}")]
    PayloadDecode { kind: MessageKind, reason: String },

    /// A payload record failed to serialize.
    #[error("Payload encode failed for {kind:?}: {reason}")]
    PayloadEncode { kind: MessageKind, reason: String },

    /// Underlying transport error surfaced through the codec.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
