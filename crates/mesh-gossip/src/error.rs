use mesh_core::MeshError;
use thiserror::Error;

/// Wire decoding failures. A bad message is rejected on its own and never
/// tears down the receive pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated buffer: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),

    #[error("unknown priority tag {0}")]
    UnknownPriority(u8),

    #[error("invalid UTF-8 in field '{0}'")]
    InvalidUtf8(&'static str),

    #[error("field '{field}' out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: u64 },

    #[error("payload length mismatch: header says {declared}, decoder consumed {consumed}")]
    PayloadMismatch { declared: usize, consumed: usize },
}

impl From<CodecError> for MeshError {
    fn from(e: CodecError) -> Self {
        MeshError::Decode(e.to_string())
    }
}
