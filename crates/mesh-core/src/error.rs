use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("mesh unreachable")]
    MeshUnreachable,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Whether a failed sync operation may be retried with backoff.
    ///
    /// Security and data-shape failures are terminal for the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::TransientIo(_)
            | MeshError::Timeout(_)
            | MeshError::Io(_)
            | MeshError::Storage(_)
            | MeshError::MeshUnreachable
            | MeshError::Other(_) => true,
            MeshError::QuotaExceeded { .. }
            | MeshError::NotFound(_)
            | MeshError::Decode(_)
            | MeshError::Permission(_)
            | MeshError::Crypto(_)
            | MeshError::Config(_)
            | MeshError::InvalidState(_)
            | MeshError::Cancelled => false,
        }
    }
}
