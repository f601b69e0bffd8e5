//! Error types for the msgvault-transport crate

use thiserror::Error;

/// Result type alias using `TransportError`
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur talking to the remote backend or shaping chunks
#[derive(Error, Debug)]
pub enum TransportError {
    /// Remote object does not exist (deleted or never stored)
    #[error("remote object not found: {object_id}")]
    NotFound { object_id: String },

    /// Credential is not allowed to touch the object
    #[error("credential {credential_id} is not authorized for {object_id}")]
    Unauthorized {
        credential_id: String,
        object_id: String,
    },

    /// Payload exceeds the per-message limit of the backend
    #[error("payload too large: {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Credential pool has no members
    #[error("credential pool is empty")]
    EmptyCredentialPool,

    /// A chunk references a credential that nobody can resolve
    #[error("unknown credential: {0}")]
    UnknownCredential(String),

    /// Reassembly found a gap in the chunk sequence
    #[error("missing chunk {index}")]
    MissingChunk { index: u32 },

    /// Chunk size must be non-zero
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    /// The file would need more chunks than an index can address
    #[error("{total_size} bytes in {chunk_size}-byte chunks exceeds the chunk index range")]
    TooManyChunks { total_size: u64, chunk_size: u64 },

    /// Chunk index outside the plan
    #[error("chunk index {index} out of range for {count} chunks")]
    ChunkOutOfRange { index: u32, count: u32 },

    /// Connection-level failure, worth retrying
    #[error("connection error: {0}")]
    Connection(String),

    /// Backend asked us to slow down
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Timeout error
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the operation may succeed if simply tried again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the referenced object is gone for good
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::Connection("reset".into()).is_retryable());
        assert!(TransportError::Timeout { seconds: 30 }.is_retryable());
        assert!(!TransportError::NotFound { object_id: "1".into() }.is_retryable());
        assert!(!TransportError::EmptyCredentialPool.is_retryable());
        assert!(!TransportError::PayloadTooLarge { size: 2, max: 1 }.is_retryable());
    }
}
