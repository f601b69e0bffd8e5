//! Error types for the msgvault-core crate

use msgvault_crypto::CryptoError;
use msgvault_transport::TransportError;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while running transfers and managing tasks
#[derive(Error, Debug)]
pub enum CoreError {
    /// A single chunk kept failing until the retry bound was reached
    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkTransfer {
        index: u32,
        attempts: u32,
        #[source]
        source: Box<CoreError>,
    },

    /// A referenced remote object no longer exists
    #[error("remote object not found: {object_id}")]
    RemoteObjectNotFound { object_id: String },

    /// Downloaded bytes do not match the recorded checksum
    #[error("checksum mismatch{}: expected {expected}, got {actual}", chunk_label(.index))]
    ChecksumMismatch {
        index: Option<u32>,
        expected: String,
        actual: String,
    },

    /// Work stopped because the task was paused or cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The requested state change is not allowed from the current status
    #[error("cannot {action} task {task_id} while {status}")]
    InvalidTransition {
        task_id: String,
        status: String,
        action: &'static str,
    },

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// File manifest not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A streaming consumer gave up waiting for a chunk
    #[error("chunk {index} still unavailable after {attempts} waits")]
    ChunkUnavailable { index: u32, attempts: u32 },

    /// Deleting a file left remote objects behind
    #[error("{failed} of {total} remote objects could not be deleted: {first_error}")]
    DeleteIncomplete {
        failed: usize,
        total: usize,
        first_error: String,
    },

    /// A task worker stopped without reporting an outcome
    #[error("worker failed: {0}")]
    Worker(String),

    /// Stored or supplied data is inconsistent
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid engine configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Metadata store failure
    #[error("metadata store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn chunk_label(index: &Option<u32>) -> String {
    index.map(|i| format!(" in chunk {}", i)).unwrap_or_default()
}

impl CoreError {
    /// Whether a chunk operation failing with this error should be tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotFound { object_id } => Self::RemoteObjectNotFound { object_id },
            other => Self::Transport(other),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_remote_object_not_found() {
        let err: CoreError = TransportError::NotFound {
            object_id: "42".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::RemoteObjectNotFound { object_id } if object_id == "42"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(CoreError::from(TransportError::Connection("reset".into())).is_retryable());
        assert!(!CoreError::from(TransportError::EmptyCredentialPool).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
        assert!(CoreError::ChecksumMismatch {
            index: Some(1),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_chunk_transfer_message() {
        let err = CoreError::ChunkTransfer {
            index: 2,
            attempts: 3,
            source: Box::new(TransportError::Timeout { seconds: 30 }.into()),
        };
        assert_eq!(
            err.to_string(),
            "chunk 2 failed after 3 attempts: transport error: operation timed out after 30s"
        );
    }
}
