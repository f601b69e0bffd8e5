//! # msgvault Transport
//!
//! The remote-object layer of msgvault: a messaging backend that stores one
//! attachment per message, with a hard per-message size limit and
//! credential-scoped retrieval.
//!
//! This crate provides:
//! - **RemoteTransport trait**: store, retrieve and delete one blob
//! - **Credentials**: upload identities and round-robin rotation across chunks
//! - **Chunking**: fixed-size split and in-order reassembly
//! - **Backends**: in-memory (tests) and directory-backed (local use)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TransferCoordinator (core)        │
//! ├─────────────────────────────────────────┤
//! │   CredentialRotator   │   ChunkPlan     │
//! ├─────────────────────────────────────────┤
//! │         RemoteTransport Trait           │
//! ├────────────────────┬────────────────────┤
//! │  MemoryTransport   │ DirectoryTransport │
//! └────────────────────┴────────────────────┘
//! ```

pub mod chunker;
pub mod credential;
pub mod directory;
pub mod error;
pub mod memory;

pub use chunker::{
    read_chunk, reassemble, reassemble_files, split, Chunk, ChunkPlan, ChunkReader, Reassembled,
    DEFAULT_CHUNK_SIZE,
};
pub use credential::{
    Credential, CredentialId, CredentialPool, CredentialRotator, SharedCredentialPool,
};
pub use directory::DirectoryTransport;
pub use error::{Result, TransportError};
pub use memory::MemoryTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest attachment the reference backend accepts per message (20 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 20 * 1024 * 1024;

/// Byte-level progress of one blob retrieval: `(received, total)`
pub type BlobProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Identifier of one stored message on the remote backend
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObjectId(String);

impl RemoteObjectId {
    /// Create an id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteObjectId({})", self.0)
    }
}

impl fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for remote transport backends
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Largest payload a single `store_blob` call accepts
    fn max_payload_size(&self) -> usize;

    /// Store one blob as a new message owned by `credential`
    async fn store_blob(&self, credential: &Credential, payload: Bytes) -> Result<RemoteObjectId>;

    /// Fetch a blob; only the storing credential is authorized
    async fn retrieve_blob(
        &self,
        credential: &Credential,
        object_id: &RemoteObjectId,
        progress: Option<BlobProgress<'_>>,
    ) -> Result<Bytes>;

    /// Delete a blob, returning whether it existed
    async fn delete_object(&self, credential: &Credential, object_id: &RemoteObjectId)
        -> Result<bool>;
}

pub(crate) fn check_payload(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(TransportError::PayloadTooLarge { size, max });
    }
    Ok(())
}
