//! # msgvault Core
//!
//! Transfer engine that turns a size-limited messaging backend into a file store.
//!
//! This crate provides:
//! - **Manifests and tasks**: durable records of stored files and transfers
//! - **TransferCoordinator**: parallel chunk upload/download with retry and resume
//! - **Task queues**: scheduled upload and download queues with pause, resume and cancel
//! - **Streaming**: progressive reads of a file while it downloads
//! - **Sharing**: export and import of encrypted share-link containers
//! - **Vault**: one handle wiring all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Vault                   │
//! ├─────────────────────────────────────────┤
//! │   TaskQueueManager   │  Share / Stream  │
//! ├─────────────────────────────────────────┤
//! │  TransferCoordinator │  ChunkLedger     │
//! ├─────────────────────────────────────────┤
//! │  RemoteTransport     │  MetadataStore   │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod metadata;
pub mod queue;
pub mod retry;
pub mod share;
pub mod store;
pub mod streaming;
pub mod vault;

pub use config::{EngineConfig, QueueConfig, StreamingConfig};
pub use coordinator::{PriorityHints, TransferContext, TransferCoordinator};
pub use error::{CoreError, Result};
pub use executor::TransferExecutor;
pub use ledger::{ChunkLedger, LedgerState, LedgerUpdate, StoreLedger};
pub use metadata::{
    Direction, FileId, FileManifest, RemoteChunkRef, StoredContent, TaskId, TaskStatus,
    TransferTask,
};
pub use queue::{QueueEvent, TaskExecutor, TaskQueue, TaskQueueManager};
pub use retry::RetryPolicy;
pub use store::{JsonFileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use streaming::StreamingChunkSource;
pub use vault::{Submitted, Vault};
