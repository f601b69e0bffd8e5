//! File manifests and transfer task records

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use msgvault_transport::{
    ChunkPlan, Credential, CredentialId, CredentialPool, RemoteObjectId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidInput(format!("{}: {}", s, e)))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a stored file
    FileId
);

uuid_id!(
    /// Identifier of a transfer task
    TaskId
);

/// Where one chunk lives remotely and who may fetch it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChunkRef {
    /// 0-based chunk index
    pub chunk_index: u32,
    /// Remote message holding the chunk
    pub remote_object_id: RemoteObjectId,
    /// Credential that stored the chunk
    pub uploader_credential_id: CredentialId,
    /// Chunk length in bytes
    pub size: u64,
    /// BLAKE3 hex checksum of the chunk bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// How a file's bytes are laid out remotely
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredContent {
    /// Zero-length file, nothing stored remotely
    Empty,
    /// The whole file is one remote object
    Single {
        remote_object_id: RemoteObjectId,
        uploader_credential_id: CredentialId,
    },
    /// Ordered chunk references
    Chunked {
        chunk_size: u64,
        chunks: Vec<RemoteChunkRef>,
    },
}

/// One transferable piece of a stored file, uniform over single and chunked layouts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Piece {
    /// Index within the file
    pub index: u32,
    /// Remote object
    pub object_id: RemoteObjectId,
    /// Credential allowed to fetch it
    pub credential_id: CredentialId,
    /// Length in bytes
    pub size: u64,
    /// Expected checksum
    pub checksum: Option<String>,
}

/// Durable description of a stored file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    /// File identifier
    pub file_id: FileId,
    /// Original file name
    pub file_name: String,
    /// Size in bytes
    pub total_size: u64,
    /// MIME type
    pub mime_type: String,
    /// Remote layout
    pub content: StoredContent,
    /// BLAKE3 hex checksum of the whole file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Credentials carried by an imported share, used before the local pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedded_credentials: Vec<Credential>,
}

impl FileManifest {
    /// Guess a MIME type from a file name
    pub fn guess_mime(file_name: &str) -> String {
        mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    /// Whether the file is split into chunks
    pub fn is_chunked(&self) -> bool {
        matches!(self.content, StoredContent::Chunked { .. })
    }

    /// Chunk boundaries; a single object is one chunk spanning the file
    pub fn plan(&self) -> Result<ChunkPlan> {
        let chunk_size = match &self.content {
            StoredContent::Chunked { chunk_size, .. } => *chunk_size,
            _ => self.total_size.max(1),
        };
        Ok(ChunkPlan::new(self.total_size, chunk_size)?)
    }

    /// All remote pieces in index order
    pub fn pieces(&self) -> Vec<Piece> {
        match &self.content {
            StoredContent::Empty => Vec::new(),
            StoredContent::Single {
                remote_object_id,
                uploader_credential_id,
            } => vec![Piece {
                index: 0,
                object_id: remote_object_id.clone(),
                credential_id: uploader_credential_id.clone(),
                size: self.total_size,
                checksum: self.checksum.clone(),
            }],
            StoredContent::Chunked { chunks, .. } => chunks
                .iter()
                .map(|c| Piece {
                    index: c.chunk_index,
                    object_id: c.remote_object_id.clone(),
                    credential_id: c.uploader_credential_id.clone(),
                    size: c.size,
                    checksum: c.checksum.clone(),
                })
                .collect(),
        }
    }

    /// Resolve a credential, preferring the ones embedded in the manifest
    pub fn resolve_credential(&self, id: &CredentialId, pool: &CredentialPool) -> Result<Credential> {
        if let Some(found) = self.embedded_credentials.iter().find(|c| &c.id == id) {
            return Ok(found.clone());
        }
        Ok(pool.resolve(id)?.clone())
    }

    /// Check the chunk list against the file size
    pub fn validate(&self) -> Result<()> {
        match &self.content {
            StoredContent::Empty if self.total_size != 0 => Err(CoreError::InvalidInput(format!(
                "{}: empty layout for {} bytes",
                self.file_name, self.total_size
            ))),
            StoredContent::Chunked { chunks, .. } => {
                let plan = self.plan()?;
                if chunks.len() != plan.chunk_count() as usize {
                    return Err(CoreError::InvalidInput(format!(
                        "{}: {} chunk refs for {} chunks",
                        self.file_name,
                        chunks.len(),
                        plan.chunk_count()
                    )));
                }
                for (position, chunk) in chunks.iter().enumerate() {
                    let index = position as u32;
                    if chunk.chunk_index != index || chunk.size != plan.chunk_len(index)? {
                        return Err(CoreError::InvalidInput(format!(
                            "{}: chunk ref at {} does not match the chunk plan",
                            self.file_name, position
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Task lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Finished, successfully or not
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// May be picked up again after a restart
    pub fn is_incomplete(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A persisted upload or download with its completed-chunk ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Task identifier
    pub id: TaskId,
    /// Upload or download
    pub direction: Direction,
    /// File being stored or materialized
    pub file_id: FileId,
    /// Display name
    pub file_name: String,
    /// Upload source or download destination
    pub local_path: PathBuf,
    /// File size in bytes
    pub total_size: u64,
    /// Chunk size used for this transfer
    pub chunk_size: u64,
    /// Number of chunks
    pub total_chunks: u32,
    /// Stored as one object rather than chunks
    pub single_shot: bool,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Indices that are durably done
    pub completed_chunks: BTreeSet<u32>,
    /// References of chunks uploaded so far
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uploaded_refs: BTreeMap<u32, RemoteChunkRef>,
    /// Base added to chunk indices before credential rotation
    pub credential_offset: u32,
    /// `completed / total`, never decreasing
    pub progress: f64,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
}

impl TransferTask {
    /// New queued upload of `local_path`
    pub fn upload(
        file_id: FileId,
        local_path: PathBuf,
        file_name: String,
        total_size: u64,
        chunk_size: u64,
        single_shot: bool,
        credential_offset: u32,
    ) -> Result<Self> {
        let chunk_size = if single_shot { total_size.max(1) } else { chunk_size };
        let total_chunks = ChunkPlan::new(total_size, chunk_size)?.chunk_count();
        Ok(Self::new(
            Direction::Upload,
            file_id,
            file_name,
            local_path,
            total_size,
            chunk_size,
            total_chunks,
            single_shot,
            credential_offset,
        ))
    }

    /// New queued download of `manifest` into `dest`
    pub fn download(manifest: &FileManifest, dest: PathBuf) -> Result<Self> {
        let plan = manifest.plan()?;
        Ok(Self::new(
            Direction::Download,
            manifest.file_id,
            manifest.file_name.clone(),
            dest,
            manifest.total_size,
            plan.chunk_size(),
            plan.chunk_count(),
            !manifest.is_chunked(),
            0,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        direction: Direction,
        file_id: FileId,
        file_name: String,
        local_path: PathBuf,
        total_size: u64,
        chunk_size: u64,
        total_chunks: u32,
        single_shot: bool,
        credential_offset: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            direction,
            file_id,
            file_name,
            local_path,
            total_size,
            chunk_size,
            total_chunks,
            single_shot,
            status: TaskStatus::Queued,
            completed_chunks: BTreeSet::new(),
            uploaded_refs: BTreeMap::new(),
            credential_offset,
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Chunk boundaries of this transfer
    pub fn plan(&self) -> Result<ChunkPlan> {
        Ok(ChunkPlan::new(self.total_size, self.chunk_size)?)
    }

    /// Whether a chunk is durably done for this task's direction
    pub fn is_chunk_done(&self, index: u32) -> bool {
        match self.direction {
            Direction::Upload => self.uploaded_refs.contains_key(&index),
            Direction::Download => self.completed_chunks.contains(&index),
        }
    }

    /// Indices still to transfer, ascending
    pub fn remaining_chunks(&self) -> BTreeSet<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.is_chunk_done(*i))
            .collect()
    }

    /// Drop the ledger, as a cancelled task does
    pub fn clear_ledger(&mut self) {
        self.completed_chunks.clear();
        self.uploaded_refs.clear();
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// `completed / total`, clamped to `[0, 1]`; an empty transfer is complete
pub fn progress_fraction(completed: usize, total: u32) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (completed as f64 / f64::from(total)).clamp(0.0, 1.0)
}
