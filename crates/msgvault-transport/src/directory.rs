//! Directory-backed transport for local use
//!
//! Each credential gets its own subdirectory and every stored blob becomes one
//! file named by a fresh UUID, mirroring one message per attachment.

use crate::{
    check_payload, BlobProgress, Credential, CredentialId, RemoteObjectId, RemoteTransport,
    Result, TransportError, DEFAULT_MAX_PAYLOAD,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

const READ_BUF: usize = 64 * 1024;

/// A transport storing blobs as files under a root directory
#[derive(Clone, Debug)]
pub struct DirectoryTransport {
    root: PathBuf,
    max_payload: usize,
}

impl DirectoryTransport {
    /// Open (and create if needed) a transport rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    /// Override the per-blob size limit
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn credential_dir(&self, id: &CredentialId) -> PathBuf {
        let safe: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn object_path(&self, credential: &Credential, object_id: &RemoteObjectId) -> Result<PathBuf> {
        let valid = uuid::Uuid::parse_str(object_id.as_str()).is_ok();
        if !valid {
            return Err(TransportError::NotFound {
                object_id: object_id.to_string(),
            });
        }
        Ok(self.credential_dir(&credential.id).join(object_id.as_str()))
    }

    async fn owned_elsewhere(&self, object_id: &RemoteObjectId) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if tokio::fs::try_exists(entry.path().join(object_id.as_str()))
                .await
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    async fn missing(&self, credential: &Credential, object_id: &RemoteObjectId) -> TransportError {
        if self.owned_elsewhere(object_id).await {
            TransportError::Unauthorized {
                credential_id: credential.id.to_string(),
                object_id: object_id.to_string(),
            }
        } else {
            TransportError::NotFound {
                object_id: object_id.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteTransport for DirectoryTransport {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    #[instrument(skip(self, payload), fields(credential = %credential.id, size = payload.len()))]
    async fn store_blob(&self, credential: &Credential, payload: Bytes) -> Result<RemoteObjectId> {
        check_payload(payload.len(), self.max_payload)?;
        let dir = self.credential_dir(&credential.id);
        tokio::fs::create_dir_all(&dir).await?;

        let id = RemoteObjectId::new(uuid::Uuid::new_v4().to_string());
        let tmp = dir.join(format!(".{}.tmp", id));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, dir.join(id.as_str())).await?;

        debug!(object_id = %id, "Stored blob");
        Ok(id)
    }

    async fn retrieve_blob(
        &self,
        credential: &Credential,
        object_id: &RemoteObjectId,
        progress: Option<BlobProgress<'_>>,
    ) -> Result<Bytes> {
        let path = self.object_path(credential, object_id)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.missing(credential, object_id).await)
            }
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata().await?.len();
        let mut data = BytesMut::with_capacity(total as usize);
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(progress) = progress {
                progress(data.len() as u64, total);
            }
        }
        Ok(data.freeze())
    }

    async fn delete_object(
        &self,
        credential: &Credential,
        object_id: &RemoteObjectId,
    ) -> Result<bool> {
        let path = self.object_path(credential, object_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match self.missing(credential, object_id).await {
                    TransportError::NotFound { .. } => Ok(false),
                    other => Err(other),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
