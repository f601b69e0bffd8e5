//! Vault facade
//!
//! Wires the transport, metadata store, credential pool, coordinator and
//! queue manager into one handle that stores, fetches, streams, deletes and
//! shares files.

use crate::{
    config::EngineConfig,
    coordinator::TransferCoordinator,
    executor::TransferExecutor,
    ledger::LedgerState,
    metadata::{FileId, FileManifest, StoredContent, TaskId, TransferTask},
    queue::{QueueEvent, TaskQueueManager},
    share,
    store::MetadataStore,
    streaming::StreamingChunkSource,
    CoreError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use futures::future::join_all;
use msgvault_crypto::{checksum_hex, ShareLinkCodec};
use msgvault_transport::{CredentialPool, RemoteTransport, SharedCredentialPool};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

/// Result of submitting an upload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submitted {
    /// File the upload will produce
    pub file_id: FileId,
    /// Transfer task; `None` when nothing had to be transferred
    pub task_id: Option<TaskId>,
}

/// Plaintext of a sealed metadata backup
#[derive(Serialize, Deserialize)]
struct BackupArchive {
    created_at: DateTime<Utc>,
    manifests: Vec<FileManifest>,
}

/// A remote file store built from a messaging backend
pub struct Vault {
    config: Arc<EngineConfig>,
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn MetadataStore>,
    credentials: SharedCredentialPool,
    coordinator: Arc<TransferCoordinator>,
    queues: TaskQueueManager,
    codec: ShareLinkCodec,
    next_offset: AtomicU32,
}

impl Vault {
    /// Create a vault; the configuration must fit the transport's payload limit
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn MetadataStore>,
        credentials: SharedCredentialPool,
    ) -> Result<Self> {
        config.validate(transport.max_payload_size())?;
        let config = Arc::new(config);
        let coordinator = Arc::new(TransferCoordinator::new(
            transport.clone(),
            credentials.clone(),
            config.clone(),
        ));
        let executor = Arc::new(TransferExecutor::new(coordinator.clone(), store.clone()));
        let queues = TaskQueueManager::new(config.queue.clone(), store.clone(), executor);
        Ok(Self {
            codec: ShareLinkCodec::new(config.compat),
            config,
            transport,
            store,
            credentials,
            coordinator,
            queues,
            next_offset: AtomicU32::new(0),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Credential pool handle; replacing the pool affects chunks not yet dispatched
    pub fn credentials(&self) -> &SharedCredentialPool {
        &self.credentials
    }

    /// Task queues
    pub fn queues(&self) -> &TaskQueueManager {
        &self.queues
    }

    /// Start the schedulers
    pub fn start(&self) {
        self.queues.start();
    }

    /// Stop the schedulers and interrupt running transfers
    pub fn shutdown(&self) {
        self.queues.shutdown();
    }

    /// Re-queue incomplete tasks persisted by an earlier run
    pub async fn restore(&self) -> Result<usize> {
        self.queues.restore().await
    }

    /// Queue an upload of `path`.
    ///
    /// Empty files are recorded immediately without touching the transport.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn enqueue_upload(&self, path: impl AsRef<Path>) -> Result<Submitted> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(CoreError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CoreError::InvalidInput(format!("{} has no file name", path.display())))?;
        let size = meta.len();
        let file_id = FileId::new();

        if size == 0 {
            let manifest = FileManifest {
                file_id,
                mime_type: FileManifest::guess_mime(&file_name),
                file_name,
                total_size: 0,
                content: StoredContent::Empty,
                checksum: Some(checksum_hex(&[])),
                created_at: Utc::now(),
                embedded_credentials: Vec::new(),
            };
            self.store.put_manifest(&manifest).await?;
            info!(file_id = %file_id, "Stored empty file");
            return Ok(Submitted {
                file_id,
                task_id: None,
            });
        }

        let single_shot = size <= self.config.single_shot_threshold;
        let mut task = TransferTask::upload(
            file_id,
            path.to_path_buf(),
            file_name,
            size,
            self.config.chunk_size,
            single_shot,
            0,
        )?;
        task.credential_offset = self
            .next_offset
            .fetch_add(task.total_chunks, Ordering::Relaxed);
        let task_id = self.queues.enqueue(task).await?;
        info!(file_id = %file_id, task_id = %task_id, size, single_shot, "Upload queued");
        Ok(Submitted {
            file_id,
            task_id: Some(task_id),
        })
    }

    /// Queue a download of a stored file into `dest`
    pub async fn enqueue_download(&self, file_id: &FileId, dest: impl Into<PathBuf>) -> Result<TaskId> {
        let manifest = self.manifest(file_id).await?;
        let task = TransferTask::download(&manifest, dest.into())?;
        let task_id = self.queues.enqueue(task).await?;
        info!(file_id = %file_id, task_id = %task_id, "Download queued");
        Ok(task_id)
    }

    /// Start a download and read it progressively while it runs
    pub async fn open_stream(
        &self,
        file_id: &FileId,
        dest: impl Into<PathBuf>,
    ) -> Result<(TaskId, StreamingChunkSource)> {
        let manifest = self.manifest(file_id).await?;
        let dest = dest.into();
        let task = TransferTask::download(&manifest, dest.clone())?;
        let task_id = self.queues.enqueue(task).await?;

        let missing = || CoreError::TaskNotFound(task_id.to_string());
        let ledger = self.queues.progress(&task_id).await.ok_or_else(missing)?;
        let hints = self.queues.hints(&task_id).await.ok_or_else(missing)?;
        let source = StreamingChunkSource::new(
            manifest.plan()?,
            self.coordinator.chunk_dir(&task_id),
            dest,
            ledger,
            hints,
            self.config.streaming.clone(),
        );
        Ok((task_id, source))
    }

    /// Wait until a task completes, fails or is cancelled
    pub async fn wait(&self, task_id: &TaskId) -> Result<TransferTask> {
        self.queues.wait(task_id).await
    }

    /// Pause a task
    pub async fn pause(&self, task_id: &TaskId) -> Result<()> {
        self.queues.pause(task_id).await
    }

    /// Resume a paused or failed task
    pub async fn resume(&self, task_id: &TaskId) -> Result<()> {
        self.queues.resume(task_id).await
    }

    /// Cancel a task and discard its partial transfer
    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        self.queues.cancel(task_id).await
    }

    /// Current record of a task
    pub async fn task(&self, task_id: &TaskId) -> Result<TransferTask> {
        self.queues.task(task_id).await
    }

    /// Tasks in the visible queues
    pub async fn tasks(&self) -> Vec<TransferTask> {
        self.queues.tasks().await
    }

    /// Incomplete tasks in the metadata store
    pub async fn incomplete_tasks(&self) -> Result<Vec<TransferTask>> {
        self.store.incomplete_tasks().await
    }

    /// Status and progress events of every task
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queues.subscribe()
    }

    /// Ledger of a visible task
    pub async fn progress(&self, task_id: &TaskId) -> Option<watch::Receiver<LedgerState>> {
        self.queues.progress(task_id).await
    }

    /// Manifest of a stored file
    pub async fn manifest(&self, file_id: &FileId) -> Result<FileManifest> {
        self.store
            .get_manifest(file_id)
            .await?
            .ok_or_else(|| CoreError::FileNotFound(file_id.to_string()))
    }

    /// All stored files, oldest first
    pub async fn list_files(&self) -> Result<Vec<FileManifest>> {
        self.store.list_manifests().await
    }

    /// Delete every remote object of a file, then its manifest.
    ///
    /// Objects that are already gone count as deleted. If any other deletion
    /// fails the manifest is kept so the delete can be retried.
    #[instrument(skip_all, fields(file_id = %file_id))]
    pub async fn delete_file(&self, file_id: &FileId) -> Result<()> {
        let manifest = self.manifest(file_id).await?;
        let pool = self.credentials.snapshot();
        let pieces = manifest.pieces();

        let outcomes: Vec<Result<()>> = join_all(pieces.iter().map(|piece| async {
            let credential = manifest.resolve_credential(&piece.credential_id, &pool)?;
            match self.transport.delete_object(&credential, &piece.object_id).await {
                Ok(existed) => {
                    if !existed {
                        warn!(object_id = %piece.object_id, "Remote object already gone");
                    }
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(CoreError::from(e)),
            }
        }))
        .await;

        let failures: Vec<CoreError> = outcomes.into_iter().filter_map(|r| r.err()).collect();
        if let Some(first) = failures.first() {
            warn!(failed = failures.len(), total = pieces.len(), "Delete incomplete");
            return Err(CoreError::DeleteIncomplete {
                failed: failures.len(),
                total: pieces.len(),
                first_error: first.to_string(),
            });
        }
        self.store.delete_manifest(file_id).await?;
        info!(objects = pieces.len(), "File deleted");
        Ok(())
    }

    /// Encrypt a share-link container for stored files
    pub async fn export_share(&self, file_ids: &[FileId], passphrase: &str) -> Result<Vec<u8>> {
        let mut manifests = Vec::with_capacity(file_ids.len());
        for id in file_ids {
            manifests.push(self.manifest(id).await?);
        }
        let share = share::export(&manifests, &self.credentials.snapshot())?;
        Ok(self.codec.encode(&share, passphrase)?)
    }

    /// Decrypt a share-link container and record its files
    pub async fn import_share(&self, container: &[u8], passphrase: &str) -> Result<Vec<FileManifest>> {
        let share = self.codec.decode(container, passphrase)?;
        let manifests = share::import(share)?;
        for manifest in &manifests {
            self.store.put_manifest(manifest).await?;
        }
        info!(files = manifests.len(), "Share imported");
        Ok(manifests)
    }

    /// Seal every manifest into a passphrase-protected backup archive
    pub async fn export_backup(&self, passphrase: &str) -> Result<Vec<u8>> {
        let archive = BackupArchive {
            created_at: Utc::now(),
            manifests: self.list_files().await?,
        };
        let sealed = msgvault_crypto::backup::seal(&serde_json::to_vec(&archive)?, passphrase)?;
        info!(files = archive.manifests.len(), bytes = sealed.len(), "Backup sealed");
        Ok(sealed)
    }

    /// Open a backup archive and restore its manifests under their original ids.
    ///
    /// Nothing is written unless every manifest in the archive is valid.
    pub async fn import_backup(&self, sealed: &[u8], passphrase: &str) -> Result<Vec<FileManifest>> {
        let plain = msgvault_crypto::backup::open(sealed, passphrase)?;
        let archive: BackupArchive = serde_json::from_slice(&plain)?;
        for manifest in &archive.manifests {
            manifest.validate()?;
        }
        for manifest in &archive.manifests {
            self.store.put_manifest(manifest).await?;
        }
        info!(files = archive.manifests.len(), sealed_at = %archive.created_at, "Backup restored");
        Ok(archive.manifests)
    }

    /// Swap the credential pool
    pub fn replace_credentials(&self, pool: CredentialPool) {
        self.credentials.replace(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TaskStatus;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryMetadataStore;
    use crate::QueueConfig;
    use msgvault_transport::{Credential, MemoryTransport};
    use std::time::Duration;

    fn vault_with(transport: &MemoryTransport, dir: &Path, credentials: &[&str]) -> Vault {
        let config = EngineConfig::default()
            .with_chunk_size(1024)
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
            .with_queue(QueueConfig {
                tick_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            })
            .with_temp_dir(dir.join("tmp"));
        let pool: CredentialPool = credentials
            .iter()
            .map(|id| Credential::new(*id, format!("{}-token", id)))
            .collect();
        let vault = Vault::new(
            config,
            Arc::new(transport.clone()),
            Arc::new(MemoryMetadataStore::new()),
            SharedCredentialPool::new(pool),
        )
        .unwrap();
        vault.start();
        vault
    }

    fn write(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_download_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let vault = vault_with(&transport, dir.path(), &["a", "b"]);
        let (path, data) = write(dir.path(), "clip.bin", 3000);

        let submitted = vault.enqueue_upload(&path).await.unwrap();
        let upload = vault.wait(&submitted.task_id.unwrap()).await.unwrap();
        assert_eq!(upload.status, TaskStatus::Completed);
        assert_eq!(transport.len(), 3);

        let out = dir.path().join("out.bin");
        let task = vault.enqueue_download(&submitted.file_id, &out).await.unwrap();
        assert_eq!(vault.wait(&task).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(std::fs::read(&out).unwrap(), data);

        vault.delete_file(&submitted.file_id).await.unwrap();
        assert!(transport.is_empty());
        assert!(vault.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_small_file_is_single_shot_and_empty_file_skips_transport() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let vault = vault_with(&transport, dir.path(), &["a"]);

        let (small, _) = write(dir.path(), "note.txt", 100);
        let submitted = vault.enqueue_upload(&small).await.unwrap();
        vault.wait(&submitted.task_id.unwrap()).await.unwrap();
        let manifest = vault.manifest(&submitted.file_id).await.unwrap();
        assert!(matches!(manifest.content, StoredContent::Single { .. }));
        assert_eq!(manifest.mime_type, "text/plain");

        let (empty, _) = write(dir.path(), "empty.txt", 0);
        let submitted = vault.enqueue_upload(&empty).await.unwrap();
        assert!(submitted.task_id.is_none());
        assert_eq!(
            vault.manifest(&submitted.file_id).await.unwrap().content,
            StoredContent::Empty
        );
        assert_eq!(transport.store_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_manifest_when_objects_remain() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let vault = vault_with(&transport, dir.path(), &["a", "b"]);
        let (path, _) = write(dir.path(), "f.bin", 2048);
        let submitted = vault.enqueue_upload(&path).await.unwrap();
        vault.wait(&submitted.task_id.unwrap()).await.unwrap();
        let manifest = vault.manifest(&submitted.file_id).await.unwrap();

        // one object vanished remotely, the other's credential left the pool
        transport.purge(&manifest.pieces()[0].object_id);
        vault.replace_credentials(CredentialPool::new(vec![Credential::new("a", "a-token")]));
        let err = vault.delete_file(&submitted.file_id).await.unwrap_err();
        assert!(matches!(err, CoreError::DeleteIncomplete { failed: 1, total: 2, .. }));
        assert!(vault.manifest(&submitted.file_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_share_lets_a_stranger_download() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let sender = vault_with(&transport, dir.path(), &["a", "b", "c"]);
        let (path, data) = write(dir.path(), "movie.mp4", 2500);
        let submitted = sender.enqueue_upload(&path).await.unwrap();
        sender.wait(&submitted.task_id.unwrap()).await.unwrap();
        let container = sender
            .export_share(&[submitted.file_id], "open sesame")
            .await
            .unwrap();

        let recipient = vault_with(&transport, dir.path(), &[]);
        assert!(matches!(
            recipient.import_share(&container, "wrong").await,
            Err(CoreError::Crypto(msgvault_crypto::CryptoError::WrongPasswordOrCorrupt))
        ));
        let imported = recipient.import_share(&container, "open sesame").await.unwrap();
        let out = dir.path().join("received.mp4");
        let task = recipient
            .enqueue_download(&imported[0].file_id, &out)
            .await
            .unwrap();
        assert_eq!(recipient.wait(&task).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[tokio::test]
    async fn test_backup_restores_manifests_into_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let original = vault_with(&transport, dir.path(), &["a", "b"]);
        let (path, data) = write(dir.path(), "ledger.db", 2100);
        let submitted = original.enqueue_upload(&path).await.unwrap();
        original.wait(&submitted.task_id.unwrap()).await.unwrap();
        let sealed = original.export_backup("backup pass").await.unwrap();
        assert!(sealed.starts_with(msgvault_crypto::backup::MAGIC));

        let restored = vault_with(&transport, dir.path(), &["a", "b"]);
        assert!(restored.import_backup(&sealed, "share pass").await.is_err());
        let container = original
            .export_share(&[submitted.file_id], "backup pass")
            .await
            .unwrap();
        assert!(restored.import_backup(&container, "backup pass").await.is_err());
        assert!(restored.list_files().await.unwrap().is_empty());

        let manifests = restored.import_backup(&sealed, "backup pass").await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].file_id, submitted.file_id);

        let out = dir.path().join("ledger-restored.db");
        let task = restored.enqueue_download(&submitted.file_id, &out).await.unwrap();
        assert_eq!(restored.wait(&task).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[tokio::test]
    async fn test_open_stream_reads_in_order() {
        use futures::TryStreamExt;

        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let vault = vault_with(&transport, dir.path(), &["a", "b"]);
        let (path, data) = write(dir.path(), "song.mp3", 4500);
        let submitted = vault.enqueue_upload(&path).await.unwrap();
        vault.wait(&submitted.task_id.unwrap()).await.unwrap();

        let (_, source) = vault
            .open_stream(&submitted.file_id, dir.path().join("song-copy.mp3"))
            .await
            .unwrap();
        assert_eq!(source.chunk_count(), 5);
        let chunks: Vec<_> = source.stream().try_collect().await.unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }
}
