//! Parallel chunk upload and download
//!
//! A transfer walks the task's remaining chunk indices with bounded
//! parallelism. Each chunk is retried on its own; when one exhausts its
//! retries the whole transfer fails and the ledger keeps whatever completed.
//! Cancelling the context drops every in-flight chunk operation.

use crate::{
    config::EngineConfig,
    ledger::{ChunkLedger, LedgerUpdate},
    metadata::{FileManifest, Piece, RemoteChunkRef, StoredContent, TaskId, TransferTask},
    CoreError, Result,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, TryStreamExt};
use msgvault_crypto::{CryptoError, IncrementalHasher};
use msgvault_transport::{
    read_chunk, reassemble_files, BlobProgress, ChunkPlan, CredentialRotator, RemoteTransport,
    SharedCredentialPool,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Chunk indices a consumer wants next, served before ascending order
#[derive(Clone, Debug, Default)]
pub struct PriorityHints {
    queue: Arc<Mutex<VecDeque<u32>>>,
}

impl PriorityHints {
    /// Create an empty hint queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for `index` before anything hinted earlier
    pub fn push_front(&self, index: u32) {
        let mut queue = self.queue.lock();
        queue.retain(|i| *i != index);
        queue.push_front(index);
    }

    /// Ask for `index` after what is already hinted
    pub fn push_back(&self, index: u32) {
        let mut queue = self.queue.lock();
        if !queue.contains(&index) {
            queue.push_back(index);
        }
    }

    pub(crate) fn pop(&self) -> Option<u32> {
        self.queue.lock().pop_front()
    }
}

/// Dispatch order: hinted indices first, then ascending
struct DispatchOrder {
    remaining: BTreeSet<u32>,
    hints: PriorityHints,
}

impl Iterator for DispatchOrder {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while let Some(index) = self.hints.pop() {
            if self.remaining.remove(&index) {
                return Some(index);
            }
        }
        self.remaining.pop_first()
    }
}

/// Per-execution handles of one transfer
#[derive(Clone)]
pub struct TransferContext {
    /// Fires on pause, cancel or shutdown
    pub cancel: CancellationToken,
    /// Where completed chunks are recorded
    pub ledger: Arc<dyn ChunkLedger>,
    /// Download order hints from streaming consumers
    pub hints: PriorityHints,
    /// Payload bytes fetched by this execution, advanced as blobs arrive
    pub received: Arc<AtomicU64>,
}

impl TransferContext {
    /// Context with a fresh token and no hints
    pub fn new(ledger: Arc<dyn ChunkLedger>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ledger,
            hints: PriorityHints::new(),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Payload bytes fetched so far
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Executes upload and download tasks against a remote transport
pub struct TransferCoordinator {
    transport: Arc<dyn RemoteTransport>,
    credentials: SharedCredentialPool,
    config: Arc<EngineConfig>,
}

impl TransferCoordinator {
    /// Create a coordinator
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        credentials: SharedCredentialPool,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            transport,
            credentials,
            config,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Directory holding a download task's temporary chunk files
    pub fn chunk_dir(&self, task_id: &TaskId) -> PathBuf {
        chunk_dir(&self.config.temp_dir, task_id)
    }

    /// Upload every chunk the ledger does not have yet and build the manifest
    #[instrument(skip_all, fields(task_id = %task.id, file = %task.file_name))]
    pub async fn upload(&self, task: &TransferTask, ctx: &TransferContext) -> Result<FileManifest> {
        let plan = task.plan()?;
        let actual = tokio::fs::metadata(&task.local_path).await?.len();
        if actual != task.total_size {
            return Err(CoreError::InvalidInput(format!(
                "{} changed size: expected {} bytes, found {}",
                task.local_path.display(),
                task.total_size,
                actual
            )));
        }

        let remaining = task.remaining_chunks();
        info!(
            remaining = remaining.len(),
            total = plan.chunk_count(),
            "Starting upload"
        );
        self.dispatch(remaining, ctx, |index| self.upload_chunk(task, &plan, index, ctx))
            .await?;

        let done = ctx.ledger.task().await?;
        let refs: Vec<RemoteChunkRef> = done.uploaded_refs.values().cloned().collect();
        if let Some(index) = plan.indices().find(|i| !done.uploaded_refs.contains_key(i)) {
            return Err(msgvault_transport::TransportError::MissingChunk { index }.into());
        }

        let checksum = file_checksum(&task.local_path).await?;
        // a cancel after the last chunk must not yield a manifest
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let content = if refs.is_empty() {
            StoredContent::Empty
        } else if task.single_shot && refs.len() == 1 {
            StoredContent::Single {
                remote_object_id: refs[0].remote_object_id.clone(),
                uploader_credential_id: refs[0].uploader_credential_id.clone(),
            }
        } else {
            StoredContent::Chunked {
                chunk_size: plan.chunk_size(),
                chunks: refs,
            }
        };
        let manifest = FileManifest {
            file_id: task.file_id,
            file_name: task.file_name.clone(),
            total_size: task.total_size,
            mime_type: FileManifest::guess_mime(&task.file_name),
            content,
            checksum: Some(checksum),
            created_at: Utc::now(),
            embedded_credentials: Vec::new(),
        };
        manifest.validate()?;
        info!(file_id = %manifest.file_id, "Upload complete");
        Ok(manifest)
    }

    async fn upload_chunk(
        &self,
        task: &TransferTask,
        plan: &ChunkPlan,
        index: u32,
        ctx: &TransferContext,
    ) -> Result<()> {
        let chunk = read_chunk(&task.local_path, plan, index).await?;
        let pool = self.credentials.snapshot();
        let credential = CredentialRotator::assign_with_offset(index, task.credential_offset, &pool)?;

        let transport = &self.transport;
        let data = &chunk.data;
        let object_id = self
            .config
            .retry
            .run(index, &ctx.cancel, move |_| async move {
                Ok(transport.store_blob(credential, data.clone()).await?)
            })
            .await?;

        debug!(chunk = index, object_id = %object_id, credential = %credential.id, "Chunk stored");
        ctx.ledger
            .record(LedgerUpdate::Uploaded(RemoteChunkRef {
                chunk_index: index,
                remote_object_id: object_id,
                uploader_credential_id: credential.id.clone(),
                size: chunk.len() as u64,
                checksum: Some(chunk.checksum),
            }))
            .await?;
        Ok(())
    }

    /// Fetch every missing chunk into temporary files, then reassemble into
    /// the task's destination and verify the whole-file checksum.
    #[instrument(skip_all, fields(task_id = %task.id, file = %task.file_name))]
    pub async fn download(
        &self,
        task: &TransferTask,
        manifest: &FileManifest,
        ctx: &TransferContext,
    ) -> Result<PathBuf> {
        let plan = manifest.plan()?;
        if plan.chunk_count() == 0 {
            tokio::fs::File::create(&task.local_path).await?;
            return Ok(task.local_path.clone());
        }

        let dir = self.chunk_dir(&task.id);
        tokio::fs::create_dir_all(&dir).await?;
        let pieces = manifest.pieces();

        let mut remaining = BTreeSet::new();
        for piece in &pieces {
            let present = task.is_chunk_done(piece.index)
                && chunk_file_len(&dir, piece.index).await == Some(piece.size);
            if !present {
                remaining.insert(piece.index);
            }
        }
        info!(
            remaining = remaining.len(),
            total = plan.chunk_count(),
            "Starting download"
        );

        let pieces = &pieces;
        let dir_ref = &dir;
        self.dispatch(remaining, ctx, move |index| async move {
            let piece = pieces.get(index as usize).ok_or_else(|| {
                CoreError::InvalidInput(format!("no reference for chunk {}", index))
            })?;
            self.download_chunk(manifest, piece, dir_ref, ctx).await
        })
        .await?;

        let reassembled =
            reassemble_files(&plan, |i| chunk_path(&dir, i), &task.local_path).await?;
        if let Some(expected) = &manifest.checksum {
            if &reassembled.checksum != expected {
                let _ = tokio::fs::remove_file(&task.local_path).await;
                return Err(CoreError::ChecksumMismatch {
                    index: None,
                    expected: expected.clone(),
                    actual: reassembled.checksum,
                });
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to remove chunk files");
        }
        info!(bytes = reassembled.bytes_written, "Download complete");
        Ok(task.local_path.clone())
    }

    async fn download_chunk(
        &self,
        manifest: &FileManifest,
        piece: &Piece,
        dir: &Path,
        ctx: &TransferContext,
    ) -> Result<()> {
        let credential = manifest.resolve_credential(&piece.credential_id, &self.credentials.snapshot())?;

        let transport = &self.transport;
        let credential = &credential;
        let received = &ctx.received;
        let data: Bytes = self
            .config
            .retry
            .run(piece.index, &ctx.cancel, move |_| async move {
                let seen = AtomicU64::new(0);
                let advance = |bytes: u64, _total: u64| {
                    let previous = seen.swap(bytes, Ordering::Relaxed);
                    received.fetch_add(bytes.saturating_sub(previous), Ordering::Relaxed);
                };
                let progress: BlobProgress<'_> = &advance;
                let data = transport
                    .retrieve_blob(credential, &piece.object_id, Some(progress))
                    .await?;
                if let Some(expected) = &piece.checksum {
                    verify_chunk(piece.index, &data, expected)?;
                }
                Ok(data)
            })
            .await?;

        if data.len() as u64 != piece.size {
            return Err(CoreError::InvalidInput(format!(
                "chunk {} is {} bytes, expected {}",
                piece.index,
                data.len(),
                piece.size
            )));
        }

        let path = chunk_path(dir, piece.index);
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!(chunk = piece.index, bytes = data.len(), "Chunk fetched");
        ctx.ledger.record(LedgerUpdate::Downloaded(piece.index)).await?;
        Ok(())
    }

    async fn dispatch<F, Fut>(
        &self,
        remaining: BTreeSet<u32>,
        ctx: &TransferContext,
        work: F,
    ) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let order = DispatchOrder {
            remaining,
            hints: ctx.hints.clone(),
        };
        let run = stream::iter(order.map(Ok::<u32, CoreError>))
            .map_ok(work)
            .try_buffer_unordered(self.config.chunk_parallelism.max(1))
            .try_collect::<Vec<()>>();

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(CoreError::Cancelled),
            result = run => result.map(|_| ()),
        }
    }

    /// Best-effort removal of whatever a cancelled task left behind
    pub async fn discard(&self, task: &TransferTask) {
        match task.direction {
            crate::metadata::Direction::Upload => {
                let pool = self.credentials.snapshot();
                for chunk in task.uploaded_refs.values() {
                    let Some(credential) = pool.get(&chunk.uploader_credential_id) else {
                        warn!(object_id = %chunk.remote_object_id, "No credential to delete orphaned chunk");
                        continue;
                    };
                    if let Err(e) = self
                        .transport
                        .delete_object(credential, &chunk.remote_object_id)
                        .await
                    {
                        warn!(object_id = %chunk.remote_object_id, error = %e, "Failed to delete orphaned chunk");
                    }
                }
            }
            crate::metadata::Direction::Download => {
                let dir = self.chunk_dir(&task.id);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove chunk files"),
                }
            }
        }
    }
}

/// Temporary chunk directory of a task under `temp_root`
pub fn chunk_dir(temp_root: &Path, task_id: &TaskId) -> PathBuf {
    temp_root.join(task_id.to_string())
}

/// Temporary file of chunk `index` inside `dir`
pub fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("chunk_{:08}.part", index))
}

async fn chunk_file_len(dir: &Path, index: u32) -> Option<u64> {
    tokio::fs::metadata(chunk_path(dir, index))
        .await
        .ok()
        .map(|m| m.len())
}

fn verify_chunk(index: u32, data: &[u8], expected: &str) -> Result<()> {
    msgvault_crypto::verify_checksum(data, expected).map_err(|e| match e {
        CryptoError::HashMismatch { expected, actual } => CoreError::ChecksumMismatch {
            index: Some(index),
            expected,
            actual,
        },
        other => other.into(),
    })
}

async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = IncrementalHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex())
}
