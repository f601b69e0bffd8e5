//! Queue executor backed by the transfer coordinator

use crate::{
    coordinator::{TransferContext, TransferCoordinator},
    metadata::{Direction, TransferTask},
    queue::TaskExecutor,
    store::MetadataStore,
    CoreError, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs queued tasks as coordinator transfers
pub struct TransferExecutor {
    coordinator: Arc<TransferCoordinator>,
    store: Arc<dyn MetadataStore>,
}

impl TransferExecutor {
    /// Create an executor
    pub fn new(coordinator: Arc<TransferCoordinator>, store: Arc<dyn MetadataStore>) -> Self {
        Self { coordinator, store }
    }
}

#[async_trait]
impl TaskExecutor for TransferExecutor {
    async fn execute(&self, task: TransferTask, ctx: TransferContext) -> Result<()> {
        match task.direction {
            Direction::Upload => {
                let manifest = self.coordinator.upload(&task, &ctx).await?;
                if ctx.cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                self.store.put_manifest(&manifest).await?;
                if ctx.cancel.is_cancelled() {
                    // paused or cancelled while the manifest was written
                    self.store.delete_manifest(&manifest.file_id).await?;
                    return Err(CoreError::Cancelled);
                }
                debug!(task_id = %task.id, file_id = %manifest.file_id, "Manifest stored");
            }
            Direction::Download => {
                let manifest = self
                    .store
                    .get_manifest(&task.file_id)
                    .await?
                    .ok_or_else(|| CoreError::FileNotFound(task.file_id.to_string()))?;
                self.coordinator.download(&task, &manifest, &ctx).await?;
            }
        }
        Ok(())
    }

    async fn discard(&self, task: &TransferTask) {
        // the manifest goes before the chunks it points at
        if task.direction == Direction::Upload {
            match self.store.delete_manifest(&task.file_id).await {
                Ok(true) => debug!(task_id = %task.id, file_id = %task.file_id, "Manifest of cancelled upload removed"),
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to remove manifest of cancelled upload"),
            }
        }
        self.coordinator.discard(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{FileId, FileManifest, TaskId, TaskStatus},
        store::MemoryMetadataStore,
        EngineConfig, QueueConfig, RetryPolicy, Vault,
    };
    use msgvault_transport::{Credential, CredentialPool, MemoryTransport, SharedCredentialPool};
    use std::time::Duration;

    /// Memory store whose manifest writes take a while
    struct SlowManifestStore {
        inner: MemoryMetadataStore,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataStore for SlowManifestStore {
        async fn put_manifest(&self, manifest: &FileManifest) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.put_manifest(manifest).await
        }

        async fn get_manifest(&self, id: &FileId) -> Result<Option<FileManifest>> {
            self.inner.get_manifest(id).await
        }

        async fn delete_manifest(&self, id: &FileId) -> Result<bool> {
            self.inner.delete_manifest(id).await
        }

        async fn list_manifests(&self) -> Result<Vec<FileManifest>> {
            self.inner.list_manifests().await
        }

        async fn put_task(&self, task: &TransferTask) -> Result<()> {
            self.inner.put_task(task).await
        }

        async fn get_task(&self, id: &TaskId) -> Result<Option<TransferTask>> {
            self.inner.get_task(id).await
        }

        async fn delete_task(&self, id: &TaskId) -> Result<bool> {
            self.inner.delete_task(id).await
        }

        async fn incomplete_tasks(&self) -> Result<Vec<TransferTask>> {
            self.inner.incomplete_tasks().await
        }
    }

    fn slow_vault(
        dir: &std::path::Path,
        transport: &MemoryTransport,
        store: MemoryMetadataStore,
    ) -> Vault {
        let config = EngineConfig::default()
            .with_chunk_size(1024)
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
            .with_queue(QueueConfig {
                tick_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            })
            .with_temp_dir(dir.join("tmp"));
        let pool: CredentialPool = ["a", "b"]
            .iter()
            .map(|id| Credential::new(*id, format!("{}-token", id)))
            .collect();
        let vault = Vault::new(
            config,
            Arc::new(transport.clone()),
            Arc::new(SlowManifestStore {
                inner: store,
                delay: Duration::from_millis(300),
            }),
            SharedCredentialPool::new(pool),
        )
        .unwrap();
        vault.start();
        vault
    }

    async fn upload_until_every_chunk_is_stored(
        vault: &Vault,
        dir: &std::path::Path,
    ) -> (FileId, TaskId) {
        let path = dir.join("late.bin");
        std::fs::write(&path, vec![7u8; 3000]).unwrap();
        let submitted = vault.enqueue_upload(&path).await.unwrap();
        let task_id = submitted.task_id.unwrap();
        let mut progress = vault.progress(&task_id).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|state| state.completed.len() >= 3),
        )
        .await
        .unwrap()
        .unwrap();
        // the manifest write is now in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        (submitted.file_id, task_id)
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_during_manifest_write_leaves_no_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let store = MemoryMetadataStore::new();
        let vault = slow_vault(dir.path(), &transport, store.clone());
        let (file_id, task_id) = upload_until_every_chunk_is_stored(&vault, dir.path()).await;

        vault.cancel(&task_id).await.unwrap();
        assert_eq!(vault.wait(&task_id).await.unwrap().status, TaskStatus::Cancelled);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let gone = store.get_manifest(&file_id).await.unwrap().is_none();
                if gone && transport.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(vault.list_files().await.unwrap().is_empty());
        vault.shutdown();
    }

    #[tokio::test]
    async fn test_pause_during_manifest_write_keeps_file_unlisted_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let store = MemoryMetadataStore::new();
        let vault = slow_vault(dir.path(), &transport, store.clone());
        let (file_id, task_id) = upload_until_every_chunk_is_stored(&vault, dir.path()).await;

        vault.pause(&task_id).await.unwrap();
        // let the interrupted manifest write finish and be rolled back
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(vault.task(&task_id).await.unwrap().status, TaskStatus::Paused);
        assert!(store.get_manifest(&file_id).await.unwrap().is_none());
        assert_eq!(transport.len(), 3);

        vault.resume(&task_id).await.unwrap();
        assert_eq!(vault.wait(&task_id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(transport.store_calls(), 3);
        assert!(store.get_manifest(&file_id).await.unwrap().is_some());
        vault.shutdown();
    }
}
