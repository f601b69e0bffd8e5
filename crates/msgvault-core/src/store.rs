//! Durable storage for manifests and task records
//!
//! The engine only needs CRUD by id plus a query for resumable tasks, so any
//! embedded database can sit behind [`MetadataStore`]. Two implementations
//! ship here: an in-memory map for tests and a directory of JSON documents.

use crate::{
    metadata::{FileId, FileManifest, TaskId, TransferTask},
    CoreError, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Persistence collaborator for manifests and tasks
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace a manifest
    async fn put_manifest(&self, manifest: &FileManifest) -> Result<()>;

    /// Fetch a manifest
    async fn get_manifest(&self, id: &FileId) -> Result<Option<FileManifest>>;

    /// Delete a manifest, returning whether it existed
    async fn delete_manifest(&self, id: &FileId) -> Result<bool>;

    /// All manifests, oldest first
    async fn list_manifests(&self) -> Result<Vec<FileManifest>>;

    /// Insert or replace a task record
    async fn put_task(&self, task: &TransferTask) -> Result<()>;

    /// Fetch a task record
    async fn get_task(&self, id: &TaskId) -> Result<Option<TransferTask>>;

    /// Delete a task record, returning whether it existed
    async fn delete_task(&self, id: &TaskId) -> Result<bool>;

    /// Tasks that are neither completed nor cancelled, oldest first
    async fn incomplete_tasks(&self) -> Result<Vec<TransferTask>>;
}

/// In-memory metadata store
#[derive(Clone, Debug, Default)]
pub struct MemoryMetadataStore {
    manifests: Arc<DashMap<FileId, FileManifest>>,
    tasks: Arc<DashMap<TaskId, TransferTask>>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put_manifest(&self, manifest: &FileManifest) -> Result<()> {
        self.manifests.insert(manifest.file_id, manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, id: &FileId) -> Result<Option<FileManifest>> {
        Ok(self.manifests.get(id).map(|m| m.clone()))
    }

    async fn delete_manifest(&self, id: &FileId) -> Result<bool> {
        Ok(self.manifests.remove(id).is_some())
    }

    async fn list_manifests(&self) -> Result<Vec<FileManifest>> {
        let mut all: Vec<_> = self.manifests.iter().map(|m| m.clone()).collect();
        all.sort_by_key(|m| m.created_at);
        Ok(all)
    }

    async fn put_task(&self, task: &TransferTask) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TransferTask>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        Ok(self.tasks.remove(id).is_some())
    }

    async fn incomplete_tasks(&self) -> Result<Vec<TransferTask>> {
        let mut pending: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_incomplete())
            .map(|t| t.clone())
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }
}

/// Metadata store keeping one JSON document per record.
///
/// Layout: `<root>/manifests/<file-id>.json` and `<root>/tasks/<task-id>.json`.
/// Each write goes to a temporary file that is synced and renamed over the
/// record, so a record is either the old or the new version.
#[derive(Clone, Debug)]
pub struct JsonFileMetadataStore {
    root: PathBuf,
}

impl JsonFileMetadataStore {
    /// Open a store rooted at `root`, creating its directories
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("manifests")).await?;
        tokio::fs::create_dir_all(root.join("tasks")).await?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, id: &FileId) -> PathBuf {
        self.root.join("manifests").join(format!("{}.json", id))
    }

    fn task_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }

    async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CoreError::Store(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_record(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn put_manifest(&self, manifest: &FileManifest) -> Result<()> {
        Self::write_record(&self.manifest_path(&manifest.file_id), manifest).await
    }

    async fn get_manifest(&self, id: &FileId) -> Result<Option<FileManifest>> {
        Self::read_record(&self.manifest_path(id)).await
    }

    async fn delete_manifest(&self, id: &FileId) -> Result<bool> {
        Self::remove_record(&self.manifest_path(id)).await
    }

    async fn list_manifests(&self) -> Result<Vec<FileManifest>> {
        let mut all: Vec<FileManifest> = Self::read_all(&self.root.join("manifests")).await?;
        all.sort_by_key(|m| m.created_at);
        Ok(all)
    }

    async fn put_task(&self, task: &TransferTask) -> Result<()> {
        Self::write_record(&self.task_path(&task.id), task).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TransferTask>> {
        Self::read_record(&self.task_path(id)).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        Self::remove_record(&self.task_path(id)).await
    }

    async fn incomplete_tasks(&self) -> Result<Vec<TransferTask>> {
        let mut pending: Vec<TransferTask> = Self::read_all(&self.root.join("tasks"))
            .await?
            .into_iter()
            .filter(|t: &TransferTask| t.status.is_incomplete())
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }
}
