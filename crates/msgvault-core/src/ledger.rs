//! Completed-chunk ledger
//!
//! Every finished chunk is recorded here. A record is persisted through the
//! metadata store before observers see it, so a crash between "chunk
//! transferred" and "ledger written" leaves the chunk incomplete and it is
//! transferred again on resume.

use crate::{
    metadata::{progress_fraction, RemoteChunkRef, TransferTask},
    store::MetadataStore,
    Result,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Observable ledger snapshot
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerState {
    /// Durably completed chunk indices
    pub completed: BTreeSet<u32>,
    /// Number of chunks in the transfer
    pub total: u32,
    /// `completed / total`, never decreasing
    pub progress: f64,
}

impl LedgerState {
    /// Snapshot of a task's ledger
    pub fn of(task: &TransferTask) -> Self {
        Self {
            completed: task.completed_chunks.clone(),
            total: task.total_chunks,
            progress: task.progress,
        }
    }

    /// Whether chunk `index` is done
    pub fn contains(&self, index: u32) -> bool {
        self.completed.contains(&index)
    }

    /// Whether every chunk is done
    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.total as usize
    }
}

/// One ledger change
#[derive(Clone, Debug)]
pub enum LedgerUpdate {
    /// A chunk was stored remotely
    Uploaded(RemoteChunkRef),
    /// A chunk was written to its temporary file
    Downloaded(u32),
}

impl LedgerUpdate {
    /// Chunk index the update refers to
    pub fn index(&self) -> u32 {
        match self {
            Self::Uploaded(r) => r.chunk_index,
            Self::Downloaded(i) => *i,
        }
    }

    /// Apply to a task record, keeping progress monotonic
    pub fn apply(&self, task: &mut TransferTask) {
        if let Self::Uploaded(chunk) = self {
            task.uploaded_refs.insert(chunk.chunk_index, chunk.clone());
        }
        task.completed_chunks.insert(self.index());
        let fraction = progress_fraction(task.completed_chunks.len(), task.total_chunks);
        task.progress = task.progress.max(fraction);
        task.updated_at = chrono::Utc::now();
    }
}

/// Persisted record of a task's completed chunks
#[async_trait]
pub trait ChunkLedger: Send + Sync {
    /// Persist an update, then publish the new state
    async fn record(&self, update: LedgerUpdate) -> Result<LedgerState>;

    /// Current task record including the ledger
    async fn task(&self) -> Result<TransferTask>;

    /// Watch ledger changes
    fn subscribe(&self) -> watch::Receiver<LedgerState>;
}

/// Ledger owning its task record, for transfers run outside a queue
pub struct StoreLedger {
    task: Mutex<TransferTask>,
    store: Arc<dyn MetadataStore>,
    state: watch::Sender<LedgerState>,
}

impl StoreLedger {
    /// Wrap a task record
    pub fn new(task: TransferTask, store: Arc<dyn MetadataStore>) -> Self {
        let (state, _) = watch::channel(LedgerState::of(&task));
        Self {
            task: Mutex::new(task),
            store,
            state,
        }
    }
}

#[async_trait]
impl ChunkLedger for StoreLedger {
    async fn record(&self, update: LedgerUpdate) -> Result<LedgerState> {
        let mut task = self.task.lock().await;
        let mut next = task.clone();
        update.apply(&mut next);
        self.store.put_task(&next).await?;
        *task = next;
        let snapshot = LedgerState::of(&task);
        drop(task);
        self.state.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    async fn task(&self) -> Result<TransferTask> {
        Ok(self.task.lock().await.clone())
    }

    fn subscribe(&self) -> watch::Receiver<LedgerState> {
        self.state.subscribe()
    }
}
