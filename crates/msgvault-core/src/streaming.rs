//! Progressive reads of a file that is still downloading
//!
//! A [`StreamingChunkSource`] watches a download's ledger and serves chunks
//! in order as they land. Waiting is bounded: each wait gives up after
//! `max_wait_attempts` poll intervals without the chunk becoming available.

use crate::{
    config::StreamingConfig,
    coordinator::{chunk_path, PriorityHints},
    ledger::LedgerState,
    CoreError, Result,
};
use bytes::Bytes;
use futures::stream::{self, Stream};
use msgvault_transport::ChunkPlan;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Sequential reader over a download's chunks
pub struct StreamingChunkSource {
    plan: ChunkPlan,
    chunk_dir: PathBuf,
    destination: PathBuf,
    ledger: watch::Receiver<LedgerState>,
    hints: PriorityHints,
    config: StreamingConfig,
}

impl StreamingChunkSource {
    /// Attach to a download and ask for its first chunks ahead of the rest
    pub fn new(
        plan: ChunkPlan,
        chunk_dir: PathBuf,
        destination: PathBuf,
        ledger: watch::Receiver<LedgerState>,
        hints: PriorityHints,
        config: StreamingConfig,
    ) -> Self {
        let head = config.priority_chunks.min(plan.chunk_count());
        for index in 0..head {
            hints.push_back(index);
        }
        Self {
            plan,
            chunk_dir,
            destination,
            ledger,
            hints,
            config,
        }
    }

    /// Number of chunks in the file
    pub fn chunk_count(&self) -> u32 {
        self.plan.chunk_count()
    }

    /// Latest ledger snapshot
    pub fn state(&self) -> LedgerState {
        self.ledger.borrow().clone()
    }

    /// Block until chunk `index` is in the ledger.
    ///
    /// The chunk is hinted to the front of the download order first.
    pub async fn wait_for_chunk(&self, index: u32) -> Result<()> {
        self.plan.chunk_len(index)?;
        let mut ledger = self.ledger.clone();
        if ledger.borrow_and_update().contains(index) {
            return Ok(());
        }
        self.hints.push_front(index);
        debug!(chunk = index, "Waiting for chunk");

        let mut waits = 0;
        loop {
            if ledger.borrow_and_update().contains(index) {
                return Ok(());
            }
            if waits >= self.config.max_wait_attempts {
                break;
            }
            match tokio::time::timeout(self.config.poll_interval, ledger.changed()).await {
                Ok(Ok(())) => {}
                // the download finished or was dropped; the last snapshot is final
                Ok(Err(_)) => {
                    if ledger.borrow().contains(index) {
                        return Ok(());
                    }
                    break;
                }
                Err(_) => waits += 1,
            }
        }
        Err(CoreError::ChunkUnavailable {
            index,
            attempts: waits,
        })
    }

    /// Bytes of chunk `index`, waiting for it if needed
    pub async fn chunk(&self, index: u32) -> Result<Bytes> {
        self.wait_for_chunk(index).await?;
        let len = self.plan.chunk_len(index)?;

        match tokio::fs::read(chunk_path(&self.chunk_dir, index)).await {
            Ok(data) if data.len() as u64 == len => return Ok(Bytes::from(data)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // chunk files are removed once the destination is reassembled
        trace!(chunk = index, "Reading chunk from reassembled file");
        let mut file = tokio::fs::File::open(&self.destination).await?;
        file.seek(SeekFrom::Start(self.plan.offset(index))).await?;
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    /// Mark chunk `index` consumed and ask for the next one without waiting for it
    pub fn finish_chunk(&self, index: u32) {
        let next = index + 1;
        if next < self.plan.chunk_count() && !self.ledger.borrow().contains(next) {
            self.hints.push_front(next);
        }
    }

    /// All chunks in order; ends after the first error
    pub fn stream(self) -> impl Stream<Item = Result<Bytes>> {
        stream::unfold((self, 0u32, false), |(source, index, failed)| async move {
            if failed || index >= source.chunk_count() {
                return None;
            }
            match source.chunk(index).await {
                Ok(data) => {
                    source.finish_chunk(index);
                    Some((Ok(data), (source, index + 1, false)))
                }
                Err(e) => Some((Err(e), (source, index, true))),
            }
        })
    }
}
