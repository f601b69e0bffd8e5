//! Fixed-size file chunking and in-order reassembly
//!
//! A file of `total_size` bytes becomes `ceil(total_size / chunk_size)` chunks.
//! Every chunk but the last is exactly `chunk_size` bytes and the last one is
//! never padded. Splitting is lazy and restartable at any chunk boundary;
//! reassembly writes strictly by ascending index and refuses to start when a
//! chunk is missing.

use crate::{Result, TransportError};
use bytes::Bytes;
use msgvault_crypto::IncrementalHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Default chunk size (4 MiB), below the per-message attachment limit
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Chunk boundaries of one file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// Plan `total_size` bytes in chunks of `chunk_size`
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TransportError::InvalidChunkSize(chunk_size));
        }
        if u32::try_from(total_size.div_ceil(chunk_size)).is_err() {
            return Err(TransportError::TooManyChunks {
                total_size,
                chunk_size,
            });
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Total file size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal chunk size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks, zero for an empty file
    pub fn chunk_count(&self) -> u32 {
        // bounded by `new`
        u32::try_from(self.total_size.div_ceil(self.chunk_size)).unwrap_or(u32::MAX)
    }

    /// All chunk indices in order
    pub fn indices(&self) -> Range<u32> {
        0..self.chunk_count()
    }

    /// Byte offset where chunk `index` starts
    pub fn offset(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size
    }

    /// Exact length of chunk `index`
    pub fn chunk_len(&self, index: u32) -> Result<u64> {
        let count = self.chunk_count();
        if index >= count {
            return Err(TransportError::ChunkOutOfRange { index, count });
        }
        Ok(self.chunk_size.min(self.total_size - self.offset(index)))
    }
}

/// One chunk's bytes
#[derive(Clone, Debug)]
pub struct Chunk {
    /// 0-based index
    pub index: u32,
    /// Chunk content
    pub data: Bytes,
    /// BLAKE3 hex checksum of `data`
    pub checksum: String,
}

impl Chunk {
    /// Wrap chunk bytes, computing the checksum
    pub fn new(index: u32, data: Bytes) -> Self {
        let checksum = msgvault_crypto::checksum_hex(&data);
        Self {
            index,
            data,
            checksum,
        }
    }

    /// Chunk length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk has no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Lazy iterator over the chunks of a reader
pub struct ChunkReader<R> {
    reader: R,
    plan: ChunkPlan,
    next: u32,
}

/// Split `reader` according to `plan`, starting at chunk 0
pub fn split<R: Read>(reader: R, plan: ChunkPlan) -> ChunkReader<R> {
    ChunkReader {
        reader,
        plan,
        next: 0,
    }
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Resume splitting at chunk `index` by seeking the source
    pub fn starting_at(mut reader: R, plan: ChunkPlan, index: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(plan.offset(index)))?;
        Ok(Self {
            reader,
            plan,
            next: index,
        })
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.plan.chunk_count() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let result = self.plan.chunk_len(index).and_then(|len| {
            let mut buf = vec![0u8; len as usize];
            self.reader.read_exact(&mut buf)?;
            Ok(Chunk::new(index, Bytes::from(buf)))
        });
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.chunk_count().saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

/// Read chunk `index` of the file at `path`
pub async fn read_chunk(path: &Path, plan: &ChunkPlan, index: u32) -> Result<Chunk> {
    let len = plan.chunk_len(index)?;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(plan.offset(index))).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Chunk::new(index, Bytes::from(buf)))
}

/// Write `sources` to `sink` in index order.
///
/// Every index of the plan must be present before anything is written.
pub fn reassemble<R: Read, W: Write>(
    plan: &ChunkPlan,
    mut sources: BTreeMap<u32, R>,
    sink: &mut W,
) -> Result<u64> {
    if let Some(index) = plan.indices().find(|i| !sources.contains_key(i)) {
        return Err(TransportError::MissingChunk { index });
    }
    let mut written = 0u64;
    for index in plan.indices() {
        let expected = plan.chunk_len(index)?;
        let source = sources
            .remove(&index)
            .ok_or(TransportError::MissingChunk { index })?;
        let copied = io::copy(&mut source.take(expected), sink)?;
        if copied != expected {
            return Err(short_chunk(index, copied, expected));
        }
        written += copied;
    }
    sink.flush()?;
    Ok(written)
}

/// Outcome of reassembling chunk files into a destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reassembled {
    /// Bytes written to the destination
    pub bytes_written: u64,
    /// BLAKE3 hex checksum of the destination content
    pub checksum: String,
}

/// Concatenate per-chunk files into `dest`.
///
/// The output is written next to `dest` and renamed into place only once
/// every chunk has been copied, so a failure never leaves a partial file
/// under the final name. Chunk files are left untouched.
pub async fn reassemble_files<F>(plan: &ChunkPlan, chunk_path: F, dest: &Path) -> Result<Reassembled>
where
    F: Fn(u32) -> PathBuf,
{
    for index in plan.indices() {
        let expected = plan.chunk_len(index)?;
        match tokio::fs::metadata(chunk_path(index)).await {
            Ok(meta) if meta.len() == expected => {}
            Ok(_) => return Err(TransportError::MissingChunk { index }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::MissingChunk { index })
            }
            Err(e) => return Err(e.into()),
        }
    }

    let staging = staging_path(dest);
    let mut out = tokio::fs::File::create(&staging).await?;
    let mut hasher = IncrementalHasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    for index in plan.indices() {
        let mut file = tokio::fs::File::open(chunk_path(index)).await?;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    let bytes_written = hasher.bytes_processed();
    if bytes_written != plan.total_size() {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "reassembled {} bytes, expected {}",
                bytes_written,
                plan.total_size()
            ),
        )));
    }
    tokio::fs::rename(&staging, dest).await?;

    Ok(Reassembled {
        bytes_written,
        checksum: hasher.finalize().to_hex(),
    })
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

fn short_chunk(index: u32, got: u64, expected: u64) -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("chunk {} has {} bytes, expected {}", index, got, expected),
    ))
}
