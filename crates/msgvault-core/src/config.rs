//! Engine configuration

use crate::{retry::RetryPolicy, CoreError, Result};
use msgvault_crypto::CompatProfile;
use msgvault_transport::DEFAULT_CHUNK_SIZE;
use std::path::PathBuf;
use std::time::Duration;

/// Task scheduler settings, applied per queue
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum RUNNING tasks per queue
    pub max_running: usize,
    /// Scheduler tick interval
    pub tick_interval: Duration,
    /// How long completed and failed tasks stay visible
    pub eviction_delay: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_running: 3,
            tick_interval: Duration::from_millis(500),
            eviction_delay: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

/// Progressive playback settings
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// Wait for one ledger change before re-checking a chunk
    pub poll_interval: Duration,
    /// Number of waits before giving up on a chunk
    pub max_wait_attempts: u32,
    /// Leading chunks fetched ahead of the rest when a stream opens
    pub priority_chunks: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait_attempts: 120,
            priority_chunks: 2,
        }
    }
}

/// Transfer engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Files at or below this size are stored as a single object
    pub single_shot_threshold: u64,
    /// Simultaneous chunk operations per task
    pub chunk_parallelism: usize,
    /// Per-chunk retry policy
    pub retry: RetryPolicy,
    /// Queue scheduler settings
    pub queue: QueueConfig,
    /// Streaming settings
    pub streaming: StreamingConfig,
    /// Directory holding per-task temporary chunk files
    pub temp_dir: PathBuf,
    /// Share-link manifest revision to produce
    pub compat: CompatProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            single_shot_threshold: DEFAULT_CHUNK_SIZE,
            chunk_parallelism: 4,
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
            streaming: StreamingConfig::default(),
            temp_dir: std::env::temp_dir().join("msgvault"),
            compat: CompatProfile::default(),
        }
    }
}

impl EngineConfig {
    /// Set chunk size; the single-shot threshold follows it
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self.single_shot_threshold = chunk_size;
        self
    }

    /// Set the single-shot threshold
    pub fn with_single_shot_threshold(mut self, threshold: u64) -> Self {
        self.single_shot_threshold = threshold;
        self
    }

    /// Set chunk parallelism
    pub fn with_chunk_parallelism(mut self, parallelism: usize) -> Self {
        self.chunk_parallelism = parallelism;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set queue settings
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set streaming settings
    pub fn with_streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the temporary chunk directory
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Set the compatibility profile
    pub fn with_compat(mut self, compat: CompatProfile) -> Self {
        self.compat = compat;
        self
    }

    /// Check the configuration against a transport's payload limit
    pub fn validate(&self, max_payload: usize) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CoreError::Config("chunk size must be positive".to_string()));
        }
        if self.chunk_size > max_payload as u64 {
            return Err(CoreError::Config(format!(
                "chunk size {} exceeds transport limit {}",
                self.chunk_size, max_payload
            )));
        }
        if self.single_shot_threshold > max_payload as u64 {
            return Err(CoreError::Config(format!(
                "single-shot threshold {} exceeds transport limit {}",
                self.single_shot_threshold, max_payload
            )));
        }
        if self.chunk_parallelism == 0 || self.queue.max_running == 0 {
            return Err(CoreError::Config(
                "parallelism and running-task limits must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config("at least one attempt is required".to_string()));
        }
        Ok(())
    }
}
