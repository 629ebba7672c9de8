// src/queue/segment.rs
//! Overflow segment storage
//!
//! Each spilled chunk becomes one compressed segment file inside a working
//! directory private to the queue instance. Files are written once, read
//! once, and deleted after restore; `purge` removes whatever is left when
//! the queue is disposed.

use crate::events::event::WorkloadEvent;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Compression level for overflow segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// zstd level 1, lowest latency on the spill path
    Fast,

    /// zstd level 3
    Balanced,

    /// zstd level 19, smallest files
    Best,
}

impl CompressionLevel {
    /// Map to the zstd level number
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        CompressionLevel::Fast
    }
}

/// Disk store for one queue's overflow segments
pub struct SegmentStore {
    /// Working directory owned by this store
    dir: PathBuf,

    /// Compression level applied to segment payloads
    level: CompressionLevel,
}

impl SegmentStore {
    /// Create a fresh working directory under `root`
    pub fn create(root: &Path, level: CompressionLevel) -> Result<Self> {
        let dir = root.join(format!("parrot-queue-{}", Ulid::new()));
        fs::create_dir_all(&dir).map_err(|e| {
            EngineError::StorageFailed(format!(
                "Failed to create spill directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir, level })
    }

    /// Write one chunk as a compressed segment file
    pub fn write(&self, seq: u64, events: &[WorkloadEvent]) -> Result<()> {
        let payload = serde_json::to_vec(events).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to serialize segment {}: {}", seq, e))
        })?;

        let compressed = zstd::encode_all(payload.as_slice(), self.level.as_i32())
            .map_err(|e| {
                EngineError::StorageFailed(format!("Failed to compress segment {}: {}", seq, e))
            })?;

        let path = self.path_for(seq);
        fs::write(&path, compressed).map_err(|e| {
            EngineError::StorageFailed(format!(
                "Failed to write segment {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Read one segment back into events
    pub fn read(&self, seq: u64) -> Result<Vec<WorkloadEvent>> {
        let path = self.path_for(seq);
        let compressed = fs::read(&path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to read segment {}: {}", path.display(), e))
        })?;

        let payload = zstd::decode_all(compressed.as_slice()).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to decompress segment {}: {}", seq, e))
        })?;

        serde_json::from_slice(&payload).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to decode segment {}: {}", seq, e))
        })
    }

    /// Delete one segment file
    pub fn delete(&self, seq: u64) -> Result<()> {
        let path = self.path_for(seq);
        fs::remove_file(&path).map_err(|e| {
            EngineError::StorageFailed(format!(
                "Failed to delete segment {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Remove the working directory and everything in it
    pub fn purge(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| {
                EngineError::StorageFailed(format!(
                    "Failed to purge spill directory {}: {}",
                    self.dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Working directory for this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segment files currently on disk
    pub fn file_count(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{:08}.seg", seq))
    }
}
