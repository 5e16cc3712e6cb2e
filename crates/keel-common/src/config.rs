//! Configuration structures for KeelDB.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the KeelDB engine core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the data file.
    pub data_dir: PathBuf,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// K constant for LRU-K replacement (k-th most recent access).
    pub replacer_k: usize,
    /// Enable fsync after disk writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_frames: 1024, // 4 MB with 4 KB pages
            replacer_k: 2,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_bytes(&self) -> usize {
        self.buffer_pool_frames * PAGE_SIZE
    }

    /// Returns a frame count sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so the pool stays useful on low-memory systems.
    pub fn auto_frames() -> usize {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        (target_bytes / PAGE_SIZE).max(1_000)
    }
}
