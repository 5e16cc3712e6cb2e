//! Buffer pool management for KeelDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - LRU-K eviction policy for cache management
//! - Extendible-hash page directory (page id to frame id)
//! - Pin counting and per-page read/write latches for concurrent access
//! - Dirty page tracking with write-back on eviction

mod directory;
mod disk;
mod frame;
mod pool;
mod replacer;

pub use directory::ExtendibleHashTable;
pub use disk::DiskManager;
pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPoolManager, ReadPageGuard, WritePageGuard};
pub use replacer::{LruKReplacer, Replacer};
