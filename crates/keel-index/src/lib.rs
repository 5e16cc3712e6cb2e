//! Disk-backed B+ tree index for KeelDB.
//!
//! This crate provides the ordered index of the storage engine:
//! - Fixed-width key/value codecs for index pages
//! - Typed leaf and internal node pages with explicit byte layouts
//! - A B+ tree with unique keys, split/redistribute/merge rebalancing,
//!   and latch-crabbing concurrency over the buffer pool
//! - A forward leaf-scan iterator
//! - The header-page registry mapping index names to root page ids
//! - DOT and text debug dumps
//!
//! The tree consumes `keel-buffer` for every page access; it never performs
//! disk I/O itself.

mod dump;
mod header;
mod iterator;
mod key;
mod node;
mod tree;

pub use header::{HeaderPage, HeaderRecord, MAX_HEADER_RECORDS, MAX_INDEX_NAME_LEN};
pub use iterator::TreeIterator;
pub use key::{IndexKey, IndexValue, RecordId};
pub use node::{
    internal_capacity, leaf_capacity, InternalNode, LeafNode, NodeKind, NODE_HEADER_LEN,
};
pub use tree::BPlusTree;
