//! Error types for KeelDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using KeelError.
pub type Result<T> = std::result::Result<T, KeelError>;

/// Errors that can occur in KeelDB storage operations.
#[derive(Debug, Error)]
pub enum KeelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("buffer pool exhausted, all frames pinned")]
    PoolExhausted,

    #[error("page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    // B+ tree errors
    #[error("duplicate key")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("tree corrupted: {0}")]
    TreeCorrupted(String),

    // Header page errors
    #[error("header page full, cannot register index {0}")]
    HeaderFull(String),

    #[error("index name too long: {name} ({len} bytes, max {max})")]
    IndexNameTooLong { name: String, len: usize, max: usize },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}
