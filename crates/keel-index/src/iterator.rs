//! Forward leaf-scan iterator over a B+ tree.

use crate::key::{IndexKey, IndexValue};
use crate::node::LeafNode;
use keel_buffer::{BufferPoolManager, ReadPageGuard};
use keel_common::page::PageId;
use keel_common::Result;
use std::sync::Arc;

/// Iterator over the entries of a B+ tree in ascending key order.
///
/// Holds a pin and a shared latch on the current leaf for as long as the
/// iterator points into it; `current()` therefore hands out references that
/// stay valid until the next `advance()`. Stepping past the last entry of a
/// leaf pins the successor through the leaf chain and releases the current
/// leaf. Advancing an exhausted iterator is a programmer error and panics.
pub struct TreeIterator<K: IndexKey, V: IndexValue> {
    pool: Arc<BufferPoolManager>,
    /// The pinned leaf and its decoded image; `None` once exhausted.
    current: Option<(ReadPageGuard, LeafNode<K, V>)>,
    /// Entry index within the current leaf.
    index: usize,
}

impl<K: IndexKey, V: IndexValue> TreeIterator<K, V> {
    /// An exhausted iterator.
    pub(crate) fn exhausted(pool: Arc<BufferPoolManager>) -> Self {
        Self {
            pool,
            current: None,
            index: 0,
        }
    }

    /// Positions an iterator at `index` within a leaf, hopping forward
    /// through the chain while the position is past the leaf's last entry.
    pub(crate) fn at(
        pool: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        leaf: LeafNode<K, V>,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            pool,
            current: Some((guard, leaf)),
            index,
        };
        iter.normalize()?;
        Ok(iter)
    }

    /// Moves to the next leaf for as long as the index is out of entries.
    fn normalize(&mut self) -> Result<()> {
        while let Some((_, leaf)) = self.current.as_ref() {
            if self.index < leaf.len() {
                break;
            }
            let next = leaf.next_leaf;
            if !next.is_valid() {
                self.current = None;
                self.index = 0;
                break;
            }
            // Pin the successor before the current leaf is released.
            let next_guard = self.pool.fetch_page_read(next)?;
            let next_leaf = LeafNode::<K, V>::decode(next_guard.data())?;
            self.current = Some((next_guard, next_leaf));
            self.index = 0;
        }
        Ok(())
    }

    /// Returns true when the scan has passed the last entry of the last
    /// leaf.
    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    /// The entry under the cursor, valid until the next `advance`.
    ///
    /// Panics when the iterator is exhausted.
    pub fn current(&self) -> (&K, &V) {
        let (_, leaf) = self
            .current
            .as_ref()
            .expect("index iterator dereferenced past the end");
        let (key, value) = &leaf.entries[self.index];
        (key, value)
    }

    /// Page id of the leaf under the cursor, if any.
    pub fn leaf_page_id(&self) -> Option<PageId> {
        self.current.as_ref().map(|(guard, _)| guard.page_id())
    }

    /// Steps to the next entry, following the leaf chain at leaf
    /// boundaries.
    ///
    /// Panics when the iterator is already exhausted.
    pub fn advance(&mut self) -> Result<()> {
        assert!(
            self.current.is_some(),
            "index iterator advanced past the end"
        );
        self.index += 1;
        self.normalize()
    }
}

impl<K: IndexKey, V: IndexValue> PartialEq for TreeIterator<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.leaf_page_id() == other.leaf_page_id() && self.index == other.index
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for TreeIterator<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let (key, value) = self.current();
        let item = (key.clone(), value.clone());
        match self.advance() {
            Ok(()) => Some(Ok(item)),
            Err(e) => {
                self.current = None;
                Some(Err(e))
            }
        }
    }
}
