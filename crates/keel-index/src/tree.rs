//! Page-based B+ tree index over the buffer pool.
//!
//! The tree never touches disk directly: every node operation goes through
//! buffer pool pins, and every pin travels inside a page guard so it is
//! released on all exit paths. Internal pages direct the search; leaf pages
//! hold the entries and chain together for range scans.
//!
//! Concurrency follows latch crabbing. Readers descend hand-over-hand under
//! shared page latches. Writers descend under exclusive latches, holding the
//! path from the root in a context and releasing all ancestors the moment
//! the current node is safe (insert: cannot split; delete: cannot underflow).
//! The root page id lives in its own lock, distinct from any page latch, so
//! a root split or collapse publishes atomically.

use crate::header::HeaderPage;
use crate::iterator::TreeIterator;
use crate::key::{IndexKey, IndexValue};
use crate::node::{self, InternalNode, LeafNode, NodeKind};
use keel_buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use keel_common::page::{PageId, HEADER_PAGE_ID};
use keel_common::{KeelError, Result};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

/// The operation a write descent is performing; decides when a node is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Insert,
    Remove,
}

/// Write guards held along the descent path, root side first.
///
/// Dropping the context releases everything it still holds.
struct Context<'a> {
    /// Guard over the tree's root page id cell, held until the descent
    /// proves the root cannot change.
    root_latch: Option<RwLockWriteGuard<'a, PageId>>,
    /// Exclusive page guards for the ancestors of the current node.
    write_set: VecDeque<WritePageGuard>,
}

impl<'a> Context<'a> {
    fn new(root_latch: RwLockWriteGuard<'a, PageId>) -> Self {
        Self {
            root_latch: Some(root_latch),
            write_set: VecDeque::new(),
        }
    }

    /// Releases every ancestor latch, root cell included. Called when the
    /// current node absorbs the operation without structural changes.
    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_latch = None;
    }
}

/// A B+ tree index parameterised by key and value type.
///
/// `leaf_max` and `internal_max` bound the entry counts of leaf and internal
/// pages; non-root minimums are `ceil((leaf_max - 1) / 2)` and
/// `ceil(internal_max / 2)` respectively. Keys are unique.
pub struct BPlusTree<K, V> {
    /// Index name, the key into the header page registry.
    pub(crate) name: String,
    /// Buffer pool every page access goes through.
    pub(crate) pool: Arc<BufferPoolManager>,
    /// Maximum leaf entry count.
    pub(crate) leaf_max: usize,
    /// Maximum internal child count.
    pub(crate) internal_max: usize,
    /// Root page id. Its lock is the dedicated root latch.
    pub(crate) root: RwLock<PageId>,
    pub(crate) _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Creates a new empty index and registers it in the header page.
    pub fn create(
        name: &str,
        pool: Arc<BufferPoolManager>,
        leaf_max: usize,
        internal_max: usize,
    ) -> Result<Self> {
        Self::check_sizes(leaf_max, internal_max);

        let tree = Self {
            name: name.to_string(),
            pool,
            leaf_max,
            internal_max,
            root: RwLock::new(PageId::INVALID),
            _marker: PhantomData,
        };
        tree.update_root_page_id(PageId::INVALID, true)?;
        Ok(tree)
    }

    /// Opens an index previously registered in the header page.
    pub fn open(
        name: &str,
        pool: Arc<BufferPoolManager>,
        leaf_max: usize,
        internal_max: usize,
    ) -> Result<Self> {
        Self::check_sizes(leaf_max, internal_max);

        let root = {
            let guard = pool.fetch_page_read(HEADER_PAGE_ID)?;
            let header = HeaderPage::decode(guard.data())?;
            header
                .get(name)
                .ok_or_else(|| KeelError::IndexNotFound(name.to_string()))?
        };

        Ok(Self {
            name: name.to_string(),
            pool,
            leaf_max,
            internal_max,
            root: RwLock::new(root),
            _marker: PhantomData,
        })
    }

    fn check_sizes(leaf_max: usize, internal_max: usize) {
        assert!(leaf_max >= 3, "leaf_max must be at least 3");
        assert!(internal_max >= 3, "internal_max must be at least 3");
        assert!(
            leaf_max <= node::leaf_capacity::<K, V>(),
            "leaf_max {leaf_max} does not fit a page (capacity {})",
            node::leaf_capacity::<K, V>()
        );
        assert!(
            internal_max <= node::internal_capacity::<K>(),
            "internal_max {internal_max} does not fit a page (capacity {})",
            node::internal_capacity::<K>()
        );
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        !self.root.read().is_valid()
    }

    /// Returns the current root page id.
    pub fn get_root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records the root page id in the header page. `insert` registers a
    /// new index record; otherwise the existing record is updated.
    fn update_root_page_id(&self, root: PageId, insert: bool) -> Result<()> {
        let mut guard = self.pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::decode(guard.data())?;
        if insert {
            header.insert(&self.name, root)?;
        } else {
            header.update(&self.name, root)?;
        }
        header.encode(guard.data_mut());
        Ok(())
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Descends to a leaf under shared latches, hand-over-hand: the child is
    /// latched before the parent latch drops. `key = None` targets the
    /// leftmost leaf.
    pub(crate) fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<ReadPageGuard>> {
        let root_latch = self.root.read();
        if !root_latch.is_valid() {
            return Ok(None);
        }
        let mut guard = self.pool.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            match NodeKind::of(guard.data())? {
                NodeKind::Leaf => return Ok(Some(guard)),
                NodeKind::Internal => {
                    let internal = InternalNode::<K>::decode(guard.data())?;
                    let child = match key {
                        Some(k) => internal.child_for(k),
                        None => internal.child_at(0),
                    };
                    let child_guard = self.pool.fetch_page_read(child)?;
                    guard = child_guard;
                }
            }
        }
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let Some(guard) = self.find_leaf_read(Some(key))? else {
            return Ok(None);
        };
        let leaf = LeafNode::<K, V>::decode(guard.data())?;
        Ok(leaf.lookup(key).cloned())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Descends to the owning leaf under exclusive latches, releasing all
    /// ancestors whenever the current node is safe for `op`.
    fn find_leaf_write<'a>(
        &'a self,
        key: &K,
        op: TreeOp,
        ctx: &mut Context<'a>,
    ) -> Result<WritePageGuard> {
        let root_id = **ctx
            .root_latch
            .as_ref()
            .expect("write descent starts under the root latch");
        let mut guard = self.pool.fetch_page_write(root_id)?;
        let mut at_root = true;

        loop {
            match NodeKind::of(guard.data())? {
                NodeKind::Leaf => {
                    let leaf = LeafNode::<K, V>::decode(guard.data())?;
                    if Self::leaf_is_safe(&leaf, at_root, op) {
                        ctx.release_ancestors();
                    }
                    return Ok(guard);
                }
                NodeKind::Internal => {
                    let internal = InternalNode::<K>::decode(guard.data())?;
                    if Self::internal_is_safe(&internal, at_root, op) {
                        ctx.release_ancestors();
                    }
                    let child = internal.child_for(key);
                    ctx.write_set.push_back(guard);
                    guard = self.pool.fetch_page_write(child)?;
                    at_root = false;
                }
            }
        }
    }

    fn leaf_is_safe(leaf: &LeafNode<K, V>, at_root: bool, op: TreeOp) -> bool {
        match op {
            // One more entry must not reach the split threshold.
            TreeOp::Insert => leaf.len() + 1 < leaf.max_size,
            // One fewer entry must not underflow; the root leaf only
            // changes the tree when its last entry goes.
            TreeOp::Remove => {
                if at_root {
                    leaf.len() > 1
                } else {
                    leaf.len() > leaf.min_size()
                }
            }
        }
    }

    fn internal_is_safe(internal: &InternalNode<K>, at_root: bool, op: TreeOp) -> bool {
        match op {
            TreeOp::Insert => internal.size() < internal.max_size,
            TreeOp::Remove => {
                if at_root {
                    internal.size() > 2
                } else {
                    internal.size() > internal.min_size()
                }
            }
        }
    }

    /// Inserts a key-value pair. Returns false on a duplicate key, leaving
    /// the tree untouched.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let mut root_latch = self.root.write();

        if !root_latch.is_valid() {
            // Empty tree: the new leaf is the root.
            let mut guard = self.pool.new_page()?;
            let root_id = guard.page_id();
            let mut leaf = LeafNode::<K, V>::new(root_id, self.leaf_max);
            leaf.insert(key.clone(), value.clone());
            leaf.encode(guard.data_mut());
            drop(guard);

            *root_latch = root_id;
            self.update_root_page_id(root_id, false)?;
            return Ok(true);
        }

        let mut ctx = Context::new(root_latch);
        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Insert, &mut ctx)?;
        let mut leaf = LeafNode::<K, V>::decode(leaf_guard.data())?;

        if !leaf.insert(key.clone(), value.clone()) {
            return Ok(false);
        }
        if !leaf.is_overflowed() {
            leaf.encode(leaf_guard.data_mut());
            return Ok(true);
        }

        // Split: the upper half moves to a fresh right sibling and its
        // first key rises into the parent.
        let mut right_guard = self.pool.new_page()?;
        let right = leaf.split_off(right_guard.page_id());
        let rising = right.first_key().clone();
        leaf.encode(leaf_guard.data_mut());
        right.encode(right_guard.data_mut());

        self.insert_into_parent(&mut ctx, leaf_guard, rising, right_guard)?;
        Ok(true)
    }

    /// Attaches a freshly split-off right node to the parent of `left`,
    /// splitting upward as long as parents overflow.
    fn insert_into_parent(
        &self,
        ctx: &mut Context<'_>,
        mut left_guard: WritePageGuard,
        mut key: K,
        mut right_guard: WritePageGuard,
    ) -> Result<()> {
        loop {
            let right_id = right_guard.page_id();

            let Some(mut parent_guard) = ctx.write_set.pop_back() else {
                // `left` was the root: grow the tree by one level.
                let mut root_guard = self.pool.new_page()?;
                let new_root_id = root_guard.page_id();
                let root_node = InternalNode::new_root(
                    new_root_id,
                    self.internal_max,
                    left_guard.page_id(),
                    key,
                    right_id,
                );
                root_node.encode(root_guard.data_mut());
                node::set_parent_in_page(left_guard.data_mut(), new_root_id);
                node::set_parent_in_page(right_guard.data_mut(), new_root_id);

                let root_latch = ctx
                    .root_latch
                    .as_mut()
                    .expect("root latch held across a root split");
                **root_latch = new_root_id;
                drop(root_guard);
                drop(left_guard);
                drop(right_guard);
                return self.update_root_page_id(new_root_id, false);
            };

            let parent_id = parent_guard.page_id();
            let mut parent = InternalNode::<K>::decode(parent_guard.data())?;

            if !parent.is_full() {
                parent.insert(key, right_id);
                parent.encode(parent_guard.data_mut());
                node::set_parent_in_page(right_guard.data_mut(), parent_id);
                return Ok(());
            }

            // Parent overflows: insert into the decoded copy, split it, and
            // keep the risen key moving up.
            parent.insert(key, right_id);
            let mut new_right_guard = self.pool.new_page()?;
            let (risen, parent_right) = parent.split_off(new_right_guard.page_id());
            parent.encode(parent_guard.data_mut());
            parent_right.encode(new_right_guard.data_mut());

            // The two nodes we attached may have landed on either side of
            // the parent split; fix their parent pointers while we still
            // hold their guards.
            let left_id = left_guard.page_id();
            let left_parent = if parent_right.child_index_of(left_id).is_some() {
                parent_right.page_id
            } else {
                parent_id
            };
            node::set_parent_in_page(left_guard.data_mut(), left_parent);
            let right_parent = if parent_right.child_index_of(right_id).is_some() {
                parent_right.page_id
            } else {
                parent_id
            };
            node::set_parent_in_page(right_guard.data_mut(), right_parent);
            drop(left_guard);
            drop(right_guard);

            // Every other child that moved right gets re-fetched and
            // retargeted.
            for (_, child) in &parent_right.entries {
                if *child == left_id || *child == right_id {
                    continue;
                }
                let mut child_guard = self.pool.fetch_page_write(*child)?;
                node::set_parent_in_page(child_guard.data_mut(), parent_right.page_id);
            }

            key = risen;
            left_guard = parent_guard;
            right_guard = new_right_guard;
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes a key. Returns false when the key is absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let root_latch = self.root.write();
        if !root_latch.is_valid() {
            return Ok(false);
        }

        let mut ctx = Context::new(root_latch);
        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Remove, &mut ctx)?;
        let mut leaf = LeafNode::<K, V>::decode(leaf_guard.data())?;

        if !leaf.remove(key) {
            return Ok(false);
        }

        if leaf.parent_page_id == PageId::INVALID {
            // Root leaf: shrinking below the minimum is allowed; emptying
            // out empties the tree.
            if leaf.is_empty() {
                let root_id = leaf_guard.page_id();
                let root_latch = ctx
                    .root_latch
                    .as_mut()
                    .expect("root latch held when emptying the tree");
                **root_latch = PageId::INVALID;
                drop(leaf_guard);
                self.pool.delete_page(root_id)?;
                self.update_root_page_id(PageId::INVALID, false)?;
            } else {
                leaf.encode(leaf_guard.data_mut());
            }
            return Ok(true);
        }

        if !leaf.is_underflowed() {
            leaf.encode(leaf_guard.data_mut());
            return Ok(true);
        }

        self.rebalance_leaf(&mut ctx, leaf_guard, leaf)?;
        Ok(true)
    }

    /// Fixes an underflowed non-root leaf: redistribute from a sibling with
    /// entries to spare (left preferred), else merge (left preferred).
    fn rebalance_leaf(
        &self,
        ctx: &mut Context<'_>,
        mut guard: WritePageGuard,
        mut leaf: LeafNode<K, V>,
    ) -> Result<()> {
        let mut parent_guard = ctx
            .write_set
            .pop_back()
            .expect("parent latch retained for a leaf at minimum");
        let mut parent = InternalNode::<K>::decode(parent_guard.data())?;
        let idx = parent.child_index_of(leaf.page_id).ok_or_else(|| {
            KeelError::TreeCorrupted(format!("leaf {} missing from its parent", leaf.page_id))
        })?;

        // Sibling guards are taken while the shared parent is exclusively
        // latched, which serialises rebalancing under one parent.
        let mut left = if idx > 0 {
            let g = self.pool.fetch_page_write(parent.child_at(idx - 1))?;
            let n = LeafNode::<K, V>::decode(g.data())?;
            Some((g, n))
        } else {
            None
        };

        if let Some((left_guard, left_leaf)) = left.as_mut() {
            if left_leaf.len() > left_leaf.min_size() {
                // Borrow the donor's last entry; the separator becomes the
                // receiver's new first key.
                let moved = left_leaf.entries.pop().expect("donor above minimum");
                leaf.entries.insert(0, moved);
                parent.set_key_at(idx, leaf.first_key().clone());

                left_leaf.encode(left_guard.data_mut());
                leaf.encode(guard.data_mut());
                parent.encode(parent_guard.data_mut());
                return Ok(());
            }
        }

        let mut right = if idx + 1 < parent.size() {
            let g = self.pool.fetch_page_write(parent.child_at(idx + 1))?;
            let n = LeafNode::<K, V>::decode(g.data())?;
            Some((g, n))
        } else {
            None
        };

        if let Some((right_guard, right_leaf)) = right.as_mut() {
            if right_leaf.len() > right_leaf.min_size() {
                let moved = right_leaf.entries.remove(0);
                leaf.entries.push(moved);
                parent.set_key_at(idx + 1, right_leaf.first_key().clone());

                right_leaf.encode(right_guard.data_mut());
                leaf.encode(guard.data_mut());
                parent.encode(parent_guard.data_mut());
                return Ok(());
            }
        }

        // Merge. The right node of the pair is freed and its separator
        // leaves the parent.
        let (survivor_guard, freed_guard, freed_id, removed_idx) =
            if let Some((mut left_guard, mut left_leaf)) = left {
                left_leaf.merge_from(&mut leaf);
                left_leaf.encode(left_guard.data_mut());
                (left_guard, guard, leaf.page_id, idx)
            } else {
                let (right_guard, mut right_leaf) = right.expect("non-root leaf has a sibling");
                let freed_id = right_leaf.page_id;
                leaf.merge_from(&mut right_leaf);
                leaf.encode(guard.data_mut());
                (guard, right_guard, freed_id, idx + 1)
            };
        parent.remove_entry(removed_idx);

        drop(freed_guard);
        self.pool.delete_page(freed_id)?;

        self.resolve_parent(ctx, parent_guard, parent, survivor_guard)
    }

    /// Fixes an underflowed non-root internal node.
    ///
    /// Redistribution rotates through the parent separator; merging pulls
    /// the separator down into the freed node's sentinel slot. Children that
    /// change nodes get their parent pointers retargeted.
    fn rebalance_internal(
        &self,
        ctx: &mut Context<'_>,
        mut guard: WritePageGuard,
        mut current: InternalNode<K>,
    ) -> Result<()> {
        let mut parent_guard = ctx
            .write_set
            .pop_back()
            .expect("parent latch retained for an internal node at minimum");
        let mut parent = InternalNode::<K>::decode(parent_guard.data())?;
        let idx = parent.child_index_of(current.page_id).ok_or_else(|| {
            KeelError::TreeCorrupted(format!(
                "internal {} missing from its parent",
                current.page_id
            ))
        })?;

        let mut left = if idx > 0 {
            let g = self.pool.fetch_page_write(parent.child_at(idx - 1))?;
            let n = InternalNode::<K>::decode(g.data())?;
            Some((g, n))
        } else {
            None
        };

        if let Some((left_guard, left_node)) = left.as_mut() {
            if left_node.size() > left_node.min_size() {
                // The separator comes down in front of the receiver's first
                // child; the donor's last key goes up as the new separator.
                let (donor_key, donor_child) =
                    left_node.entries.pop().expect("donor above minimum");
                current.set_key_at(0, parent.key_at(idx).clone());
                current.entries.insert(0, (donor_key.clone(), donor_child));
                parent.set_key_at(idx, donor_key);

                left_node.encode(left_guard.data_mut());
                current.encode(guard.data_mut());
                parent.encode(parent_guard.data_mut());
                self.retarget_children(&[donor_child], current.page_id)?;
                return Ok(());
            }
        }

        let mut right = if idx + 1 < parent.size() {
            let g = self.pool.fetch_page_write(parent.child_at(idx + 1))?;
            let n = InternalNode::<K>::decode(g.data())?;
            Some((g, n))
        } else {
            None
        };

        if let Some((right_guard, right_node)) = right.as_mut() {
            if right_node.size() > right_node.min_size() {
                // The separator comes down behind the receiver's last
                // child; the donor's risen first key replaces it.
                let (_, donor_child) = right_node.entries.remove(0);
                current
                    .entries
                    .push((parent.key_at(idx + 1).clone(), donor_child));
                parent.set_key_at(idx + 1, right_node.key_at(0).clone());

                right_node.encode(right_guard.data_mut());
                current.encode(guard.data_mut());
                parent.encode(parent_guard.data_mut());
                self.retarget_children(&[donor_child], current.page_id)?;
                return Ok(());
            }
        }

        // Merge, parent separator filling the right side's sentinel slot.
        let (survivor_guard, survivor_id, freed_guard, freed_id, removed_idx, moved) =
            if let Some((mut left_guard, mut left_node)) = left {
                let moved: Vec<PageId> = current.entries.iter().map(|(_, c)| *c).collect();
                left_node.merge_from(parent.key_at(idx).clone(), &mut current);
                left_node.encode(left_guard.data_mut());
                let survivor_id = left_node.page_id;
                (left_guard, survivor_id, guard, current.page_id, idx, moved)
            } else {
                let (right_guard, mut right_node) =
                    right.expect("non-root internal node has a sibling");
                let freed_id = right_node.page_id;
                let moved: Vec<PageId> = right_node.entries.iter().map(|(_, c)| *c).collect();
                current.merge_from(parent.key_at(idx + 1).clone(), &mut right_node);
                current.encode(guard.data_mut());
                let survivor_id = current.page_id;
                (guard, survivor_id, right_guard, freed_id, idx + 1, moved)
            };
        parent.remove_entry(removed_idx);

        drop(freed_guard);
        self.pool.delete_page(freed_id)?;
        self.retarget_children(&moved, survivor_id)?;

        self.resolve_parent(ctx, parent_guard, parent, survivor_guard)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterator over the whole tree in ascending key order.
    pub fn begin(&self) -> Result<TreeIterator<K, V>> {
        match self.find_leaf_read(None)? {
            None => Ok(TreeIterator::exhausted(Arc::clone(&self.pool))),
            Some(guard) => {
                let leaf = LeafNode::<K, V>::decode(guard.data())?;
                TreeIterator::at(Arc::clone(&self.pool), guard, leaf, 0)
            }
        }
    }

    /// Iterator starting at the first entry with key `>= key`.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K, V>> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(TreeIterator::exhausted(Arc::clone(&self.pool))),
            Some(guard) => {
                let leaf = LeafNode::<K, V>::decode(guard.data())?;
                let index = leaf.position_of(key).unwrap_or_else(|pos| pos);
                TreeIterator::at(Arc::clone(&self.pool), guard, leaf, index)
            }
        }
    }

    /// The exhausted iterator every scan converges to.
    pub fn end(&self) -> TreeIterator<K, V> {
        TreeIterator::exhausted(Arc::clone(&self.pool))
    }

    /// Points each child page at its new parent.
    fn retarget_children(&self, children: &[PageId], parent: PageId) -> Result<()> {
        for child in children {
            let mut child_guard = self.pool.fetch_page_write(*child)?;
            node::set_parent_in_page(child_guard.data_mut(), parent);
        }
        Ok(())
    }

    /// After a merge removed an entry from `parent`, decides whether the
    /// parent itself needs fixing.
    fn resolve_parent(
        &self,
        ctx: &mut Context<'_>,
        mut parent_guard: WritePageGuard,
        parent: InternalNode<K>,
        mut survivor_guard: WritePageGuard,
    ) -> Result<()> {
        if parent.parent_page_id == PageId::INVALID {
            if parent.size() == 1 {
                // The root lost its last separator: promote its only child.
                let old_root_id = parent_guard.page_id();
                let new_root_id = survivor_guard.page_id();
                node::set_parent_in_page(survivor_guard.data_mut(), PageId::INVALID);

                let root_latch = ctx
                    .root_latch
                    .as_mut()
                    .expect("root latch held when collapsing the root");
                **root_latch = new_root_id;
                drop(parent_guard);
                drop(survivor_guard);
                self.pool.delete_page(old_root_id)?;
                return self.update_root_page_id(new_root_id, false);
            }
            parent.encode(parent_guard.data_mut());
            return Ok(());
        }

        parent.encode(parent_guard.data_mut());
        drop(survivor_guard);

        if parent.is_underflowed() {
            return self.rebalance_internal(ctx, parent_guard, parent);
        }
        Ok(())
    }
}
