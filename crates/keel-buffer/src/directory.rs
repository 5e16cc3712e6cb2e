//! Extendible hash table for the buffer pool's page directory.

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Extendible hash table mapping keys to values.
///
/// The directory is a vector of `2^G` bucket references (G is the global
/// depth). Each bucket carries its own local depth `L <= G` and an
/// insertion-ordered list of entries with bounded capacity. A key lands in
/// the directory slot selected by the low `G` bits of its hash.
///
/// Inserting into a full bucket doubles the directory if the bucket's local
/// depth equals the global depth, then splits the bucket into two at depth
/// `L + 1` and retries; one insert may cascade several splits when the
/// redistributed entries all share low hash bits. The table never shrinks
/// and buckets are never merged on removal.
///
/// Buckets live in a slab and the directory stores slab indices, so several
/// directory slots can alias one bucket without shared-ownership types. A
/// split reuses the old bucket's slab slot for the low half and appends the
/// high half, so the slab length is exactly the live bucket count.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    /// Maximum number of entries per bucket.
    bucket_size: usize,
    /// Hash state; pluggable so tests can pin bucket placement.
    hasher: S,
    /// Directory and bucket slab.
    inner: Mutex<TableInner<K, V>>,
}

struct TableInner<K, V> {
    /// Number of low hash bits used to index the directory.
    global_depth: usize,
    /// Directory of slab indices; length is always `2^global_depth`.
    dir: Vec<usize>,
    /// Bucket slab.
    buckets: Vec<Bucket<K, V>>,
}

struct Bucket<K, V> {
    /// Number of low hash bits this bucket discriminates on.
    local_depth: usize,
    /// Entries in insertion order.
    items: Vec<(K, V)>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table with the given bucket capacity and a random hasher.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Creates a table with the given bucket capacity and hash state.
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size >= 1, "bucket capacity must be at least 1");
        Self {
            bucket_size,
            hasher,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    /// Directory index for a key at the given global depth.
    fn index_of(&self, key: &K, global_depth: usize) -> usize {
        let mask = (1usize << global_depth) - 1;
        (self.hasher.hash_one(key) as usize) & mask
    }

    /// Looks up a key.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let idx = self.index_of(key, inner.global_depth);
        let bucket = &inner.buckets[inner.dir[idx]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or updates a mapping.
    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        loop {
            let idx = self.index_of(&key, inner.global_depth);
            let slab = inner.dir[idx];
            let bucket = &mut inner.buckets[slab];

            // Upsert on an existing key never splits.
            if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }

            // Bucket full: grow the directory if it cannot tell the two
            // halves apart, then split and retry from the top.
            let local_depth = bucket.local_depth;
            if local_depth == inner.global_depth {
                inner.dir.extend_from_within(..);
                inner.global_depth += 1;
            }

            let items = std::mem::take(&mut inner.buckets[slab].items);
            inner.buckets[slab].local_depth = local_depth + 1;
            let high_slab = inner.buckets.len();
            inner.buckets.push(Bucket {
                local_depth: local_depth + 1,
                items: Vec::new(),
            });

            // Rewrite every slot that pointed at the split bucket: the bit
            // at position `local_depth` now discriminates the two halves.
            let bit = 1usize << local_depth;
            for (i, slot) in inner.dir.iter_mut().enumerate() {
                if *slot == slab && (i & bit) != 0 {
                    *slot = high_slab;
                }
            }

            // Redistribute in insertion order.
            for (k, v) in items {
                let t = self.index_of(&k, inner.global_depth);
                let b = inner.dir[t];
                inner.buckets[b].items.push((k, v));
            }
        }
    }

    /// Removes a key. Returns true if it was present.
    ///
    /// Removal is bucket-local; buckets are never merged.
    pub fn remove(&self, key: &K) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let idx = self.index_of(key, inner.global_depth);
        let slab = inner.dir[idx];
        let bucket = &mut inner.buckets[slab];

        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns the global depth of the directory.
    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    /// Returns the local depth of the bucket behind a directory slot.
    pub fn local_depth(&self, dir_index: usize) -> usize {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].local_depth
    }

    /// Returns the number of live buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every entry, in no particular order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let inner = self.inner.lock();
        for bucket in &inner.buckets {
            for (k, v) in &bucket.items {
                f(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    /// Hasher that returns the last u64 written to it, so tests control
    /// bucket placement exactly.
    #[derive(Default, Clone)]
    struct IdentityState;

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            self.0 = u64::from_le_bytes(buf);
        }

        fn write_u64(&mut self, i: u64) {
            self.0 = i;
        }
    }

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn identity_table(bucket_size: usize) -> ExtendibleHashTable<u64, u64, IdentityState> {
        ExtendibleHashTable::with_hasher(bucket_size, IdentityState)
    }

    #[test]
    fn test_new_table() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_find() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        table.insert(2, 20);
        table.insert(3, 30);

        assert_eq!(table.find(&1), Some(10));
        assert_eq!(table.find(&2), Some(20));
        assert_eq!(table.find(&3), Some(30));
        assert_eq!(table.find(&4), None);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_insert_upsert() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(2);

        table.insert(1, 10);
        table.insert(1, 11);
        assert_eq!(table.find(&1), Some(11));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        assert!(table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_directory_doubling_preserves_mappings() {
        let table = identity_table(2);

        for k in 0..16u64 {
            table.insert(k, k * 100);
        }
        for k in 0..16u64 {
            assert_eq!(table.find(&k), Some(k * 100), "key {k} lost");
        }
        assert!(table.global_depth() >= 3);
    }

    #[test]
    fn test_split_behavior_spec_sequence() {
        // Bucket capacity 2, hashes 0,1,2,3: the first overflow (hash 2
        // against the full bucket {0,1}) doubles the directory once and
        // splits by the low bit; everything then fits at depth 1.
        let table = identity_table(2);

        table.insert(0, 0);
        table.insert(1, 1);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);

        table.insert(2, 2);
        table.insert(3, 3);
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.local_depth(0), 1);
        assert_eq!(table.local_depth(1), 1);

        // Two more inserts overflow each depth-1 bucket in turn: the even
        // bucket split doubles the directory to depth 2, the odd bucket
        // split only rewrites its slots.
        table.insert(4, 4);
        assert_eq!(table.global_depth(), 2);
        assert_eq!(table.num_buckets(), 3);

        table.insert(5, 5);
        assert_eq!(table.global_depth(), 2);
        assert_eq!(table.num_buckets(), 4);
        for slot in 0..4 {
            assert_eq!(table.local_depth(slot), 2, "slot {slot}");
        }

        for k in 0..6u64 {
            assert_eq!(table.find(&k), Some(k));
        }
    }

    #[test]
    fn test_cascading_split() {
        // Keys 0 and 8 agree on the low three hash bits, so inserting 4
        // (shares two low bits) forces repeated splits until depth 3.
        let table = identity_table(2);

        table.insert(0, 0);
        table.insert(8, 8);
        table.insert(4, 4);

        assert_eq!(table.global_depth(), 3);
        assert_eq!(table.find(&0), Some(0));
        assert_eq!(table.find(&8), Some(8));
        assert_eq!(table.find(&4), Some(4));
    }

    #[test]
    fn test_bucket_count_grows_by_one_per_split() {
        let table = identity_table(1);

        table.insert(0, 0);
        assert_eq!(table.num_buckets(), 1);
        table.insert(1, 1); // split 0 -> depth 1
        assert_eq!(table.num_buckets(), 2);
        table.insert(2, 2); // split even bucket -> depth 2
        assert_eq!(table.num_buckets(), 3);
        table.insert(3, 3); // split odd bucket -> depth 2
        assert_eq!(table.num_buckets(), 4);
    }

    #[test]
    fn test_local_depth_never_exceeds_global() {
        let table = identity_table(2);
        for k in 0..64u64 {
            table.insert(k, k);
        }
        let g = table.global_depth();
        for slot in 0..(1 << g) {
            assert!(table.local_depth(slot) <= g);
        }
    }

    #[test]
    fn test_remove_does_not_merge_buckets() {
        let table = identity_table(2);
        for k in 0..8u64 {
            table.insert(k, k);
        }
        let buckets_before = table.num_buckets();
        let depth_before = table.global_depth();

        for k in 0..8u64 {
            assert!(table.remove(&k));
        }
        assert_eq!(table.num_buckets(), buckets_before);
        assert_eq!(table.global_depth(), depth_before);
        assert!(table.is_empty());
    }

    #[test]
    fn test_for_each_visits_all() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(2);
        for k in 0..10u64 {
            table.insert(k, k);
        }

        let mut seen = std::collections::HashSet::new();
        table.for_each(|k, _| {
            seen.insert(*k);
        });
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_random_hasher_workload() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);

        for k in 0..1000u64 {
            table.insert(k, k + 1);
        }
        assert_eq!(table.len(), 1000);
        for k in 0..1000u64 {
            assert_eq!(table.find(&k), Some(k + 1));
        }

        for k in (0..1000u64).step_by(2) {
            assert!(table.remove(&k));
        }
        assert_eq!(table.len(), 500);
        for k in 0..1000u64 {
            if k % 2 == 0 {
                assert_eq!(table.find(&k), None);
            } else {
                assert_eq!(table.find(&k), Some(k + 1));
            }
        }
    }
}
