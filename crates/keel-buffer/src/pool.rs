//! Buffer pool manager.

use crate::directory::ExtendibleHashTable;
use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId, PageBuf};
use crate::replacer::{LruKReplacer, Replacer};
use keel_common::page::{PageId, PAGE_SIZE};
use keel_common::{KeelError, Result, StorageConfig};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock};
use std::sync::Arc;

/// Entries per directory bucket.
const DIRECTORY_BUCKET_SIZE: usize = 8;

type ReadLatch = ArcRwLockReadGuard<RawRwLock, PageBuf>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, PageBuf>;

/// Buffer pool manager.
///
/// Owns a fixed array of page frames, the free list, the page directory
/// (page id to frame id, an extendible hash table), the LRU-K replacer, and
/// the disk manager. A single mutex serialises every public operation,
/// including the disk reads and writes each of them issues; simple
/// correctness over throughput.
///
/// Pages are handed out as [`ReadPageGuard`]/[`WritePageGuard`] values that
/// couple the pin with a page latch and release both on drop, so a pin can
/// never leak on an early-return path.
pub struct BufferPoolManager {
    /// Array of buffer frames, fixed at construction.
    frames: Vec<BufferFrame>,
    /// Free frame ids. Protected by the pool mutex.
    free_list: Mutex<Vec<FrameId>>,
    /// Page id to frame id directory.
    directory: ExtendibleHashTable<PageId, FrameId>,
    /// Page replacement policy.
    replacer: LruKReplacer,
    /// Disk manager for page I/O and allocation.
    disk: DiskManager,
}

impl BufferPoolManager {
    /// Creates a buffer pool over the configured data directory.
    ///
    /// A brand-new data file gets its header page (page 0) allocated here so
    /// the index layer can always fetch it.
    pub fn new(config: &StorageConfig) -> Result<Arc<Self>> {
        let disk = DiskManager::new(config)?;
        if disk.num_pages() == 0 {
            disk.allocate_page()?;
        }

        let num_frames = config.buffer_pool_frames;
        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Ok(Arc::new(Self {
            frames,
            free_list: Mutex::new(free_list),
            directory: ExtendibleHashTable::new(DIRECTORY_BUCKET_SIZE),
            replacer: LruKReplacer::new(num_frames, config.replacer_k),
            disk,
        }))
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages resident in the pool.
    pub fn resident_count(&self) -> usize {
        self.directory.len()
    }

    /// Checks whether a page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.directory.contains(&page_id)
    }

    /// Claims a frame: free list first, then eviction.
    ///
    /// A dirty victim is written back before its frame is reused. Must be
    /// called with the pool mutex held.
    fn claim_frame(&self, free_list: &mut Vec<FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = free_list.pop() {
            return Ok(frame_id);
        }

        let victim = self.replacer.evict().ok_or(KeelError::PoolExhausted)?;
        let frame = &self.frames[victim.0 as usize];

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(old_page_id, &data)?;
                frame.set_dirty(false);
            }
            self.directory.remove(&old_page_id);
        }

        Ok(victim)
    }

    /// Installs a page into a claimed frame: resets it, pins it once, and
    /// registers it with the directory and replacer.
    fn install_page(&self, frame_id: FrameId, page_id: PageId) {
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();
        self.directory.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
    }

    /// Allocates a fresh page, pinned with count 1 and zero-filled.
    ///
    /// Fails with [`KeelError::PoolExhausted`] only when no frame is free
    /// and nothing is evictable.
    pub fn new_page(self: &Arc<Self>) -> Result<WritePageGuard> {
        let frame_id = {
            let mut free_list = self.free_list.lock();
            let frame_id = self.claim_frame(&mut free_list)?;
            let page_id = match self.disk.allocate_page() {
                Ok(id) => id,
                Err(e) => {
                    self.frames[frame_id.0 as usize].reset();
                    free_list.push(frame_id);
                    return Err(e);
                }
            };
            self.install_page(frame_id, page_id);
            frame_id
        };

        // Latch outside the pool mutex; the pin keeps the frame ours.
        let frame = &self.frames[frame_id.0 as usize];
        let page_id = frame.page_id().expect("freshly installed page");
        let latch = frame.data().write_arc();
        Ok(WritePageGuard::new(Arc::clone(self), page_id, latch))
    }

    /// Pins a page and returns its frame id, reading from disk on a miss.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        let mut free_list = self.free_list.lock();

        if let Some(frame_id) = self.directory.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.claim_frame(&mut free_list)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                frame.reset();
                free_list.push(frame_id);
                return Err(e);
            }
        }
        frame.set_page_id(Some(page_id));
        frame.pin();
        self.directory.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    /// Fetches a page for reading. The returned guard holds a pin and a
    /// shared page latch.
    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> Result<ReadPageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let latch = self.frames[frame_id.0 as usize].data().read_arc();
        Ok(ReadPageGuard {
            pool: Arc::clone(self),
            page_id,
            latch: Some(latch),
        })
    }

    /// Fetches a page for writing. The returned guard holds a pin and an
    /// exclusive page latch.
    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> Result<WritePageGuard> {
        let frame_id = self.fetch_frame(page_id)?;
        let latch = self.frames[frame_id.0 as usize].data().write_arc();
        Ok(WritePageGuard::new(Arc::clone(self), page_id, latch))
    }

    /// Unpins a page, OR-merging the dirty flag.
    ///
    /// Returns false if the page is not resident or was not pinned. A pin
    /// count reaching zero makes the frame evictable.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> bool {
        let _free_list = self.free_list.lock();

        let Some(frame_id) = self.directory.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            return false;
        }
        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes a page back to disk unconditionally and clears its dirty flag.
    ///
    /// Returns false if the page is not resident. The page is pinned and
    /// read-latched like any reader *before* the pool mutex is re-taken, so
    /// the pool never blocks on a page latch it cannot get; the disk write
    /// itself then runs with the mutex held, serialised against every other
    /// pool operation.
    pub fn flush_page(self: &Arc<Self>, page_id: PageId) -> Result<bool> {
        if !self.directory.contains(&page_id) {
            return Ok(false);
        }

        let guard = self.fetch_page_read(page_id)?;
        {
            let _free_list = self.free_list.lock();
            self.disk.write_page(page_id, guard.data())?;
            // The read latch still excludes writers: nothing dirtied the
            // page between the write above and this clear.
            if let Some(frame_id) = self.directory.find(&page_id) {
                self.frames[frame_id.0 as usize].set_dirty(false);
            }
        }
        drop(guard);
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all(self: &Arc<Self>) -> Result<()> {
        let mut resident = Vec::new();
        {
            let _free_list = self.free_list.lock();
            self.directory.for_each(|page_id, _| resident.push(*page_id));
        }

        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops a page from the pool and deallocates it on disk.
    ///
    /// Returns true when the page is absent (idempotent) or was removed;
    /// false when the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut free_list = self.free_list.lock();

        let Some(frame_id) = self.directory.find(&page_id) else {
            return Ok(true);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        self.directory.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.reset();
        free_list.push(frame_id);
        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Returns the number of pages in the backing file.
    pub fn disk_pages(&self) -> u32 {
        self.disk.num_pages()
    }
}

impl std::fmt::Debug for BufferPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPoolManager")
            .field("num_frames", &self.num_frames())
            .field("free", &self.free_count())
            .field("resident", &self.resident_count())
            .finish()
    }
}

/// RAII guard for reading a page: shared latch plus one pin.
pub struct ReadPageGuard {
    pool: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<ReadLatch>,
}

impl ReadPageGuard {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.latch.as_ref().expect("page latch held until drop")
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch released before the unpin, so the frame only becomes
        // evictable once nobody is reading it.
        self.latch.take();
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard for writing a page: exclusive latch plus one pin.
///
/// Mutable access marks the page dirty; the dirty flag is merged into the
/// frame when the guard drops.
pub struct WritePageGuard {
    pool: Arc<BufferPoolManager>,
    page_id: PageId,
    dirty: bool,
    latch: Option<WriteLatch>,
}

impl WritePageGuard {
    fn new(pool: Arc<BufferPoolManager>, page_id: PageId, latch: WriteLatch) -> Self {
        Self {
            pool,
            page_id,
            dirty: false,
            latch: Some(latch),
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.latch.as_ref().expect("page latch held until drop")
    }

    /// Returns the page bytes mutably and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.dirty = true;
        self.latch.as_mut().expect("page latch held until drop")
    }

    /// Marks the page dirty without touching the bytes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.latch.take();
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}
