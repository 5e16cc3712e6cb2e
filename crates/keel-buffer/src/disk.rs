//! Disk manager for page-level file I/O.

use keel_common::page::{PageId, PAGE_SIZE};
use keel_common::{KeelError, Result, StorageConfig};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the single data file inside the data directory.
const DATA_FILE_NAME: &str = "keel.db";

/// Manages reading and writing pages to the data file.
///
/// Pages are addressed by `PageId` and allocated monotonically; page ids are
/// never reused. Deallocation is a no-op placeholder (free-list reclamation
/// belongs to a recovery layer this engine does not have).
pub struct DiskManager {
    /// Path to the data file.
    path: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Open file handle and allocation counter.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The data file.
    file: File,
    /// Number of pages in the file. Also the next page id to allocate.
    num_pages: u32,
}

impl DiskManager {
    /// Opens (or creates) the data file under the configured directory.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DATA_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            path,
            fsync_enabled: config.fsync_enabled,
            inner: Mutex::new(DiskInner { file, num_pages }),
        })
    }

    /// Returns the path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a page from disk into the provided buffer.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() || page_id.0 >= inner.num_pages {
            return Err(KeelError::PageNotFound { page_id });
        }

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes a page to disk, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(buf)?;

        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Allocates a new page at the end of the file and zero-fills it.
    ///
    /// Page ids are handed out monotonically.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let page_id = PageId(inner.num_pages);

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.num_pages += 1;
        Ok(page_id)
    }

    /// Releases a page.
    ///
    /// Currently a no-op: page ids are monotonic and the file is never
    /// shrunk or hole-punched.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Returns the number of pages in the data file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let dm = DiskManager::new(&config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert_eq!(dm.num_pages(), 0);
        assert!(dm.path().parent().unwrap().exists());
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.allocate_page().unwrap(), PageId(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
        assert_eq!(dm.allocate_page().unwrap(), PageId(2));
        assert_eq!(dm.num_pages(), 3);
    }

    #[test]
    fn test_disk_manager_allocated_page_is_zeroed() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();
        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read_back = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back[0], 0xAB);
        assert_eq!(read_back[100], 0xCD);
        assert_eq!(read_back[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        let result = dm.read_page(PageId(99), &mut buf);
        assert!(matches!(result, Err(KeelError::PageNotFound { .. })));

        let result = dm.read_page(PageId::INVALID, &mut buf);
        assert!(matches!(result, Err(KeelError::PageNotFound { .. })));
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAA;
        dm.write_page(page_id, &data).unwrap();

        data[0] = 0xBB;
        dm.write_page(page_id, &data).unwrap();

        let mut read_back = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_write_extends_file() {
        let (dm, _dir) = create_test_disk_manager();

        let data = [0x11u8; PAGE_SIZE];
        dm.write_page(PageId(4), &data).unwrap();
        assert_eq!(dm.num_pages(), 5);

        // The next allocation continues past the extension.
        assert_eq!(dm.allocate_page().unwrap(), PageId(5));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: true,
            ..Default::default()
        };
        let page_id;

        {
            let dm = DiskManager::new(&config).unwrap();
            page_id = dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(&config).unwrap();
            assert_eq!(dm.num_pages(), 1);

            let mut read_back = [0u8; PAGE_SIZE];
            dm.read_page(page_id, &mut read_back).unwrap();
            assert_eq!(read_back[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_deallocate_is_noop() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();
        dm.deallocate_page(page_id);

        // The page is still readable and ids keep growing.
        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
    }

    #[test]
    fn test_disk_manager_flush() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();
        dm.flush().unwrap();
    }
}
