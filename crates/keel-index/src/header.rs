//! The header page: a registry of index roots.
//!
//! Page 0 of the data file maps index names to root page ids so indexes can
//! be reopened across restarts. Records are fixed-width (a zero-padded name
//! plus a root page id) behind a small count header.
//!
//! Page layout:
//! ```text
//! +--------------------+ 0
//! | record_count: u16  |
//! | reserved: u16      |
//! +--------------------+ 4
//! | name: [u8; 32]     |
//! | root_page_id: u32  |  * record_count
//! +--------------------+
//! ```

use bytes::{BufMut, BytesMut};
use keel_common::page::{PageId, PAGE_SIZE};
use keel_common::{KeelError, Result};

/// Maximum index name length in bytes.
pub const MAX_INDEX_NAME_LEN: usize = 32;

const RECORDS_OFFSET: usize = 4;
const RECORD_LEN: usize = MAX_INDEX_NAME_LEN + 4;

/// Maximum number of index records the header page can hold.
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_LEN;

/// One registered index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    /// Index name, at most [`MAX_INDEX_NAME_LEN`] bytes.
    pub name: String,
    /// Root page id of the index; `PageId::INVALID` for an empty tree.
    pub root_page_id: PageId,
}

/// Decoded header page.
#[derive(Debug, Clone, Default)]
pub struct HeaderPage {
    records: Vec<HeaderRecord>,
}

impl HeaderPage {
    /// Decodes the header page from its page image.
    pub fn decode(buf: &[u8; PAGE_SIZE]) -> Result<Self> {
        let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if count > MAX_HEADER_RECORDS {
            return Err(KeelError::TreeCorrupted(format!(
                "header page claims {count} records"
            )));
        }

        let mut records = Vec::with_capacity(count);
        let mut offset = RECORDS_OFFSET;
        for _ in 0..count {
            let name_bytes = &buf[offset..offset + MAX_INDEX_NAME_LEN];
            let name_len = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(MAX_INDEX_NAME_LEN);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
            let root_page_id = PageId::from_le_bytes([
                buf[offset + MAX_INDEX_NAME_LEN],
                buf[offset + MAX_INDEX_NAME_LEN + 1],
                buf[offset + MAX_INDEX_NAME_LEN + 2],
                buf[offset + MAX_INDEX_NAME_LEN + 3],
            ]);
            records.push(HeaderRecord { name, root_page_id });
            offset += RECORD_LEN;
        }

        Ok(Self { records })
    }

    /// Encodes the header page into a page image.
    pub fn encode(&self, buf: &mut [u8; PAGE_SIZE]) {
        let mut out = BytesMut::with_capacity(RECORDS_OFFSET + self.records.len() * RECORD_LEN);
        out.put_u16_le(self.records.len() as u16);
        out.put_u16_le(0);
        for record in &self.records {
            let mut name = [0u8; MAX_INDEX_NAME_LEN];
            let bytes = record.name.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            out.put_slice(&name);
            out.put_slice(&record.root_page_id.to_le_bytes());
        }

        buf.fill(0);
        buf[..out.len()].copy_from_slice(&out);
    }

    /// Looks up the root page id registered under `name`.
    pub fn get(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.root_page_id)
    }

    /// Registers a new index. Fails if the name is taken, too long, or the
    /// page is full.
    pub fn insert(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        if name.len() > MAX_INDEX_NAME_LEN {
            return Err(KeelError::IndexNameTooLong {
                name: name.to_string(),
                len: name.len(),
                max: MAX_INDEX_NAME_LEN,
            });
        }
        if self.get(name).is_some() {
            return Err(KeelError::Internal(format!(
                "index {name} already registered"
            )));
        }
        if self.records.len() >= MAX_HEADER_RECORDS {
            return Err(KeelError::HeaderFull(name.to_string()));
        }
        self.records.push(HeaderRecord {
            name: name.to_string(),
            root_page_id,
        });
        Ok(())
    }

    /// Updates the root of an existing record.
    pub fn update(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        match self.records.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.root_page_id = root_page_id;
                Ok(())
            }
            None => Err(KeelError::IndexNotFound(name.to_string())),
        }
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no index is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_page_decodes_empty() {
        let buf = [0u8; PAGE_SIZE];
        let header = HeaderPage::decode(&buf).unwrap();
        assert!(header.is_empty());
    }

    #[test]
    fn test_insert_get_update() {
        let mut header = HeaderPage::default();

        header.insert("users_pk", PageId(5)).unwrap();
        header.insert("orders_pk", PageId(9)).unwrap();

        assert_eq!(header.get("users_pk"), Some(PageId(5)));
        assert_eq!(header.get("orders_pk"), Some(PageId(9)));
        assert_eq!(header.get("missing"), None);

        header.update("users_pk", PageId(12)).unwrap();
        assert_eq!(header.get("users_pk"), Some(PageId(12)));
    }

    #[test]
    fn test_update_missing_fails() {
        let mut header = HeaderPage::default();
        assert!(matches!(
            header.update("nope", PageId(1)),
            Err(KeelError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut header = HeaderPage::default();
        header.insert("idx", PageId(1)).unwrap();
        assert!(header.insert("idx", PageId(2)).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let mut header = HeaderPage::default();
        let long = "x".repeat(MAX_INDEX_NAME_LEN + 1);
        assert!(matches!(
            header.insert(&long, PageId(1)),
            Err(KeelError::IndexNameTooLong { .. })
        ));
    }

    #[test]
    fn test_header_full() {
        let mut header = HeaderPage::default();
        for i in 0..MAX_HEADER_RECORDS {
            header.insert(&format!("idx_{i}"), PageId(i as u32)).unwrap();
        }
        assert!(matches!(
            header.insert("one_more", PageId(1)),
            Err(KeelError::HeaderFull(_))
        ));
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut header = HeaderPage::default();
        header.insert("a", PageId(1)).unwrap();
        header.insert("bb", PageId::INVALID).unwrap();
        header.insert("ccc", PageId(300)).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        header.encode(&mut buf);
        let decoded = HeaderPage::decode(&buf).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.get("a"), Some(PageId(1)));
        assert_eq!(decoded.get("bb"), Some(PageId::INVALID));
        assert_eq!(decoded.get("ccc"), Some(PageId(300)));
    }

    #[test]
    fn test_max_name_roundtrip() {
        let name = "n".repeat(MAX_INDEX_NAME_LEN);
        let mut header = HeaderPage::default();
        header.insert(&name, PageId(7)).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        header.encode(&mut buf);
        let decoded = HeaderPage::decode(&buf).unwrap();
        assert_eq!(decoded.get(&name), Some(PageId(7)));
    }
}
