//! Per-open cookies for files, directories and extended attributes.
//!
//! A cookie is owned by one open instance. Its mutex only serializes
//! concurrent use of that same cookie; unrelated operations never touch it.

use crate::dir_cache::DirEntryCache;
use crate::error::{FsError, FsResult};
use crate::types::{AttrStat, AttrType};
use parking_lot::Mutex;
use std::sync::Arc;
use vnodefs_mount::HandleTable;

/// State of one open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCookie {
    /// Open flags as passed by the kernel, `O_TRUNC` excluded.
    pub flags: i32,
    /// Backend handle.
    pub fh: u64,
}

/// How an open directory talks to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirHandle {
    /// Opened through opendir; released through releasedir.
    Opened(u64),
    /// Backend has readdir but no opendir.
    Noop,
    /// Legacy getdir interface.
    GetDir,
}

impl DirHandle {
    /// Backend handle to pass to readdir, if the listing uses one.
    pub fn fh(self) -> Option<u64> {
        match self {
            DirHandle::Opened(fh) => Some(fh),
            DirHandle::Noop => Some(0),
            DirHandle::GetDir => None,
        }
    }
}

/// State of one open directory.
#[derive(Debug)]
pub struct DirCookie {
    pub handle: DirHandle,
    pub cache: Option<DirEntryCache>,
    pub cursor: usize,
}

impl DirCookie {
    pub fn new(handle: DirHandle) -> Self {
        Self {
            handle,
            cache: None,
            cursor: 0,
        }
    }

    /// Forget the cached listing; the next read lists again.
    pub fn rewind(&mut self) {
        self.cache = None;
        self.cursor = 0;
    }
}

/// State of one open attribute directory.
#[derive(Debug, Default)]
pub struct AttrDirCookie {
    /// Name snapshot taken by the first read; every record carries the
    /// owning node's id.
    pub names: Option<DirEntryCache>,
    pub cursor: usize,
}

impl AttrDirCookie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewind(&mut self) {
        self.names = None;
        self.cursor = 0;
    }
}

/// One attribute opened for reading. The value is fetched once at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrCookie {
    pub name: String,
    pub value: Vec<u8>,
}

impl AttrCookie {
    pub fn new(name: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Up to `size` bytes from `pos`; nothing past the end.
    pub fn read(&self, pos: u64, size: usize) -> Vec<u8> {
        let Ok(start) = usize::try_from(pos) else {
            return Vec::new();
        };
        let end = start.saturating_add(size).min(self.value.len());
        self.value.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn stat(&self) -> AttrStat {
        AttrStat {
            size: self.value.len() as u64,
            attr_type: AttrType::for_name(&self.name),
        }
    }
}

/// Cookie table keyed by the id handed to the kernel.
#[derive(Debug)]
pub struct CookieTable<T> {
    table: HandleTable<Arc<Mutex<T>>>,
}

impl<T> CookieTable<T> {
    pub fn new() -> Self {
        Self {
            table: HandleTable::new_auto_id(),
        }
    }

    pub fn insert(&self, cookie: T) -> u64 {
        self.table.insert_auto(Arc::new(Mutex::new(cookie)))
    }

    pub fn get(&self, id: u64) -> FsResult<Arc<Mutex<T>>> {
        self.table.get_cloned(id).ok_or(FsError::InvalidCookie(id))
    }

    pub fn remove(&self, id: u64) -> FsResult<Arc<Mutex<T>>> {
        self.table.remove(id).ok_or(FsError::InvalidCookie(id))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&self) {
        self.table.clear();
    }
}

impl<T> Default for CookieTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;

    #[test]
    fn test_unknown_cookie() {
        let table: CookieTable<FileCookie> = CookieTable::new();
        assert!(matches!(table.get(7), Err(FsError::InvalidCookie(7))));
        assert!(matches!(table.remove(7), Err(FsError::InvalidCookie(7))));
    }

    #[test]
    fn test_insert_get_remove() {
        let table = CookieTable::new();
        let id = table.insert(FileCookie { flags: 0, fh: 5 });
        assert_ne!(id, 0);
        assert_eq!(table.get(id).unwrap().lock().fh, 5);
        table.remove(id).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_dir_rewind_drops_cache() {
        let mut cookie = DirCookie::new(DirHandle::Noop);
        let mut cache = DirEntryCache::new();
        cache.add_entry(1, ".", NodeType::Directory).unwrap();
        cookie.cache = Some(cache);
        cookie.cursor = 1;
        cookie.rewind();
        assert!(cookie.cache.is_none());
        assert_eq!(cookie.cursor, 0);
    }

    #[test]
    fn test_attr_cookie_reads() {
        let cookie = AttrCookie::new("user.note", b"hello".to_vec());
        assert_eq!(cookie.read(0, 2), b"he");
        assert_eq!(cookie.read(3, 64), b"lo");
        assert!(cookie.read(5, 4).is_empty());
        assert!(cookie.read(u64::MAX, 4).is_empty());
        assert_eq!(
            cookie.stat(),
            AttrStat {
                size: 5,
                attr_type: AttrType::Raw
            }
        );
        let mime = AttrCookie::new(crate::types::MIME_TYPE_ATTR, b"text/plain".to_vec());
        assert_eq!(mime.stat().attr_type, AttrType::MimeString);
    }

    #[test]
    fn test_attr_dir_rewind() {
        let mut cookie = AttrDirCookie::new();
        cookie.names = Some(DirEntryCache::new());
        cookie.cursor = 3;
        cookie.rewind();
        assert!(cookie.names.is_none());
        assert_eq!(cookie.cursor, 0);
    }

    #[test]
    fn test_dir_handle_fh() {
        assert_eq!(DirHandle::Opened(3).fh(), Some(3));
        assert_eq!(DirHandle::Noop.fh(), Some(0));
        assert_eq!(DirHandle::GetDir.fh(), None);
    }
}
