//! Per-open-directory listing cache.
//!
//! The first read on an open directory pulls one complete listing from the
//! backend, resolves every name into the graph and stores the result here.
//! Later reads are served from a cursor without touching the backend again.
//! Rewinding drops the cache so the next read lists afresh.
//!
//! Records are kept in one array and all names in one packed buffer. Both
//! grow by doubling through `try_reserve`, so running out of memory leaves
//! the cache exactly as it was.

use crate::backend::BackendDirEntry;
use crate::error::{Errno, FsError, FsResult};
use crate::graph::Tables;
use crate::path::PathResolver;
use crate::types::{DirEntry, NodeId, NodeType};
use parking_lot::MutexGuard;
use tracing::debug;

/// Offset of `d_name` in a Linux `dirent64`.
const DIRENT_NAME_OFFSET: usize = 19;
const DIRENT_ALIGN: usize = 8;
const MIN_RECORDS: usize = 8;
const MIN_NAME_BYTES: usize = 256;

/// Bytes a dirent for a name of `name_len` bytes occupies, NUL and padding
/// included.
pub fn dirent_reclen(name_len: usize) -> usize {
    (DIRENT_NAME_OFFSET + name_len + 1).next_multiple_of(DIRENT_ALIGN)
}

/// Additional capacity to reserve so `len + needed` fits, growing to at
/// least `minimum` and otherwise doubling.
fn growth(len: usize, capacity: usize, needed: usize, minimum: usize) -> Option<usize> {
    let required = len + needed;
    if required <= capacity {
        return None;
    }
    let target = capacity.saturating_mul(2).max(minimum).max(required);
    Some(target - len)
}

#[derive(Debug, Clone, Copy)]
struct CacheRecord {
    node_id: NodeId,
    name_offset: usize,
    name_len: usize,
    node_type: NodeType,
    reclen: u16,
}

#[derive(Debug, Default)]
pub struct DirEntryCache {
    records: Vec<CacheRecord>,
    names: String,
}

impl DirEntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one record.
    pub fn add_entry(&mut self, node_id: NodeId, name: &str, node_type: NodeType) -> FsResult<()> {
        let reclen =
            u16::try_from(dirent_reclen(name.len())).map_err(|_| FsError::NameTooLong(name.len()))?;

        if let Some(extra) = growth(self.records.len(), self.records.capacity(), 1, MIN_RECORDS) {
            self.records.try_reserve_exact(extra)?;
        }
        if let Some(extra) = growth(self.names.len(), self.names.capacity(), name.len(), MIN_NAME_BYTES)
        {
            self.names.try_reserve_exact(extra)?;
        }

        let name_offset = self.names.len();
        self.names.push_str(name);
        self.records.push(CacheRecord {
            node_id,
            name_offset,
            name_len: name.len(),
            node_type,
            reclen,
        });
        Ok(())
    }

    pub fn entry(&self, index: usize) -> Option<DirEntry> {
        let record = self.records.get(index)?;
        let name = self
            .names
            .get(record.name_offset..record.name_offset + record.name_len)?;
        Some(DirEntry {
            node_id: record.node_id,
            name: name.to_owned(),
            node_type: record.node_type,
            reclen: record.reclen,
        })
    }

    /// Entries from `cursor` on, bounded by count and by total record bytes.
    ///
    /// Advances `cursor` past what was returned. An empty batch means the
    /// listing is exhausted. Fails with `BufferTooSmall` when not even the
    /// next entry fits in `max_bytes`.
    pub fn read(&self, cursor: &mut usize, max_count: usize, max_bytes: usize) -> FsResult<Vec<DirEntry>> {
        let mut batch = Vec::new();
        let mut used = 0usize;

        while batch.len() < max_count {
            let Some(entry) = self.entry(*cursor) else {
                break;
            };
            let reclen = usize::from(entry.reclen);
            if used + reclen > max_bytes {
                if batch.is_empty() {
                    return Err(FsError::BufferTooSmall);
                }
                break;
            }
            used += reclen;
            batch.push(entry);
            *cursor += 1;
        }

        Ok(batch)
    }

    /// Fill the cache from a listxattr buffer: NUL-terminated names, all
    /// recorded under `node`. Empty and non-UTF-8 names are skipped.
    pub fn populate_attr_names(&mut self, node: NodeId, list: &[u8]) -> FsResult<()> {
        for raw in list.split(|&b| b == 0).filter(|raw| !raw.is_empty()) {
            match std::str::from_utf8(raw) {
                Ok(name) => self.add_entry(node, name, NodeType::Unknown)?,
                Err(_) => debug!(node, "skipping attribute name that is not UTF-8"),
            }
        }
        Ok(())
    }

    /// Fill the cache from one backend listing of directory `dir`.
    ///
    /// "." and ".." come first and are taken from the graph; the backend's
    /// own dot entries are skipped. Every other name is resolved into the
    /// graph. Names the backend lists but can no longer stat are dropped.
    pub fn populate(
        &mut self,
        resolver: &PathResolver<'_>,
        tables: &mut MutexGuard<'_, Tables>,
        dir: NodeId,
        listing: &[BackendDirEntry],
    ) -> FsResult<()> {
        let parent = tables.parent_of(dir).ok_or(FsError::NotFound)?;
        self.add_entry(dir, ".", NodeType::Directory)?;
        self.add_entry(parent, "..", NodeType::Directory)?;

        for listed in listing {
            if listed.name == "." || listed.name == ".." {
                continue;
            }
            let node = match resolver.resolve_listed(tables, dir, listed) {
                Ok(node) => node,
                Err(FsError::Backend(Errno::ENOENT)) => {
                    debug!(dir, name = %listed.name, "listed entry vanished");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let id = node.id();
            let node_type = tables.node_type(id).unwrap_or(listed.node_type);
            node.release(tables);
            self.add_entry(id, &listed.name, node_type)?;
        }
        Ok(())
    }
}
