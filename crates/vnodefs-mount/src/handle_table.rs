//! Thread-safe cookie table for open files and directories.
//!
//! Every `open`/`open_dir` hands the kernel a numeric cookie. The table maps
//! that cookie back to the per-open state. Cookie values start at 1; 0 is
//! never handed out so frontends can use it as "no cookie".

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map from cookie ids to per-open state.
///
/// ```
/// use vnodefs_mount::HandleTable;
/// use std::sync::Arc;
///
/// let table: HandleTable<Arc<String>> = HandleTable::new_auto_id();
/// let id = table.insert_auto(Arc::new("cookie".to_string()));
///
/// let cookie = table.get_cloned(id).unwrap();
/// assert_eq!(cookie.as_str(), "cookie");
/// assert!(table.remove(id).is_some());
/// assert!(table.get_cloned(id).is_none());
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    cookies: DashMap<u64, V>,
    /// Next candidate for `insert_auto`. Wraps past `u64::MAX` to 1.
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new_auto_id() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u64) -> Self {
        Self {
            cookies: DashMap::new(),
            next_id: AtomicU64::new(first),
        }
    }

    /// Store `value` under a fresh cookie and return the cookie.
    ///
    /// Cookies still in use are skipped, so a wrapped counter never clobbers
    /// a live entry.
    pub fn insert_auto(&self, value: V) -> u64 {
        let mut value = Some(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.cookies.entry(id)
                && let Some(value) = value.take()
            {
                slot.insert(value);
                return id;
            }
        }
    }

    /// Clone the state out so no shard lock outlives the call.
    pub fn get_cloned(&self, id: u64) -> Option<V>
    where
        V: Clone,
    {
        self.cookies.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.cookies.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Forget every cookie (unmount).
    pub fn clear(&self) {
        self.cookies.clear();
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new_auto_id()
    }
}
