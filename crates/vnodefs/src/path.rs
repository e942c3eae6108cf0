//! Path building and name resolution.
//!
//! [`Tables::build_path`] turns a node back into the backend path it was
//! reached through. [`PathResolver`] goes the other way: it turns a
//! `(directory, name)` pair into a counted node reference, asking the
//! backend for attributes on a table miss.
//!
//! A miss has to call backend code, and backend code never runs under the
//! table lock. Resolution is therefore two-phase: build the path, drop the
//! lock, stat, relock, and re-check the entry. If another thread bound the
//! same name in between, both must agree on the object's identity; if they
//! do not, the attempt is stale and resolution starts over.

use crate::backend::BackendDirEntry;
use crate::dispatch::Dispatch;
use crate::error::{FsError, FsResult};
use crate::graph::{DirectoryGraph, NodeRef, Tables};
use crate::types::{FileStat, NodeId, NodeType};
use parking_lot::MutexGuard;
use tracing::{debug, trace};
use vnodefs_mount::VolumeStats;

impl Tables {
    /// Absolute backend path of a node.
    ///
    /// Hardlinked nodes use their first entry in `(parent id, name)` order.
    /// Fails with `TooDeep` past the depth bound, `NotFound` if the chain is
    /// broken and `NameTooLong` if the path would not fit.
    pub fn build_path(&self, id: NodeId) -> FsResult<String> {
        let root = self.root_id()?;
        let mut names: Vec<&str> = Vec::new();
        let mut len = 0usize;
        let mut current = id;

        while current != root {
            if names.len() >= self.max_depth() {
                return Err(FsError::TooDeep(self.max_depth()));
            }
            let (parent, name) = self
                .node(current)
                .and_then(|node| node.first_entry())
                .ok_or(FsError::NotFound)?;
            len += name.len() + 1;
            if len >= self.max_path_len() {
                return Err(FsError::NameTooLong(self.max_path_len()));
            }
            names.push(name);
            current = parent;
        }

        if names.is_empty() {
            return Ok("/".to_owned());
        }

        let mut path = String::new();
        path.try_reserve_exact(len)?;
        for name in names.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        Ok(path)
    }

    /// Path of `name` inside directory `dir`.
    pub fn build_child_path(&self, dir: NodeId, name: &str) -> FsResult<String> {
        let mut path = self.build_path(dir)?;
        let extra = name.len() + usize::from(path != "/");
        if path.len() + extra >= self.max_path_len() {
            return Err(FsError::NameTooLong(self.max_path_len()));
        }
        path.try_reserve_exact(extra)?;
        if path != "/" {
            path.push('/');
        }
        path.push_str(name);
        Ok(path)
    }
}

/// Resolves names into counted node references.
pub struct PathResolver<'a> {
    graph: &'a DirectoryGraph,
    dispatch: &'a Dispatch,
    use_node_ids: bool,
    stats: &'a VolumeStats,
}

impl<'a> PathResolver<'a> {
    pub fn new(
        graph: &'a DirectoryGraph,
        dispatch: &'a Dispatch,
        use_node_ids: bool,
        stats: &'a VolumeStats,
    ) -> Self {
        Self {
            graph,
            dispatch,
            use_node_ids,
            stats,
        }
    }

    /// Resolve `name` inside `dir`, creating the node and entry on a miss.
    ///
    /// Called with the table lock held; the lock is released around the
    /// backend call and held again on return.
    pub fn resolve(
        &self,
        tables: &mut MutexGuard<'_, Tables>,
        dir: NodeId,
        name: &str,
    ) -> FsResult<NodeRef<'a>> {
        self.stats.record_lookup();
        trace!(dir, name, "resolve");
        loop {
            match self.resolve_once(tables, dir, name) {
                Err(FsError::Stale) => {
                    self.stats.record_stale_retry();
                    debug!(dir, name, "identity changed during lookup, retrying");
                }
                other => return other.map(|id| NodeRef::adopt(self.graph, id)),
            }
        }
    }

    /// Resolve a `/`-separated relative path starting at `start`.
    pub fn resolve_path(
        &self,
        tables: &mut MutexGuard<'_, Tables>,
        start: NodeId,
        path: &str,
    ) -> FsResult<NodeRef<'a>> {
        let mut current = self.graph.acquire(tables, start)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let next = match self.resolve(tables, current.id(), component) {
                Ok(next) => next,
                Err(err) => {
                    current.release(tables);
                    return Err(err);
                }
            };
            current.release(tables);
            current = next;
        }
        Ok(current)
    }

    /// Resolve a name reported by a directory listing.
    ///
    /// Names already bound reuse the bound node. Entries with a known type
    /// (and an id, when ids are stable) are linked without asking the
    /// backend; the rest go through [`PathResolver::resolve`].
    pub fn resolve_listed(
        &self,
        tables: &mut MutexGuard<'_, Tables>,
        dir: NodeId,
        entry: &BackendDirEntry,
    ) -> FsResult<NodeRef<'a>> {
        if let Some(existing) = tables.lookup_entry(dir, &entry.name) {
            return self.graph.acquire(tables, existing);
        }

        let id = match (entry.node_type, entry.ino) {
            (NodeType::Unknown, _) => return self.resolve(tables, dir, &entry.name),
            (_, None) if self.use_node_ids => return self.resolve(tables, dir, &entry.name),
            (_, Some(ino)) if self.use_node_ids => ino,
            _ => tables.generate_node_id(),
        };
        self.bind(tables, dir, &entry.name, id, entry.node_type)
            .map(|id| NodeRef::adopt(self.graph, id))
    }

    fn resolve_once(
        &self,
        tables: &mut MutexGuard<'_, Tables>,
        dir: NodeId,
        name: &str,
    ) -> FsResult<NodeId> {
        match name {
            "." | ".." => return self.resolve_dot(tables, dir, name),
            _ => {}
        }

        if let Some(existing) = tables.lookup_entry(dir, name) {
            tables.ref_node(existing)?;
            return Ok(existing);
        }

        let target = self.dispatch.child_target(tables, dir, name)?;
        // Keep the directory alive while the table lock is down.
        let dir_ref = self.graph.acquire(tables, dir)?;
        let stat = MutexGuard::unlocked(tables, || self.dispatch.lookup(&target));

        let result = stat.and_then(|stat| self.bind_looked_up(tables, dir, name, &stat));
        dir_ref.release(tables);
        result
    }

    fn resolve_dot(&self, tables: &mut Tables, dir: NodeId, name: &str) -> FsResult<NodeId> {
        match tables.node_type(dir) {
            None => return Err(FsError::NotFound),
            Some(ty) if !ty.is_dir() => return Err(FsError::NotADirectory),
            Some(_) => {}
        }
        let id = if name == "." {
            dir
        } else {
            tables.parent_of(dir).ok_or(FsError::NotFound)?
        };
        tables.ref_node(id)?;
        Ok(id)
    }

    /// Second phase of a miss: the table lock is held again.
    fn bind_looked_up(
        &self,
        tables: &mut Tables,
        dir: NodeId,
        name: &str,
        stat: &FileStat,
    ) -> FsResult<NodeId> {
        if let Some(existing) = tables.lookup_entry(dir, name) {
            if !self.same_identity(tables, existing, stat) {
                return Err(FsError::Stale);
            }
            tables.ref_node(existing)?;
            return Ok(existing);
        }

        let id = if self.use_node_ids {
            stat.ino
        } else {
            tables.generate_node_id()
        };
        self.bind(tables, dir, name, id, stat.node_type())
    }

    /// Create (or reuse) node `id` and bind `name` to it. On success the
    /// caller owns one reference to the node.
    fn bind(
        &self,
        tables: &mut Tables,
        dir: NodeId,
        name: &str,
        id: NodeId,
        node_type: NodeType,
    ) -> FsResult<NodeId> {
        if !tables.contains_node(dir) {
            return Err(FsError::NotFound);
        }
        if id == dir {
            return Err(FsError::BadData);
        }
        // Reserve up front so the link below cannot fail on allocation
        // after the node exists.
        tables.reserve(1, 1)?;
        tables.get_or_create_node(id, node_type)?;
        if let Err(err) = tables.link_entry(dir, name, id) {
            tables.put_node(id);
            return Err(err);
        }
        Ok(id)
    }

    fn same_identity(&self, tables: &Tables, existing: NodeId, stat: &FileStat) -> bool {
        if self.use_node_ids {
            existing == stat.ino
        } else {
            // Synthesized ids carry no backend identity; the type is the
            // only thing both lookups can agree on.
            tables.node_type(existing) == Some(stat.node_type())
        }
    }
}
