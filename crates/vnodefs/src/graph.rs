//! The directory graph mirroring the backend hierarchy under node-id addressing.
//!
//! Nodes live in an arena keyed by [`NodeId`]; entries are grouped per
//! parent id, keyed by name, and point at their target by id. Nothing outside the
//! [`Tables`] owns a node: every other holder is a [`NodeRef`] that carries one
//! reference unit and gives it back on drop.
//!
//! # Reference accounting
//!
//! - [`Tables::get_or_create_node`] hands the caller one unit.
//! - [`Tables::link_entry`] adds one unit to the parent and one to the target.
//! - [`Tables::remove_entry`] takes both back; a node whose count reaches
//!   zero is removed from the arena at once.
//! - The root carries a permanent pin while mounted.
//!
//! All mutations happen under the single table mutex owned by
//! [`DirectoryGraph`]. Backend I/O never runs while that mutex is held. Every
//! insert or removal bumps a generation counter that the lock manager uses to
//! detect structural changes across unlock/relock boundaries.

use crate::error::{FsError, FsResult};
use crate::types::{NodeId, NodeType, ROOT_NODE_ID};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};
use vnodefs_mount::VolumeStats;

/// `(parent id, name)` key of an entry.
pub type EntryKey = (NodeId, String);

/// A filesystem object known to the graph.
pub struct Node {
    id: NodeId,
    node_type: NodeType,
    ref_count: u32,
    dirty: bool,
    /// Entries naming this node. Ordered so the first one is deterministic.
    entries: BTreeSet<EntryKey>,
    lock: Arc<RwLock<()>>,
}

impl Node {
    fn new(id: NodeId, node_type: NodeType) -> Self {
        Self {
            id,
            node_type,
            ref_count: 1,
            dirty: false,
            entries: BTreeSet::new(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The entry used for path building: smallest `(parent id, name)`.
    ///
    /// With hardlinks this picks the same name every time, independent of
    /// the order the links were discovered in.
    pub fn first_entry(&self) -> Option<(NodeId, &str)> {
        self.entries
            .first()
            .map(|(parent, name)| (*parent, name.as_str()))
    }

    pub(crate) fn lock_handle(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.lock)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.node_type)
            .field("refs", &self.ref_count)
            .field("dirty", &self.dirty)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// Node and entry indices. Only reachable through [`DirectoryGraph::lock`].
#[derive(Debug)]
pub struct Tables {
    nodes: HashMap<NodeId, Node>,
    /// parent -> name -> target. Empty inner maps are dropped.
    entries: HashMap<NodeId, HashMap<String, NodeId>>,
    entry_total: usize,
    root: Option<NodeId>,
    next_node_id: NodeId,
    generation: u64,
    max_depth: usize,
    max_path_len: usize,
    stats: Arc<VolumeStats>,
}

impl Tables {
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Root id, or `NotFound` before mount.
    pub fn root_id(&self) -> FsResult<NodeId> {
        self.root.ok_or(FsError::NotFound)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_type(&self, id: NodeId) -> Option<NodeType> {
        self.nodes.get(&id).map(Node::node_type)
    }

    pub fn ref_count(&self, id: NodeId) -> Option<u32> {
        self.nodes.get(&id).map(Node::ref_count)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_total
    }

    /// Number of names bound in `dir`.
    pub fn child_count(&self, dir: NodeId) -> usize {
        self.entries.get(&dir).map_or(0, HashMap::len)
    }

    /// Bumped on every node or entry insertion and removal.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    pub fn lookup_entry(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.entries.get(&parent)?.get(name).copied()
    }

    /// Parent used for locking and path building. The root is its own parent;
    /// a node with no entries has none.
    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        if self.root == Some(id) {
            return Some(id);
        }
        self.nodes
            .get(&id)
            .and_then(Node::first_entry)
            .map(|(parent, _)| parent)
    }

    /// Returns `[id, parent, ..., root]`.
    pub fn ancestors(&self, id: NodeId) -> FsResult<Vec<NodeId>> {
        let root = self.root_id()?;
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            if chain.len() >= self.max_depth {
                return Err(FsError::TooDeep(self.max_depth));
            }
            chain.push(current);
            if current == root {
                return Ok(chain);
            }
            current = self.parent_of(current).ok_or(FsError::NotFound)?;
        }
    }

    /// Next free locally synthesized id. Ids still in use are skipped.
    pub fn generate_node_id(&mut self) -> NodeId {
        loop {
            let id = self.next_node_id;
            self.next_node_id = self.next_node_id.wrapping_add(1).max(ROOT_NODE_ID + 1);
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Make room for the given number of new nodes and entries so the
    /// following mutations cannot fail halfway.
    pub fn reserve(&mut self, nodes: usize, entries: usize) -> FsResult<()> {
        self.nodes.try_reserve(nodes)?;
        self.entries.try_reserve(entries)?;
        Ok(())
    }

    /// Install the root node. It is pinned until [`Tables::clear`].
    pub fn insert_root(&mut self, id: NodeId, node_type: NodeType) -> FsResult<()> {
        if self.root.is_some() {
            return Err(FsError::BadData);
        }
        self.reserve(1, 0)?;
        self.nodes.insert(id, Node::new(id, node_type));
        self.root = Some(id);
        self.generation += 1;
        self.stats.record_node_created();
        trace!(node = id, "root inserted");
        Ok(())
    }

    /// Return an existing node with one more reference, or create it with one.
    pub fn get_or_create_node(&mut self, id: NodeId, node_type: NodeType) -> FsResult<NodeId> {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.ref_count += 1;
            return Ok(id);
        }
        self.reserve(1, 0)?;
        self.nodes.insert(id, Node::new(id, node_type));
        self.generation += 1;
        self.stats.record_node_created();
        trace!(node = id, ?node_type, "node created");
        Ok(id)
    }

    /// Take one more reference on a live node.
    pub fn ref_node(&mut self, id: NodeId) -> FsResult<()> {
        let node = self.nodes.get_mut(&id).ok_or(FsError::NotFound)?;
        node.ref_count += 1;
        Ok(())
    }

    /// Drop one reference; returns true if the node was destroyed.
    pub fn put_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            error!(node = id, "reference released on unknown node");
            return false;
        };
        debug_assert!(node.ref_count > 0, "node {id} over-released");
        node.ref_count = node.ref_count.saturating_sub(1);
        if node.ref_count > 0 {
            return false;
        }
        debug_assert!(node.entries.is_empty(), "node {id} destroyed while named");
        self.nodes.remove(&id);
        self.generation += 1;
        self.stats.record_node_destroyed();
        trace!(node = id, "node destroyed");
        true
    }

    /// Bind `name` in `parent` to `node`. Both gain one reference.
    pub fn link_entry(&mut self, parent: NodeId, name: &str, node: NodeId) -> FsResult<()> {
        if !self.nodes.contains_key(&parent) || !self.nodes.contains_key(&node) {
            return Err(FsError::NotFound);
        }
        if self.lookup_entry(parent, name).is_some() {
            error!(parent, name, "entry already bound");
            return Err(FsError::BadData);
        }
        self.entries.try_reserve(1)?;
        let names = self.entries.entry(parent).or_default();
        names.try_reserve(1)?;
        names.insert(name.to_owned(), node);
        self.entry_total += 1;

        if let Some(target) = self.nodes.get_mut(&node) {
            target.entries.insert((parent, name.to_owned()));
            target.ref_count += 1;
        }
        if let Some(dir) = self.nodes.get_mut(&parent) {
            dir.ref_count += 1;
        }
        self.generation += 1;
        trace!(parent, name, node, "entry linked");
        Ok(())
    }

    /// Unbind `name` in `parent` and release the references the entry held.
    /// Returns the id the entry pointed at.
    pub fn remove_entry(&mut self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let names = self.entries.get_mut(&parent).ok_or(FsError::NotFound)?;
        let node = names.remove(name).ok_or(FsError::NotFound)?;
        if names.is_empty() {
            self.entries.remove(&parent);
        }
        self.entry_total -= 1;
        if let Some(target) = self.nodes.get_mut(&node) {
            target.entries.remove(&(parent, name.to_owned()));
        }
        self.generation += 1;
        trace!(parent, name, node, "entry removed");
        self.put_node(node);
        self.put_node(parent);
        Ok(node)
    }

    /// Move an entry, replacing whatever `new_name` was bound to.
    pub fn rename_entry(
        &mut self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<NodeId> {
        let node = self
            .lookup_entry(old_parent, old_name)
            .ok_or(FsError::NotFound)?;
        if !self.nodes.contains_key(&new_parent) {
            return Err(FsError::NotFound);
        }
        self.reserve(0, 1)?;

        // Keep the node (and the destination) alive while the node has no
        // entry at all.
        self.ref_node(node)?;
        self.ref_node(new_parent)?;
        let linked = self.relink(old_parent, old_name, new_parent, new_name, node);
        self.put_node(new_parent);
        self.put_node(node);
        linked.map(|()| node)
    }

    fn relink(
        &mut self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
        node: NodeId,
    ) -> FsResult<()> {
        self.remove_entry(old_parent, old_name)?;
        match self.remove_entry(new_parent, new_name) {
            Ok(_) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.link_entry(new_parent, new_name, node)
    }

    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(Node::is_dirty)
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.dirty = true;
        }
    }

    /// Clear the dirty flag and return its previous value.
    pub fn take_dirty(&mut self, id: NodeId) -> bool {
        self.nodes
            .get_mut(&id)
            .is_some_and(|node| std::mem::take(&mut node.dirty))
    }

    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.dirty)
            .map(Node::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every node and entry, including the root pin.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entry_total = 0;
        self.nodes.clear();
        self.root = None;
        self.generation += 1;
    }

    /// Verify the cross-index invariants. Intended for tests and debugging.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut named_refs: HashMap<NodeId, u32> = HashMap::new();
        let bound = self.entries.values().map(HashMap::len).sum::<usize>();
        if bound != self.entry_total {
            return Err(format!("{} entries bound but {} counted", bound, self.entry_total));
        }
        let all = self
            .entries
            .iter()
            .flat_map(|(parent, names)| names.iter().map(move |(name, node)| (parent, name, node)));
        for (parent, name, node) in all {
            let target = self
                .nodes
                .get(node)
                .ok_or_else(|| format!("entry {parent}/{name} points at missing node {node}"))?;
            if !target.entries.contains(&(*parent, name.clone())) {
                return Err(format!("node {node} does not list entry {parent}/{name}"));
            }
            if !self.nodes.contains_key(parent) {
                return Err(format!("entry {parent}/{name} has missing parent"));
            }
            *named_refs.entry(*node).or_default() += 1;
            *named_refs.entry(*parent).or_default() += 1;
        }
        for node in self.nodes.values() {
            if node.ref_count == 0 {
                return Err(format!("node {} is reachable with zero references", node.id));
            }
            let floor = named_refs.get(&node.id).copied().unwrap_or(0);
            if node.ref_count < floor {
                return Err(format!(
                    "node {} has {} references but {} entry units",
                    node.id, node.ref_count, floor
                ));
            }
            for key in &node.entries {
                if self.lookup_entry(key.0, &key.1) != Some(node.id) {
                    return Err(format!("node {} lists stale entry {key:?}", node.id));
                }
            }
        }
        Ok(())
    }
}

/// Owner of the [`Tables`] and the table-wide mutex.
#[derive(Debug)]
pub struct DirectoryGraph {
    tables: Mutex<Tables>,
}

impl DirectoryGraph {
    pub fn new(max_depth: usize, max_path_len: usize, stats: Arc<VolumeStats>) -> Self {
        Self {
            tables: Mutex::new(Tables {
                nodes: HashMap::new(),
                entries: HashMap::new(),
                entry_total: 0,
                root: None,
                next_node_id: ROOT_NODE_ID + 1,
                generation: 0,
                max_depth,
                max_path_len,
                stats,
            }),
        }
    }

    /// Acquire the table lock. Never call backend code while holding it.
    pub fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock()
    }

    /// Take a counted reference on a live node.
    pub fn acquire(&self, tables: &mut Tables, id: NodeId) -> FsResult<NodeRef<'_>> {
        tables.ref_node(id)?;
        Ok(NodeRef::adopt(self, id))
    }

    /// Convenience for [`DirectoryGraph::acquire`] taking the lock itself.
    pub fn acquire_unlocked(&self, id: NodeId) -> FsResult<NodeRef<'_>> {
        let mut tables = self.lock();
        self.acquire(&mut tables, id)
    }
}

/// One counted reference to a node, released on drop.
///
/// Dropping takes the table lock, so a `NodeRef` must not be dropped while
/// the current thread holds it; use [`NodeRef::release`] there instead.
#[must_use]
pub struct NodeRef<'g> {
    graph: &'g DirectoryGraph,
    id: NodeId,
    held: bool,
}

impl<'g> NodeRef<'g> {
    /// Wrap a reference unit the caller already owns.
    pub fn adopt(graph: &'g DirectoryGraph, id: NodeId) -> Self {
        Self {
            graph,
            id,
            held: true,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Release under an already held table lock.
    pub fn release(mut self, tables: &mut Tables) {
        self.held = false;
        tables.put_node(self.id);
    }

    /// Hand the reference unit to someone else (typically the kernel) and
    /// return the id without releasing it.
    pub fn into_raw(mut self) -> NodeId {
        self.held = false;
        self.id
    }
}

impl Drop for NodeRef<'_> {
    fn drop(&mut self) {
        if self.held {
            self.graph.lock().put_node(self.id);
        }
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DirectoryGraph {
        DirectoryGraph::new(1024, 1024, Arc::new(VolumeStats::new()))
    }

    fn mounted() -> DirectoryGraph {
        let graph = graph();
        graph
            .lock()
            .insert_root(ROOT_NODE_ID, NodeType::Directory)
            .unwrap();
        graph
    }

    /// Create `name` under `parent` the way resolution does and drop the
    /// caller reference again, leaving only the entry's unit.
    fn add(tables: &mut Tables, parent: NodeId, name: &str, id: NodeId, ty: NodeType) {
        tables.get_or_create_node(id, ty).unwrap();
        tables.link_entry(parent, name, id).unwrap();
        tables.put_node(id);
    }

    #[test]
    fn test_root_is_its_own_parent() {
        let graph = mounted();
        let tables = graph.lock();
        assert_eq!(tables.root(), Some(ROOT_NODE_ID));
        assert_eq!(tables.parent_of(ROOT_NODE_ID), Some(ROOT_NODE_ID));
        assert_eq!(tables.ref_count(ROOT_NODE_ID), Some(1));
    }

    #[test]
    fn test_insert_root_twice_fails() {
        let graph = mounted();
        let mut tables = graph.lock();
        assert!(matches!(
            tables.insert_root(9, NodeType::Directory),
            Err(FsError::BadData)
        ));
    }

    #[test]
    fn test_get_or_create_counts() {
        let graph = mounted();
        let mut tables = graph.lock();
        tables.get_or_create_node(42, NodeType::Directory).unwrap();
        assert_eq!(tables.ref_count(42), Some(1));
        tables.get_or_create_node(42, NodeType::Directory).unwrap();
        assert_eq!(tables.ref_count(42), Some(2));
    }

    #[test]
    fn test_link_and_remove_adjust_both_counts() {
        let graph = mounted();
        let mut tables = graph.lock();
        tables.get_or_create_node(42, NodeType::Directory).unwrap();
        tables.link_entry(ROOT_NODE_ID, "docs", 42).unwrap();

        assert_eq!(tables.ref_count(42), Some(2));
        assert_eq!(tables.ref_count(ROOT_NODE_ID), Some(2));
        assert_eq!(tables.lookup_entry(ROOT_NODE_ID, "docs"), Some(42));

        assert_eq!(tables.remove_entry(ROOT_NODE_ID, "docs").unwrap(), 42);
        assert_eq!(tables.ref_count(42), Some(1));
        assert_eq!(tables.ref_count(ROOT_NODE_ID), Some(1));
        assert_eq!(tables.lookup_entry(ROOT_NODE_ID, "docs"), None);

        assert!(tables.put_node(42));
        assert!(!tables.contains_node(42));
        tables.check_consistency().unwrap();
    }

    #[test]
    fn test_entries_grouped_by_parent() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::Directory);
        add(&mut tables, ROOT_NODE_ID, "b", 3, NodeType::File);
        add(&mut tables, 2, "b", 4, NodeType::File);

        assert_eq!(tables.entry_count(), 3);
        assert_eq!(tables.child_count(ROOT_NODE_ID), 2);
        assert_eq!(tables.lookup_entry(2, "b"), Some(4));
        assert_eq!(tables.lookup_entry(3, "b"), None);

        tables.remove_entry(2, "b").unwrap();
        assert_eq!(tables.child_count(2), 0);
        assert_eq!(tables.entry_count(), 2);
        tables.check_consistency().unwrap();
    }

    #[test]
    fn test_remove_last_entry_destroys_node() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 5, NodeType::File);
        assert!(tables.contains_node(5));
        tables.remove_entry(ROOT_NODE_ID, "a").unwrap();
        assert!(!tables.contains_node(5));
    }

    #[test]
    fn test_duplicate_link_rejected() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 5, NodeType::File);
        tables.get_or_create_node(6, NodeType::File).unwrap();
        assert!(tables.link_entry(ROOT_NODE_ID, "a", 6).is_err());
        // The failed link did not touch the counts.
        assert_eq!(tables.ref_count(6), Some(1));
        assert_eq!(tables.ref_count(5), Some(1));
    }

    #[test]
    fn test_hardlink_first_entry_is_smallest() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "zeta", 7, NodeType::File);
        tables.link_entry(ROOT_NODE_ID, "alpha", 7).unwrap();

        let node = tables.node(7).unwrap();
        assert_eq!(node.entry_count(), 2);
        assert_eq!(node.first_entry(), Some((ROOT_NODE_ID, "alpha")));
    }

    #[test]
    fn test_rename_replaces_target() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "dir", 10, NodeType::Directory);
        add(&mut tables, ROOT_NODE_ID, "src", 11, NodeType::File);
        add(&mut tables, 10, "dst", 12, NodeType::File);

        tables.rename_entry(ROOT_NODE_ID, "src", 10, "dst").unwrap();

        assert_eq!(tables.lookup_entry(10, "dst"), Some(11));
        assert_eq!(tables.lookup_entry(ROOT_NODE_ID, "src"), None);
        assert!(!tables.contains_node(12), "replaced target must be destroyed");
        assert_eq!(tables.ref_count(11), Some(1));
        tables.check_consistency().unwrap();
    }

    #[test]
    fn test_rename_onto_itself() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "same", 11, NodeType::File);
        tables
            .rename_entry(ROOT_NODE_ID, "same", ROOT_NODE_ID, "same")
            .unwrap();
        assert_eq!(tables.lookup_entry(ROOT_NODE_ID, "same"), Some(11));
        assert_eq!(tables.ref_count(11), Some(1));
    }

    #[test]
    fn test_rename_missing_source() {
        let graph = mounted();
        let mut tables = graph.lock();
        assert!(matches!(
            tables.rename_entry(ROOT_NODE_ID, "nope", ROOT_NODE_ID, "x"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_generate_node_id_skips_live_ids() {
        let graph = mounted();
        let mut tables = graph.lock();
        tables.get_or_create_node(2, NodeType::File).unwrap();
        tables.get_or_create_node(3, NodeType::File).unwrap();
        assert_eq!(tables.generate_node_id(), 4);
        assert_eq!(tables.generate_node_id(), 5);
    }

    #[test]
    fn test_ancestors() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::Directory);
        add(&mut tables, 2, "b", 3, NodeType::Directory);
        assert_eq!(tables.ancestors(3).unwrap(), vec![3, 2, ROOT_NODE_ID]);
        assert_eq!(tables.ancestors(ROOT_NODE_ID).unwrap(), vec![ROOT_NODE_ID]);
    }

    #[test]
    fn test_ancestors_of_detached_node() {
        let graph = mounted();
        let mut tables = graph.lock();
        tables.get_or_create_node(9, NodeType::File).unwrap();
        assert!(matches!(tables.ancestors(9), Err(FsError::NotFound)));
    }

    #[test]
    fn test_ancestors_depth_bound() {
        let graph = DirectoryGraph::new(3, 1024, Arc::new(VolumeStats::new()));
        let mut tables = graph.lock();
        tables.insert_root(ROOT_NODE_ID, NodeType::Directory).unwrap();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::Directory);
        add(&mut tables, 2, "b", 3, NodeType::Directory);
        add(&mut tables, 3, "c", 4, NodeType::Directory);
        assert!(matches!(tables.ancestors(4), Err(FsError::TooDeep(3))));
    }

    #[test]
    fn test_generation_bumps_on_mutation() {
        let graph = mounted();
        let mut tables = graph.lock();
        let before = tables.generation();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::File);
        assert!(tables.generation() > before);
        let mid = tables.generation();
        tables.mark_dirty(2);
        assert_eq!(tables.generation(), mid, "dirty flag is not structural");
    }

    #[test]
    fn test_dirty_tracking() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::File);
        tables.mark_dirty(2);
        tables.mark_dirty(ROOT_NODE_ID);
        assert_eq!(tables.dirty_nodes(), vec![ROOT_NODE_ID, 2]);
        assert!(tables.take_dirty(2));
        assert!(!tables.take_dirty(2));
        assert_eq!(tables.dirty_nodes(), vec![ROOT_NODE_ID]);
    }

    #[test]
    fn test_node_ref_releases_on_drop() {
        let graph = mounted();
        add(&mut graph.lock(), ROOT_NODE_ID, "a", 2, NodeType::File);

        let node = graph.acquire_unlocked(2).unwrap();
        assert_eq!(graph.lock().ref_count(2), Some(2));
        drop(node);
        assert_eq!(graph.lock().ref_count(2), Some(1));
    }

    #[test]
    fn test_node_ref_release_under_lock() {
        let graph = mounted();
        let mut tables = graph.lock();
        add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::File);
        let node = graph.acquire(&mut tables, 2).unwrap();
        node.release(&mut tables);
        assert_eq!(tables.ref_count(2), Some(1));
    }

    #[test]
    fn test_into_raw_keeps_reference() {
        let graph = mounted();
        add(&mut graph.lock(), ROOT_NODE_ID, "a", 2, NodeType::File);
        let id = graph.acquire_unlocked(2).unwrap().into_raw();
        assert_eq!(graph.lock().ref_count(id), Some(2));
        drop(NodeRef::adopt(&graph, id));
        assert_eq!(graph.lock().ref_count(id), Some(1));
    }

    #[test]
    fn test_acquire_missing_node() {
        let graph = mounted();
        assert!(matches!(
            graph.acquire_unlocked(77),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_stats_track_node_lifetimes() {
        let stats = Arc::new(VolumeStats::new());
        let graph = DirectoryGraph::new(1024, 1024, Arc::clone(&stats));
        {
            let mut tables = graph.lock();
            tables.insert_root(ROOT_NODE_ID, NodeType::Directory).unwrap();
            add(&mut tables, ROOT_NODE_ID, "a", 2, NodeType::File);
            tables.remove_entry(ROOT_NODE_ID, "a").unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.nodes_created, 2);
        assert_eq!(snap.nodes_destroyed, 1);
        assert_eq!(snap.live_nodes(), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Create { parent: usize, name: u8 },
            Remove { parent: usize, name: u8 },
            Rename { from: usize, name: u8, to: usize, new_name: u8 },
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..8, 0u8..4).prop_map(|(parent, name)| Op::Create { parent, name }),
                (0usize..8, 0u8..4).prop_map(|(parent, name)| Op::Remove { parent, name }),
                (0usize..8, 0u8..4, 0usize..8, 0u8..4).prop_map(|(from, name, to, new_name)| {
                    Op::Rename { from, name, to, new_name }
                }),
            ]
        }

        proptest! {
            /// Reachable <=> refcount > 0 holds after any operation sequence,
            /// and removal takes exactly one unit from parent and target.
            #[test]
            fn refcounts_stay_consistent(ops in proptest::collection::vec(op(), 1..60)) {
                let graph = mounted();
                let mut tables = graph.lock();

                for op in ops {
                    // Only directories can be parents; pick among live ones.
                    let mut dirs: Vec<NodeId> = tables
                        .nodes
                        .values()
                        .filter(|n| n.node_type().is_dir())
                        .map(Node::id)
                        .collect();
                    dirs.sort_unstable();
                    let pick = |i: usize| dirs[i % dirs.len()];

                    match op {
                        Op::Create { parent, name } => {
                            let parent = pick(parent);
                            let name = format!("n{name}");
                            if tables.lookup_entry(parent, &name).is_none() {
                                let id = tables.generate_node_id();
                                let ty = if id % 2 == 0 { NodeType::Directory } else { NodeType::File };
                                add(&mut tables, parent, &name, id, ty);
                            }
                        }
                        Op::Remove { parent, name } => {
                            let parent = pick(parent);
                            let name = format!("n{name}");
                            if let Some(target) = tables.lookup_entry(parent, &name) {
                                let empty_dir = tables.child_count(target) == 0;
                                if empty_dir {
                                    let parent_before = tables.ref_count(parent).unwrap();
                                    let target_before = tables.ref_count(target).unwrap();
                                    tables.remove_entry(parent, &name).unwrap();
                                    if parent_before > 1 {
                                        prop_assert_eq!(tables.ref_count(parent), Some(parent_before - 1));
                                    } else {
                                        prop_assert!(!tables.contains_node(parent));
                                    }
                                    if target_before > 1 {
                                        prop_assert_eq!(tables.ref_count(target), Some(target_before - 1));
                                    } else {
                                        prop_assert!(!tables.contains_node(target));
                                    }
                                }
                            }
                        }
                        Op::Rename { from, name, to, new_name } => {
                            let from = pick(from);
                            let to = pick(to);
                            let name = format!("n{name}");
                            let new_name = format!("n{new_name}");
                            if let Some(node) = tables.lookup_entry(from, &name) {
                                // Refuse moves that would create a cycle or
                                // orphan a populated directory.
                                let cycle = tables.ancestors(to).map(|a| a.contains(&node)).unwrap_or(true);
                                let clobbers_dir = tables
                                    .lookup_entry(to, &new_name)
                                    .is_some_and(|t| t != node && tables.child_count(t) > 0);
                                if !cycle && !clobbers_dir {
                                    tables.rename_entry(from, &name, to, &new_name).unwrap();
                                }
                            }
                        }
                    }
                    prop_assert!(tables.check_consistency().is_ok(), "{:?}", tables.check_consistency());
                }
            }
        }
    }
}
