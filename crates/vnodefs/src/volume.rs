//! The kernel-facing volume.
//!
//! Every operation follows the same shape: lock the node chain(s) it needs,
//! build backend targets under the table lock, drop the table lock, call
//! the backend, then take the table lock again to update the graph. Kernel
//! callbacks and notifications are issued without the table lock held.
//!
//! # Locking per operation
//!
//! | Operation | Chains |
//! |---|---|
//! | lookup, read_dir (cache build) | read: directory chain |
//! | read_stat, write_stat, access, read_symlink, open, close, read, write, fsync, open_dir | read: parent chain |
//! | create, create_dir, create_symlink, unlink, remove_dir | write: directory chain |
//! | link | write: directory chain + read: node's parent chain |
//! | rename | write: both directory chains |
//! | open_attr, read_attr_dir (name snapshot) | read: parent chain |
//!
//! Reading an open attribute, its stat, and set_flags only touch the cookie.

use crate::backend::{BackendHooks, DirInterface, VolumeCapabilities};
use crate::config::MountConfig;
use crate::dir_cache::DirEntryCache;
use crate::dispatch::{Backend, ChildTarget, Created, Dispatch, Target};
use crate::error::{Errno, FsError, FsResult};
use crate::graph::DirectoryGraph;
use crate::handles::{AttrCookie, AttrDirCookie, CookieTable, DirCookie, DirHandle, FileCookie};
use crate::kernel::{KernelInterface, NodeEvent, VnodeOps};
use crate::locks::{ChainSpec, LockManager};
use crate::path::PathResolver;
use crate::request_bridge::BridgeStats;
use crate::types::{AttrStat, DirEntry, FileStat, FsInfo, NodeId, NodeType, ROOT_NODE_ID, StatFields};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use vnodefs_mount::{VolumeStats, VolumeStatsSnapshot};

/// Free node count reported in [`FsInfo`]; statfs gives no usable value.
const REPORTED_FREE_NODES: u64 = 100;

/// Open flags `set_flags` may change on an open file.
#[cfg(target_os = "linux")]
const SETTABLE_FLAGS: i32 =
    libc::O_APPEND | libc::O_NONBLOCK | libc::O_SYNC | libc::O_RSYNC | libc::O_DSYNC | libc::O_DIRECT;
#[cfg(not(target_os = "linux"))]
const SETTABLE_FLAGS: i32 = libc::O_APPEND | libc::O_NONBLOCK | libc::O_SYNC | libc::O_DSYNC;

/// A mounted (or mountable) backend served under node-id addressing.
pub struct VolumeService {
    config: MountConfig,
    graph: DirectoryGraph,
    locks: LockManager,
    dispatch: Dispatch,
    kernel: Arc<dyn KernelInterface>,
    capabilities: VolumeCapabilities,
    dir_interface: DirInterface,
    files: CookieTable<FileCookie>,
    dirs: CookieTable<DirCookie>,
    attr_dirs: CookieTable<AttrDirCookie>,
    attrs: CookieTable<AttrCookie>,
    stats: Arc<VolumeStats>,
    name: String,
}

fn ignore_enosys(result: FsResult<()>) -> FsResult<()> {
    match result {
        Err(FsError::Backend(Errno::ENOSYS)) => Ok(()),
        other => other,
    }
}

/// The new file's own target after a create, for cleanup.
fn created_target(child: &ChildTarget, created: &Created) -> Option<Target> {
    match child {
        ChildTarget::Path(path) => Some(Target::Path(path.clone())),
        ChildTarget::Child { .. } => created.stat.as_ref().map(|stat| Target::Node(stat.ino)),
    }
}

impl VolumeService {
    pub fn new(backend: Backend, kernel: Arc<dyn KernelInterface>, mut config: MountConfig) -> Self {
        let lowlevel = backend.is_lowlevel();
        if lowlevel && !config.use_node_ids {
            warn!("lowlevel backends address nodes by id; forcing stable node ids");
            config.use_node_ids = true;
        }

        let stats = Arc::new(VolumeStats::new());
        let dispatch = Dispatch::new(backend, Arc::clone(&stats));
        let hooks = dispatch.hooks();
        let capabilities = VolumeCapabilities::from_hooks(hooks, lowlevel);
        let dir_interface = if lowlevel {
            DirInterface::ReadDir {
                opendir: hooks.contains(BackendHooks::OPENDIR),
            }
        } else {
            DirInterface::from_hooks(hooks)
        };
        let name = config.volume_name_for(dispatch.name());

        Self {
            graph: DirectoryGraph::new(config.max_tree_depth, config.max_path_len, Arc::clone(&stats)),
            locks: LockManager::new(Arc::clone(&stats)),
            dispatch,
            kernel,
            capabilities,
            dir_interface,
            files: CookieTable::new(),
            dirs: CookieTable::new(),
            attr_dirs: CookieTable::new(),
            attrs: CookieTable::new(),
            stats,
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn capabilities(&self) -> VolumeCapabilities {
        self.capabilities
    }

    pub fn stats(&self) -> VolumeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn bridge_stats(&self) -> &BridgeStats {
        self.dispatch.bridge_stats()
    }

    /// The node graph, for inspection.
    pub fn graph(&self) -> &DirectoryGraph {
        &self.graph
    }

    pub fn root_id(&self) -> FsResult<NodeId> {
        self.graph.lock().root_id()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    pub fn open_dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Open attribute directories plus open attributes.
    pub fn open_attr_count(&self) -> usize {
        self.attr_dirs.len() + self.attrs.len()
    }

    fn require(&self, capability: VolumeCapabilities) -> FsResult<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(FsError::Unsupported)
        }
    }

    fn resolver(&self) -> PathResolver<'_> {
        PathResolver::new(&self.graph, &self.dispatch, self.config.use_node_ids, &self.stats)
    }

    fn target_of(&self, id: NodeId) -> FsResult<Target> {
        let tables = self.graph.lock();
        self.dispatch.target(&tables, id)
    }

    fn child_target_of(&self, dir: NodeId, name: &str) -> FsResult<ChildTarget> {
        let tables = self.graph.lock();
        self.dispatch.child_target(&tables, dir, name)
    }

    fn mark_dirty(&self, ids: &[NodeId]) {
        let mut tables = self.graph.lock();
        for &id in ids {
            tables.mark_dirty(id);
        }
    }

    /// Id `name` resolves to, for notifications. Resolution failures are
    /// not errors here.
    fn node_id_for(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        let mut tables = self.graph.lock();
        match self.resolver().resolve(&mut tables, dir, name) {
            Ok(node) => {
                let id = node.id();
                node.release(&mut tables);
                Some(id)
            }
            Err(err) => {
                trace!(dir, name, error = %err, "no node for notification");
                None
            }
        }
    }

    /// Resolve `name` and hand the caller a kernel reference instead of a
    /// graph reference.
    fn resolve_for_kernel(&self, dir: NodeId, name: &str) -> FsResult<NodeId> {
        let node = {
            let mut tables = self.graph.lock();
            self.resolver().resolve(&mut tables, dir, name)?
        };
        let id = node.id();
        self.kernel.get_vnode(self, id)?;
        drop(node);
        Ok(id)
    }

    /// Flush and release a backend handle, logging failures.
    fn close_handle(&self, target: &Target, fh: u64) {
        if let Err(err) = ignore_enosys(self.dispatch.flush(target, fh)) {
            debug!(?target, error = %err, "flush failed");
        }
        if let Err(err) = ignore_enosys(self.dispatch.release(target, fh)) {
            debug!(?target, error = %err, "release failed");
        }
    }

    /// Open, fully sync and close a node.
    fn sync_target(&self, target: &Target) -> FsResult<()> {
        let fh = self.dispatch.open(target, libc::O_RDONLY)?;
        let result = self.dispatch.fsync(target, fh, false);
        self.close_handle(target, fh);
        result
    }

    // Volume lifecycle

    /// Create the root node from the backend root and publish it.
    pub fn mount(&self) -> FsResult<NodeId> {
        let root_target = self.dispatch.root_target();
        let stat = self.dispatch.getattr(&root_target)?;
        if !stat.node_type().is_dir() {
            return Err(FsError::NotADirectory);
        }

        let root = match root_target {
            Target::Node(id) => id,
            Target::Path(_) if self.config.use_node_ids => stat.ino,
            Target::Path(_) => ROOT_NODE_ID,
        };
        self.graph.lock().insert_root(root, NodeType::Directory)?;

        if let Err(err) = self.kernel.publish_vnode(self, root, NodeType::Directory) {
            self.graph.lock().clear();
            return Err(err);
        }
        info!(volume = %self.name, root, stable_ids = self.config.use_node_ids, "mounted");
        Ok(root)
    }

    /// Drop the kernel's root reference and forget the graph.
    pub fn unmount(&self) -> FsResult<()> {
        let root = self.root_id()?;
        self.kernel.put_vnode(self, root);
        self.files.clear();
        self.dirs.clear();
        self.attr_dirs.clear();
        self.attrs.clear();
        let mut tables = self.graph.lock();
        debug!(nodes = tables.node_count(), entries = tables.entry_count(), "dropping graph");
        tables.clear();
        info!(volume = %self.name, "unmounted");
        Ok(())
    }

    /// Sync every dirty node. Nodes that fail stay dirty.
    pub fn sync(&self) -> FsResult<()> {
        let dirty = self.graph.lock().dirty_nodes();
        trace!(count = dirty.len(), "sync");

        for id in dirty {
            let target = {
                let mut tables = self.graph.lock();
                if !tables.take_dirty(id) {
                    continue;
                }
                match self.dispatch.target(&tables, id) {
                    Ok(target) => target,
                    Err(err) => {
                        tables.mark_dirty(id);
                        debug!(node = id, error = %err, "skipping unreachable dirty node");
                        continue;
                    }
                }
            };

            if let Err(err) = self.sync_target(&target) {
                warn!(node = id, error = %err, "sync failed");
                self.graph.lock().mark_dirty(id);
            }
        }
        Ok(())
    }

    pub fn read_fs_info(&self) -> FsResult<FsInfo> {
        self.require(VolumeCapabilities::READ_FS_INFO)?;
        let st = self.dispatch.statfs(&self.dispatch.root_target())?;
        Ok(FsInfo {
            persistent: true,
            block_size: st.block_size,
            io_size: self.config.io_size,
            total_blocks: st.blocks,
            free_blocks: st.blocks_free,
            total_nodes: st.files,
            free_nodes: REPORTED_FREE_NODES,
            volume_name: self.name.clone(),
        })
    }

    // Nodes

    /// Resolve `name` in `dir`. The returned id carries a kernel reference.
    pub fn lookup(&self, dir: NodeId, name: &str) -> FsResult<NodeId> {
        trace!(dir, name, "lookup");
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(dir))?;
        self.resolve_for_kernel(dir, name)
    }

    /// Name of the node's first entry; "/" for the root.
    pub fn get_vnode_name(&self, node: NodeId) -> FsResult<String> {
        let tables = self.graph.lock();
        if tables.root() == Some(node) {
            return Ok("/".to_owned());
        }
        let (_, name) = tables
            .node(node)
            .ok_or(FsError::NotFound)?
            .first_entry()
            .ok_or(FsError::NotFound)?;
        if name.is_empty() {
            return Err(FsError::BadData);
        }
        Ok(name.to_owned())
    }

    /// Release a kernel reference obtained from `lookup` or `create`.
    pub fn put_vnode(&self, node: NodeId) {
        self.kernel.put_vnode(self, node);
    }

    pub fn read_stat(&self, node: NodeId) -> FsResult<FileStat> {
        trace!(node, "read_stat");
        self.require(VolumeCapabilities::READ_STAT)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        let mut stat = self.dispatch.getattr(&target)?;
        stat.ino = node;
        Ok(stat)
    }

    pub fn write_stat(&self, node: NodeId, stat: &FileStat, fields: StatFields) -> FsResult<()> {
        trace!(node, ?fields, "write_stat");
        self.require(VolumeCapabilities::WRITE_STAT)?;
        {
            let _chain =
                self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
            let target = self.target_of(node)?;
            self.dispatch.write_stat(&target, stat, fields)?;
            self.mark_dirty(&[node]);
        }
        self.kernel.notify(NodeEvent::StatChanged { node, fields });
        Ok(())
    }

    pub fn access(&self, node: NodeId, mask: i32) -> FsResult<()> {
        trace!(node, mask, "access");
        self.require(VolumeCapabilities::ACCESS)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        self.dispatch.access(&target, mask)
    }

    pub fn read_symlink(&self, node: NodeId) -> FsResult<String> {
        trace!(node, "read_symlink");
        self.require(VolumeCapabilities::READ_SYMLINK)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        self.dispatch.readlink(&target)
    }

    // Entries

    pub fn create_symlink(&self, dir: NodeId, name: &str, link_target: &str) -> FsResult<()> {
        trace!(dir, name, link_target, "create_symlink");
        self.require(VolumeCapabilities::CREATE_SYMLINK)?;
        let node = {
            let _chain = self.locks.lock_chain(&self.graph, ChainSpec::write(dir))?;
            let target = self.child_target_of(dir, name)?;
            self.dispatch.symlink(link_target, &target)?;
            self.mark_dirty(&[dir]);
            self.node_id_for(dir, name)
        };
        if let Some(node) = node {
            self.kernel.notify(NodeEvent::EntryCreated {
                dir,
                name: name.to_owned(),
                node,
            });
        }
        Ok(())
    }

    /// Hard-link `node` as `name` in `dir`. The graph learns the new entry
    /// on its next lookup.
    pub fn link(&self, dir: NodeId, name: &str, node: NodeId) -> FsResult<()> {
        trace!(dir, name, node, "link");
        self.require(VolumeCapabilities::LINK)?;
        {
            let _chains = self.locks.lock_chains(
                &self.graph,
                ChainSpec::write(dir),
                ChainSpec::read(node).from_parent(),
            )?;
            let (existing, target) = {
                let tables = self.graph.lock();
                (
                    self.dispatch.target(&tables, node)?,
                    self.dispatch.child_target(&tables, dir, name)?,
                )
            };
            self.dispatch.link(&existing, &target)?;
            self.mark_dirty(&[dir, node]);
        }
        self.kernel.notify(NodeEvent::EntryCreated {
            dir,
            name: name.to_owned(),
            node,
        });
        Ok(())
    }

    pub fn unlink(&self, dir: NodeId, name: &str) -> FsResult<()> {
        trace!(dir, name, "unlink");
        self.require(VolumeCapabilities::UNLINK)?;
        self.remove_entry(dir, name, false)
    }

    pub fn remove_dir(&self, dir: NodeId, name: &str) -> FsResult<()> {
        trace!(dir, name, "remove_dir");
        self.require(VolumeCapabilities::REMOVE_DIR)?;
        self.remove_entry(dir, name, true)
    }

    fn remove_entry(&self, dir: NodeId, name: &str, is_dir: bool) -> FsResult<()> {
        let node = {
            let _chain = self.locks.lock_chain(&self.graph, ChainSpec::write(dir))?;
            let node = self.node_id_for(dir, name);
            let target = self.child_target_of(dir, name)?;
            if is_dir {
                self.dispatch.rmdir(&target)?;
            } else {
                self.dispatch.unlink(&target)?;
            }

            let mut tables = self.graph.lock();
            match tables.remove_entry(dir, name) {
                Ok(_) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
            tables.mark_dirty(dir);
            node
        };

        if let Some(node) = node {
            self.kernel.notify(NodeEvent::EntryRemoved {
                dir,
                name: name.to_owned(),
                node,
            });
        }
        Ok(())
    }

    pub fn rename(&self, old_dir: NodeId, old_name: &str, new_dir: NodeId, new_name: &str) -> FsResult<()> {
        trace!(old_dir, old_name, new_dir, new_name, "rename");
        self.require(VolumeCapabilities::RENAME)?;
        let node = {
            let _chains = self.locks.lock_chains(
                &self.graph,
                ChainSpec::write(old_dir),
                ChainSpec::write(new_dir),
            )?;
            let (from, to) = {
                let tables = self.graph.lock();
                (
                    self.dispatch.child_target(&tables, old_dir, old_name)?,
                    self.dispatch.child_target(&tables, new_dir, new_name)?,
                )
            };
            self.dispatch.rename(&from, &to)?;

            {
                let mut tables = self.graph.lock();
                match tables.rename_entry(old_dir, old_name, new_dir, new_name) {
                    Ok(_) => {}
                    Err(FsError::NotFound) => {
                        // Never looked up: only a stale destination entry
                        // can be left behind.
                        match tables.remove_entry(new_dir, new_name) {
                            Ok(_) | Err(FsError::NotFound) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    Err(err) => return Err(err),
                }
                tables.mark_dirty(old_dir);
                tables.mark_dirty(new_dir);
            }
            self.node_id_for(new_dir, new_name)
        };

        if let Some(node) = node {
            self.kernel.notify(NodeEvent::EntryMoved {
                from_dir: old_dir,
                from_name: old_name.to_owned(),
                to_dir: new_dir,
                to_name: new_name.to_owned(),
                node,
            });
        }
        Ok(())
    }

    // Files

    /// Create and open a regular file. The returned id carries a kernel
    /// reference; the cookie is open.
    pub fn create(&self, dir: NodeId, name: &str, flags: i32, mode: u32) -> FsResult<(NodeId, u64)> {
        trace!(dir, name, flags, mode, "create");
        self.require(VolumeCapabilities::CREATE)?;
        let (node, cookie) = {
            let _chain = self.locks.lock_chain(&self.graph, ChainSpec::write(dir))?;
            let target = self.child_target_of(dir, name)?;
            let created = self.dispatch.create(&target, mode, flags)?;

            let node = match self.resolve_for_kernel(dir, name) {
                Ok(node) => node,
                Err(err) => {
                    error!(dir, name, error = %err, "created file cannot be resolved, removing it");
                    if let Some(file) = created_target(&target, &created) {
                        self.close_handle(&file, created.fh);
                    }
                    if let Err(unlink_err) = self.dispatch.unlink(&target) {
                        warn!(dir, name, error = %unlink_err, "cleanup unlink failed");
                    }
                    match self.graph.lock().remove_entry(dir, name) {
                        Ok(_) | Err(FsError::NotFound) => {}
                        Err(graph_err) => warn!(dir, name, error = %graph_err, "cleanup unbind failed"),
                    }
                    return Err(err);
                }
            };

            self.mark_dirty(&[dir, node]);
            let cookie = self.files.insert(FileCookie {
                flags: flags & !libc::O_TRUNC,
                fh: created.fh,
            });
            (node, cookie)
        };

        self.kernel.notify(NodeEvent::EntryCreated {
            dir,
            name: name.to_owned(),
            node,
        });
        Ok((node, cookie))
    }

    /// Open a node. `O_TRUNC` is applied after the open succeeds.
    pub fn open(&self, node: NodeId, flags: i32) -> FsResult<u64> {
        trace!(node, flags, "open");
        self.require(VolumeCapabilities::OPEN)?;
        let truncate = flags & libc::O_TRUNC != 0;
        let flags = flags & !libc::O_TRUNC;

        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let (target, node_type) = {
            let tables = self.graph.lock();
            let node_type = tables.node_type(node).ok_or(FsError::NotFound)?;
            (self.dispatch.target(&tables, node)?, node_type)
        };

        let fh = if self.dispatch.is_lowlevel() && node_type.is_dir() {
            self.dispatch.opendir(&target)?
        } else {
            self.dispatch.open(&target, flags)?
        };

        if truncate {
            if let Err(err) = self.dispatch.truncate_open(&target, fh) {
                self.close_handle(&target, fh);
                return Err(err);
            }
            self.mark_dirty(&[node]);
            self.kernel.notify(NodeEvent::StatChanged {
                node,
                fields: StatFields::SIZE | StatFields::MTIME,
            });
        }

        Ok(self.files.insert(FileCookie { flags, fh }))
    }

    /// Replace the settable status flags (append, non-blocking, sync modes)
    /// of an open file. The backend is not involved.
    pub fn set_flags(&self, node: NodeId, cookie: u64, flags: i32) -> FsResult<()> {
        trace!(node, cookie, flags, "set_flags");
        let cookie = self.files.get(cookie)?;
        let mut cookie = cookie.lock();
        cookie.flags = (cookie.flags & !SETTABLE_FLAGS) | (flags & SETTABLE_FLAGS);
        Ok(())
    }

    /// Flush an open file. The cookie stays valid.
    pub fn close(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "close");
        let cookie = self.files.get(cookie)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        let fh = cookie.lock().fh;
        ignore_enosys(self.dispatch.flush(&target, fh))
    }

    /// Release the backend handle and drop the cookie.
    pub fn free_cookie(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "free_cookie");
        let cookie = self.files.remove(cookie)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        let fh = cookie.lock().fh;
        ignore_enosys(self.dispatch.release(&target, fh))
    }

    pub fn read(&self, node: NodeId, cookie: u64, pos: u64, size: usize) -> FsResult<Vec<u8>> {
        trace!(node, cookie, pos, size, "read");
        self.require(VolumeCapabilities::READ)?;
        let cookie = self.files.get(cookie)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        let cookie = cookie.lock();
        self.dispatch.read(&target, cookie.fh, pos, size)
    }

    pub fn write(&self, node: NodeId, cookie: u64, pos: u64, data: &[u8]) -> FsResult<usize> {
        trace!(node, cookie, pos, len = data.len(), "write");
        self.require(VolumeCapabilities::WRITE)?;
        let cookie = self.files.get(cookie)?;
        let written = {
            let _chain =
                self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
            let target = self.target_of(node)?;
            let cookie = cookie.lock();
            let written = self.dispatch.write(&target, cookie.fh, pos, data)?;
            self.mark_dirty(&[node]);
            written
        };
        self.kernel.notify(NodeEvent::StatChanged {
            node,
            fields: StatFields::SIZE | StatFields::MTIME,
        });
        Ok(written)
    }

    /// Sync one node. The dirty flag is restored if the sync fails.
    pub fn fsync(&self, node: NodeId) -> FsResult<()> {
        trace!(node, "fsync");
        self.require(VolumeCapabilities::FSYNC)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let (target, was_dirty) = {
            let mut tables = self.graph.lock();
            let target = self.dispatch.target(&tables, node)?;
            (target, tables.take_dirty(node))
        };

        let result = self.sync_target(&target);
        if result.is_err() && was_dirty {
            self.mark_dirty(&[node]);
        }
        result
    }

    // Directories

    pub fn create_dir(&self, dir: NodeId, name: &str, mode: u32) -> FsResult<()> {
        trace!(dir, name, mode, "create_dir");
        self.require(VolumeCapabilities::CREATE_DIR)?;
        let node = {
            let _chain = self.locks.lock_chain(&self.graph, ChainSpec::write(dir))?;
            let target = self.child_target_of(dir, name)?;
            self.dispatch.mkdir(&target, mode)?;
            self.mark_dirty(&[dir]);
            self.node_id_for(dir, name)
        };
        if let Some(node) = node {
            self.kernel.notify(NodeEvent::EntryCreated {
                dir,
                name: name.to_owned(),
                node,
            });
        }
        Ok(())
    }

    pub fn open_dir(&self, node: NodeId) -> FsResult<u64> {
        trace!(node, "open_dir");
        self.require(VolumeCapabilities::OPEN_DIR)?;
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let handle = match self.dir_interface {
            DirInterface::ReadDir { opendir: true } => {
                let target = self.target_of(node)?;
                DirHandle::Opened(self.dispatch.opendir(&target)?)
            }
            DirInterface::ReadDir { opendir: false } => DirHandle::Noop,
            DirInterface::GetDir => DirHandle::GetDir,
            DirInterface::Unsupported => return Err(FsError::Unsupported),
        };
        Ok(self.dirs.insert(DirCookie::new(handle)))
    }

    pub fn close_dir(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "close_dir");
        Ok(())
    }

    pub fn free_dir_cookie(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "free_dir_cookie");
        let cookie = self.dirs.remove(cookie)?;
        let DirHandle::Opened(fh) = cookie.lock().handle else {
            return Ok(());
        };
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
        let target = self.target_of(node)?;
        ignore_enosys(self.dispatch.releasedir(&target, fh))
    }

    /// Read up to `max_count` entries totalling at most `max_bytes` of dirent
    /// records. The first call lists the directory; an empty result means
    /// the end was reached.
    pub fn read_dir(&self, node: NodeId, cookie: u64, max_count: usize, max_bytes: usize) -> FsResult<Vec<DirEntry>> {
        trace!(node, cookie, max_count, max_bytes, "read_dir");
        self.require(VolumeCapabilities::READ_DIR)?;
        // An empty batch means end of listing; a zero count would fake one.
        if max_count == 0 {
            return Err(FsError::InvalidArgument);
        }
        let cookie = self.dirs.get(cookie)?;
        let mut cookie = cookie.lock();

        if cookie.cache.is_none() {
            let cache = self.build_dir_cache(node, cookie.handle)?;
            cookie.cache = Some(cache);
            cookie.cursor = 0;
        }

        let DirCookie { cache, cursor, .. } = &mut *cookie;
        match cache {
            Some(cache) => cache.read(cursor, max_count, max_bytes),
            None => Ok(Vec::new()),
        }
    }

    fn build_dir_cache(&self, node: NodeId, handle: DirHandle) -> FsResult<DirEntryCache> {
        let _chain = self.locks.lock_chain(&self.graph, ChainSpec::read(node))?;
        let target = self.target_of(node)?;
        let listing = self.dispatch.list_dir(&target, handle.fh())?;

        let mut cache = DirEntryCache::new();
        {
            let mut tables = self.graph.lock();
            cache.populate(&self.resolver(), &mut tables, node, &listing)?;
        }
        self.stats.record_dir_cache_build();
        debug!(node, entries = cache.len(), "directory listing cached");
        Ok(cache)
    }

    pub fn rewind_dir(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "rewind_dir");
        self.dirs.get(cookie)?.lock().rewind();
        Ok(())
    }

    // Extended attributes

    /// Open the attribute directory of a node. Names are fetched by the
    /// first read.
    pub fn open_attr_dir(&self, node: NodeId) -> FsResult<u64> {
        trace!(node, "open_attr_dir");
        self.require(VolumeCapabilities::ATTR_DIR)?;
        if !self.graph.lock().contains_node(node) {
            return Err(FsError::NotFound);
        }
        Ok(self.attr_dirs.insert(AttrDirCookie::new()))
    }

    pub fn close_attr_dir(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "close_attr_dir");
        self.attr_dirs.get(cookie).map(|_| ())
    }

    pub fn free_attr_dir_cookie(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "free_attr_dir_cookie");
        self.attr_dirs.remove(cookie).map(|_| ())
    }

    /// Read attribute names, bounded like [`VolumeService::read_dir`]. Every
    /// entry carries `node`'s id. An empty result means the end was reached.
    pub fn read_attr_dir(&self, node: NodeId, cookie: u64, max_count: usize, max_bytes: usize) -> FsResult<Vec<DirEntry>> {
        trace!(node, cookie, max_count, max_bytes, "read_attr_dir");
        self.require(VolumeCapabilities::ATTR_DIR)?;
        if max_count == 0 {
            return Err(FsError::InvalidArgument);
        }
        let cookie = self.attr_dirs.get(cookie)?;
        let mut cookie = cookie.lock();

        if cookie.names.is_none() {
            let list = {
                let _chain =
                    self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
                let target = self.target_of(node)?;
                self.dispatch.fetch_xattr_names(&target)?
            };
            let mut names = DirEntryCache::new();
            names.populate_attr_names(node, &list)?;
            debug!(node, count = names.len(), "attribute names cached");
            cookie.names = Some(names);
            cookie.cursor = 0;
        }

        let AttrDirCookie { names, cursor } = &mut *cookie;
        match names {
            Some(names) => names.read(cursor, max_count, max_bytes),
            None => Ok(Vec::new()),
        }
    }

    pub fn rewind_attr_dir(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "rewind_attr_dir");
        self.attr_dirs.get(cookie)?.lock().rewind();
        Ok(())
    }

    /// Open one attribute for reading and fetch its value. Only `O_RDONLY`
    /// is supported.
    pub fn open_attr(&self, node: NodeId, name: &str, open_mode: i32) -> FsResult<u64> {
        trace!(node, name, open_mode, "open_attr");
        self.require(VolumeCapabilities::READ_ATTR)?;
        if open_mode & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::Unsupported);
        }
        let value = {
            let _chain =
                self.locks.lock_chain(&self.graph, ChainSpec::read(node).from_parent())?;
            let target = self.target_of(node)?;
            self.dispatch.fetch_xattr(&target, name)?
        };
        Ok(self.attrs.insert(AttrCookie::new(name, value)))
    }

    pub fn close_attr(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "close_attr");
        self.attrs.get(cookie).map(|_| ())
    }

    pub fn free_attr_cookie(&self, node: NodeId, cookie: u64) -> FsResult<()> {
        trace!(node, cookie, "free_attr_cookie");
        self.attrs.remove(cookie).map(|_| ())
    }

    /// Bytes of the value fetched at open; empty past the end.
    pub fn read_attr(&self, node: NodeId, cookie: u64, pos: u64, size: usize) -> FsResult<Vec<u8>> {
        trace!(node, cookie, pos, size, "read_attr");
        Ok(self.attrs.get(cookie)?.lock().read(pos, size))
    }

    pub fn read_attr_stat(&self, node: NodeId, cookie: u64) -> FsResult<AttrStat> {
        trace!(node, cookie, "read_attr_stat");
        Ok(self.attrs.get(cookie)?.lock().stat())
    }
}

impl VnodeOps for VolumeService {
    fn read_vnode(&self, id: NodeId) -> FsResult<NodeType> {
        let mut tables = self.graph.lock();
        tables.ref_node(id)?;
        tables.node_type(id).ok_or(FsError::NotFound)
    }

    fn write_vnode(&self, id: NodeId) {
        self.graph.lock().put_node(id);
    }
}

impl std::fmt::Debug for VolumeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeService")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
