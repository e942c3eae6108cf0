//! Kernel-side collaborator interface.
//!
//! The kernel keeps its own reference count per vnode. The first
//! [`KernelInterface::get_vnode`] for an id loads it through
//! [`VnodeOps::read_vnode`], which takes one graph reference on the node;
//! dropping the last kernel reference gives it back through
//! [`VnodeOps::write_vnode`]. The volume is passed explicitly on every call
//! so several volumes can be mounted side by side.

use crate::error::{FsError, FsResult};
use crate::types::{NodeId, NodeType, StatFields};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Entry points the kernel calls back into.
pub trait VnodeOps: Send + Sync {
    /// Take one graph reference for the kernel and report the node type.
    fn read_vnode(&self, id: NodeId) -> FsResult<NodeType>;

    /// Give back the kernel's graph reference.
    fn write_vnode(&self, id: NodeId);
}

/// Change notifications sent after successful mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    EntryCreated {
        dir: NodeId,
        name: String,
        node: NodeId,
    },
    EntryRemoved {
        dir: NodeId,
        name: String,
        node: NodeId,
    },
    EntryMoved {
        from_dir: NodeId,
        from_name: String,
        to_dir: NodeId,
        to_name: String,
        node: NodeId,
    },
    StatChanged {
        node: NodeId,
        fields: StatFields,
    },
}

/// The kernel-emulation layer as seen by the volume.
///
/// Implementations may call back into `ops`, which takes the table lock;
/// the volume never calls these with the table lock held.
pub trait KernelInterface: Send + Sync {
    /// Acquire a kernel reference on `id`.
    fn get_vnode(&self, ops: &dyn VnodeOps, id: NodeId) -> FsResult<()>;

    /// Release a kernel reference on `id`.
    fn put_vnode(&self, ops: &dyn VnodeOps, id: NodeId);

    /// Register a node whose graph reference the volume hands over directly.
    fn publish_vnode(&self, ops: &dyn VnodeOps, id: NodeId, node_type: NodeType) -> FsResult<()>;

    fn notify(&self, event: NodeEvent);
}

/// Kernel stand-in that only counts references.
///
/// Vnodes are released as soon as their count drops to zero; nothing is
/// cached.
#[derive(Debug, Default)]
pub struct RefCountingKernel {
    vnodes: Mutex<HashMap<NodeId, u32>>,
}

impl RefCountingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel reference count of `id` (0 if unknown).
    pub fn ref_count(&self, id: NodeId) -> u32 {
        self.vnodes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of vnodes the kernel currently holds.
    pub fn vnode_count(&self) -> usize {
        self.vnodes.lock().len()
    }
}

impl KernelInterface for RefCountingKernel {
    fn get_vnode(&self, ops: &dyn VnodeOps, id: NodeId) -> FsResult<()> {
        if let Some(count) = self.vnodes.lock().get_mut(&id) {
            *count += 1;
            return Ok(());
        }

        // Load outside the map lock; read_vnode takes the table lock.
        let node_type = ops.read_vnode(id)?;
        let mut vnodes = self.vnodes.lock();
        let count = vnodes.entry(id).or_insert(0);
        *count += 1;
        if *count > 1 {
            // Lost a race with another loader; keep a single graph reference.
            drop(vnodes);
            ops.write_vnode(id);
        }
        trace!(vnode = id, ?node_type, "vnode loaded");
        Ok(())
    }

    fn put_vnode(&self, ops: &dyn VnodeOps, id: NodeId) {
        let mut vnodes = self.vnodes.lock();
        let Some(count) = vnodes.get_mut(&id) else {
            warn!(vnode = id, "put on unknown vnode");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        vnodes.remove(&id);
        drop(vnodes);
        trace!(vnode = id, "vnode released");
        ops.write_vnode(id);
    }

    fn publish_vnode(&self, _ops: &dyn VnodeOps, id: NodeId, node_type: NodeType) -> FsResult<()> {
        let mut vnodes = self.vnodes.lock();
        if vnodes.contains_key(&id) {
            return Err(FsError::BadData);
        }
        vnodes.insert(id, 1);
        trace!(vnode = id, ?node_type, "vnode published");
        Ok(())
    }

    fn notify(&self, event: NodeEvent) {
        debug!(?event, "notify");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        refs: AtomicU32,
    }

    impl VnodeOps for Counting {
        fn read_vnode(&self, id: NodeId) -> FsResult<NodeType> {
            if id == 404 {
                return Err(FsError::NotFound);
            }
            self.refs.fetch_add(1, Ordering::SeqCst);
            Ok(NodeType::File)
        }

        fn write_vnode(&self, _id: NodeId) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_first_get_loads_last_put_releases() {
        let kernel = RefCountingKernel::new();
        let ops = Counting::default();
        kernel.get_vnode(&ops, 5).unwrap();
        kernel.get_vnode(&ops, 5).unwrap();
        assert_eq!(kernel.ref_count(5), 2);
        assert_eq!(ops.refs.load(Ordering::SeqCst), 1);

        kernel.put_vnode(&ops, 5);
        assert_eq!(ops.refs.load(Ordering::SeqCst), 1);
        kernel.put_vnode(&ops, 5);
        assert_eq!(ops.refs.load(Ordering::SeqCst), 0);
        assert_eq!(kernel.vnode_count(), 0);
    }

    #[test]
    fn test_failed_load_leaves_nothing() {
        let kernel = RefCountingKernel::new();
        let ops = Counting::default();
        assert!(kernel.get_vnode(&ops, 404).is_err());
        assert_eq!(kernel.vnode_count(), 0);
    }

    #[test]
    fn test_publish_does_not_load() {
        let kernel = RefCountingKernel::new();
        let ops = Counting::default();
        kernel.publish_vnode(&ops, 1, NodeType::Directory).unwrap();
        assert_eq!(kernel.ref_count(1), 1);
        assert_eq!(ops.refs.load(Ordering::SeqCst), 0);
        assert!(kernel.publish_vnode(&ops, 1, NodeType::Directory).is_err());
    }
}
