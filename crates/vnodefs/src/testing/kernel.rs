//! Kernel stand-in that records notifications.

use crate::error::{FsError, FsResult};
use crate::kernel::{KernelInterface, NodeEvent, RefCountingKernel, VnodeOps};
use crate::types::{NodeId, NodeType};
use parking_lot::Mutex;
use std::collections::HashSet;

/// [`RefCountingKernel`] plus an event log and injectable load failures.
#[derive(Debug, Default)]
pub struct MockKernel {
    inner: RefCountingKernel,
    events: Mutex<Vec<NodeEvent>>,
    refuse: Mutex<HashSet<NodeId>>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ref_count(&self, id: NodeId) -> u32 {
        self.inner.ref_count(id)
    }

    pub fn vnode_count(&self) -> usize {
        self.inner.vnode_count()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }

    /// Return and forget the events recorded so far.
    pub fn take_events(&self) -> Vec<NodeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Make `get_vnode` fail for `id`.
    pub fn refuse(&self, id: NodeId) {
        self.refuse.lock().insert(id);
    }
}

impl KernelInterface for MockKernel {
    fn get_vnode(&self, ops: &dyn VnodeOps, id: NodeId) -> FsResult<()> {
        if self.refuse.lock().contains(&id) {
            return Err(FsError::BadData);
        }
        self.inner.get_vnode(ops, id)
    }

    fn put_vnode(&self, ops: &dyn VnodeOps, id: NodeId) {
        self.inner.put_vnode(ops, id);
    }

    fn publish_vnode(&self, ops: &dyn VnodeOps, id: NodeId, node_type: NodeType) -> FsResult<()> {
        self.inner.publish_vnode(ops, id, node_type)
    }

    fn notify(&self, event: NodeEvent) {
        self.events.lock().push(event);
    }
}
