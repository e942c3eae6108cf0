//! Serve a path-addressed filesystem backend as a node-id addressed VFS.
//!
//! Backends written against a path interface (every call names an absolute
//! path) or a lowlevel interface (every call names an inode and answers
//! through a reply token) are exposed to a kernel that addresses objects by
//! stable node ids and reference-counted vnodes.
//!
//! # Components
//!
//! ## Volume
//!
//! - [`VolumeService`] - The kernel-facing operation table
//! - [`MountConfig`] - Id mode, depth and path limits, volume naming
//!
//! ## Node Graph
//!
//! - [`DirectoryGraph`] - Nodes and `(parent, name)` entries under one lock
//! - [`PathResolver`] - Name to node resolution, backend-assisted on a miss
//! - [`LockManager`] - Per-node reader/writer locks along ancestor chains
//! - [`DirEntryCache`] - Listing snapshot for one open directory
//!
//! ## Backends
//!
//! - [`PathBackend`] / [`LowlevelBackend`] - The two backend interfaces
//! - [`RequestBridge`] - Turns callback-style replies into return values
//! - [`PassthroughBackend`] - Serves a host directory
//!
//! ## Kernel
//!
//! - [`KernelInterface`] / [`VnodeOps`] - Vnode references and notifications
//! - [`RefCountingKernel`] - Minimal in-process kernel
//!
//! # Locking
//!
//! One mutex guards all graph tables and is never held across a backend or
//! kernel call. Operations additionally hold per-node reader/writer locks on
//! every node between the one they work on and the root, so a path built
//! under the table lock stays valid while the backend runs. A chain is
//! locked leaf first, walking parent links up to the root. Two-chain
//! operations (link, rename) lock the branch below the lowest common
//! ancestor whose first node has the smaller id first, then the other
//! branch, then the shared part from the common ancestor up. When both
//! chains start at the same directory that shared part is taken in write
//! mode.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vnodefs::testing::{MemoryBackend, MemoryFs};
//! use vnodefs::{Backend, MountConfig, RefCountingKernel, VolumeService};
//!
//! let fs = MemoryFs::new();
//! fs.add_dir("/docs");
//! fs.add_file("/docs/notes.txt", b"hello");
//!
//! let volume = VolumeService::new(
//!     Backend::path(MemoryBackend::new(fs)),
//!     Arc::new(RefCountingKernel::new()),
//!     MountConfig::default(),
//! );
//! let root = volume.mount().unwrap();
//! let docs = volume.lookup(root, "docs").unwrap();
//! let notes = volume.lookup(docs, "notes.txt").unwrap();
//! assert_eq!(volume.read_stat(notes).unwrap().size, 5);
//!
//! volume.put_vnode(notes);
//! volume.put_vnode(docs);
//! volume.unmount().unwrap();
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod dir_cache;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod handles;
pub mod kernel;
pub mod locks;
pub mod passthrough;
pub mod path;
pub mod request_bridge;
pub mod testing;
pub mod types;
mod volume;

pub use backend::{
    BackendDirEntry, BackendHooks, DirInterface, LowlevelBackend, PathBackend, VolumeCapabilities,
    XattrReply,
};
pub use config::MountConfig;
pub use dir_cache::DirEntryCache;
pub use dispatch::Backend;
pub use error::{BackendResult, Errno, FsError, FsResult};
pub use graph::{DirectoryGraph, NodeRef, Tables};
pub use kernel::{KernelInterface, NodeEvent, RefCountingKernel, VnodeOps};
pub use locks::{ChainSpec, LockManager, LockMode};
pub use passthrough::PassthroughBackend;
pub use path::PathResolver;
pub use request_bridge::{ReplyToken, RequestBridge};
pub use types::{
    AttrStat, AttrType, DirEntry, FileStat, FsInfo, MIME_TYPE_ATTR, NodeId, NodeType, ROOT_NODE_ID,
    StatFields, StatVfs, Timespec,
};
pub use volume::VolumeService;
pub use vnodefs_mount::VolumeStatsSnapshot;
