//! Test doubles for exercising a volume without a real kernel or backend.
//!
//! - **Backends**: an in-memory tree served by path or by inode
//! - **Kernel**: a reference-counting kernel that records notifications
//! - **Assertions**: errno checks with readable failures
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use vnodefs::testing::{MemoryBackend, MemoryFs, MockKernel};
//! use vnodefs::{Backend, MountConfig, VolumeService};
//!
//! let fs = MemoryFs::new();
//! fs.add_dir("/docs");
//! let kernel = Arc::new(MockKernel::new());
//! let volume = VolumeService::new(
//!     Backend::path(MemoryBackend::new(Arc::clone(&fs))),
//!     kernel,
//!     MountConfig::default(),
//! );
//! let root = volume.mount().unwrap();
//! let docs = volume.lookup(root, "docs").unwrap();
//! volume.put_vnode(docs);
//! ```

pub mod kernel;
pub mod memory;

pub use kernel::MockKernel;
pub use memory::{MEMORY_ROOT_INO, MemoryBackend, MemoryFs, MemoryLowlevelBackend};

use crate::error::FsResult;

/// Assert that `result` failed with `errno` as the kernel would see it.
pub fn assert_errno<T: std::fmt::Debug>(result: FsResult<T>, errno: i32, context: &str) {
    match result {
        Ok(value) => panic!("{context}: expected errno {errno}, got Ok({value:?})"),
        Err(err) => assert_eq!(
            err.to_errno(),
            errno,
            "{context}: expected errno {errno}, got {err}"
        ),
    }
}
