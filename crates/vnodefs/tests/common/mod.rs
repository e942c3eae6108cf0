//! Shared harness for volume integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use vnodefs::testing::{MemoryBackend, MemoryFs, MockKernel};
use vnodefs::{Backend, DirEntry, MountConfig, NodeId, VolumeService};

/// A mounted volume over an in-memory backend.
pub struct Harness {
    pub fs: Arc<MemoryFs>,
    pub kernel: Arc<MockKernel>,
    pub volume: VolumeService,
    pub root: NodeId,
}

impl Harness {
    /// Ids of every node the graph currently holds.
    pub fn node_count(&self) -> usize {
        self.volume.graph().lock().node_count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.volume.graph().lock().contains_node(id)
    }

    pub fn path_of(&self, id: NodeId) -> String {
        self.volume.graph().lock().build_path(id).unwrap()
    }

    pub fn assert_consistent(&self) {
        if let Err(msg) = self.volume.graph().lock().check_consistency() {
            panic!("graph inconsistent: {msg}");
        }
    }

    /// Look up a `/`-separated path, releasing intermediate references.
    pub fn lookup_path(&self, path: &str) -> NodeId {
        let mut current = self.root;
        let mut owned = false;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            let next = self.volume.lookup(current, name).unwrap();
            if owned {
                self.volume.put_vnode(current);
            }
            current = next;
            owned = true;
        }
        assert!(owned, "empty path");
        current
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn mount_with(fs: Arc<MemoryFs>, backend: Backend, config: MountConfig) -> Harness {
    init_tracing();
    let kernel = Arc::new(MockKernel::new());
    let volume = VolumeService::new(backend, Arc::clone(&kernel) as _, config);
    let root = volume.mount().unwrap();
    Harness {
        fs,
        kernel,
        volume,
        root,
    }
}

pub fn mount(fs: Arc<MemoryFs>, config: MountConfig) -> Harness {
    let backend = Backend::path(MemoryBackend::new(Arc::clone(&fs)));
    mount_with(fs, backend, config)
}

/// `/docs` (ino 42) holding `/docs/notes.txt` (ino 43).
pub fn docs_fs() -> Arc<MemoryFs> {
    let fs = MemoryFs::new();
    fs.set_next_ino(42);
    fs.add_dir("/docs");
    fs.add_file("/docs/notes.txt", b"meeting notes");
    fs
}

/// Full listing of `dir` through a fresh directory cookie.
pub fn list(volume: &VolumeService, dir: NodeId) -> Vec<DirEntry> {
    let cookie = volume.open_dir(dir).unwrap();
    let mut entries = Vec::new();
    loop {
        let batch = volume.read_dir(dir, cookie, 16, 4096).unwrap();
        if batch.is_empty() {
            break;
        }
        entries.extend(batch);
    }
    volume.close_dir(dir, cookie).unwrap();
    volume.free_dir_cookie(dir, cookie).unwrap();
    entries
}

pub fn names(entries: &[DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}
