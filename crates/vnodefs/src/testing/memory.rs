//! In-memory filesystem served through both backend flavours.
//!
//! [`MemoryFs`] holds the tree. [`MemoryBackend`] exposes it by path and
//! [`MemoryLowlevelBackend`] by inode, optionally answering from a worker
//! thread. Both record every hook call and can be told to fail a given hook
//! with a chosen errno.

use crate::backend::{BackendDirEntry, BackendHooks, LowlevelBackend, PathBackend, XattrReply};
use crate::error::{BackendResult, Errno};
use crate::request_bridge::ReplyToken;
use crate::types::{FileStat, NodeId, NodeType, StatFields, StatVfs, Timespec};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Inode number of the root directory.
pub const MEMORY_ROOT_INO: u64 = 1;

const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
struct Inode {
    stat: FileStat,
    data: Vec<u8>,
    link_target: String,
    children: BTreeMap<String, u64>,
    xattrs: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct FsState {
    inodes: HashMap<u64, Inode>,
    next_ino: u64,
    next_fh: u64,
    open: HashMap<u64, u64>,
    clock: i64,
    calls: Vec<String>,
    failures: HashMap<String, Errno>,
}

impl FsState {
    fn tick(&mut self) -> Timespec {
        self.clock += 1;
        Timespec::new(self.clock, 0)
    }

    fn inode(&self, ino: u64) -> BackendResult<&Inode> {
        self.inodes.get(&ino).ok_or(Errno::ENOENT)
    }

    fn inode_mut(&mut self, ino: u64) -> BackendResult<&mut Inode> {
        self.inodes.get_mut(&ino).ok_or(Errno::ENOENT)
    }

    fn dir(&self, ino: u64) -> BackendResult<&Inode> {
        let inode = self.inode(ino)?;
        if !inode.stat.node_type().is_dir() {
            return Err(Errno::ENOTDIR);
        }
        Ok(inode)
    }

    fn lookup(&self, parent: u64, name: &str) -> BackendResult<u64> {
        self.dir(parent)?.children.get(name).copied().ok_or(Errno::ENOENT)
    }

    fn resolve(&self, path: &str) -> BackendResult<u64> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(MEMORY_ROOT_INO, |ino, name| self.lookup(ino, name))
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> BackendResult<(u64, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').ok_or(Errno::EINVAL)?;
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        Ok((self.resolve(parent)?, name))
    }

    fn add_node(&mut self, parent: u64, name: &str, node_type: NodeType, perm: u32) -> BackendResult<FileStat> {
        if self.dir(parent)?.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        let now = self.tick();

        let mut stat = FileStat::with_type(ino, node_type, perm);
        stat.atime = now;
        stat.mtime = now;
        stat.ctime = now;
        self.inodes.insert(
            ino,
            Inode {
                stat: stat.clone(),
                data: Vec::new(),
                link_target: String::new(),
                children: BTreeMap::new(),
                xattrs: BTreeMap::new(),
            },
        );

        let dir = self.inode_mut(parent)?;
        dir.children.insert(name.to_owned(), ino);
        dir.stat.mtime = now;
        if node_type.is_dir() {
            dir.stat.nlink += 1;
        }
        Ok(stat)
    }

    fn drop_link(&mut self, ino: u64) {
        let gone = match self.inodes.get_mut(&ino) {
            Some(inode) if inode.stat.node_type().is_dir() => true,
            Some(inode) => {
                inode.stat.nlink = inode.stat.nlink.saturating_sub(1);
                inode.stat.nlink == 0
            }
            None => false,
        };
        if gone {
            self.inodes.remove(&ino);
        }
    }

    fn remove(&mut self, parent: u64, name: &str, want_dir: bool) -> BackendResult<()> {
        let ino = self.lookup(parent, name)?;
        let inode = self.inode(ino)?;
        let is_dir = inode.stat.node_type().is_dir();
        match (want_dir, is_dir) {
            (true, false) => return Err(Errno::ENOTDIR),
            (false, true) => return Err(Errno::EISDIR),
            (true, true) if !inode.children.is_empty() => return Err(Errno::ENOTEMPTY),
            _ => {}
        }

        let now = self.tick();
        let dir = self.inode_mut(parent)?;
        dir.children.remove(name);
        dir.stat.mtime = now;
        if is_dir {
            dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
        }
        self.drop_link(ino);
        Ok(())
    }

    fn rename(&mut self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> BackendResult<()> {
        let ino = self.lookup(parent, name)?;
        self.dir(new_parent)?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        if let Ok(existing) = self.lookup(new_parent, new_name) {
            let existing_dir = self.inode(existing)?.stat.node_type().is_dir();
            let moving_dir = self.inode(ino)?.stat.node_type().is_dir();
            if existing_dir != moving_dir {
                return Err(if existing_dir { Errno::EISDIR } else { Errno::ENOTDIR });
            }
            self.remove(new_parent, new_name, existing_dir)?;
        }

        let now = self.tick();
        let from = self.inode_mut(parent)?;
        from.children.remove(name);
        from.stat.mtime = now;
        let to = self.inode_mut(new_parent)?;
        to.children.insert(new_name.to_owned(), ino);
        to.stat.mtime = now;
        Ok(())
    }

    fn link(&mut self, ino: u64, new_parent: u64, new_name: &str) -> BackendResult<FileStat> {
        if self.inode(ino)?.stat.node_type().is_dir() {
            return Err(Errno(libc::EPERM));
        }
        if self.dir(new_parent)?.children.contains_key(new_name) {
            return Err(Errno::EEXIST);
        }
        self.inode_mut(new_parent)?
            .children
            .insert(new_name.to_owned(), ino);
        let inode = self.inode_mut(ino)?;
        inode.stat.nlink += 1;
        Ok(inode.stat.clone())
    }

    fn set_size(&mut self, ino: u64, size: u64) -> BackendResult<()> {
        let now = self.tick();
        let inode = self.inode_mut(ino)?;
        if inode.stat.node_type().is_dir() {
            return Err(Errno::EISDIR);
        }
        let size_usize = usize::try_from(size).map_err(|_| Errno::EINVAL)?;
        inode.data.resize(size_usize, 0);
        inode.stat.size = size;
        inode.stat.blocks = size.div_ceil(512);
        inode.stat.mtime = now;
        Ok(())
    }

    fn setattr(&mut self, ino: u64, attr: &FileStat, fields: StatFields) -> BackendResult<FileStat> {
        if fields.contains(StatFields::SIZE) {
            self.set_size(ino, attr.size)?;
        }
        let inode = self.inode_mut(ino)?;
        if fields.contains(StatFields::MODE) {
            inode.stat.mode = (inode.stat.mode & !0o7777) | (attr.mode & 0o7777);
        }
        if fields.contains(StatFields::UID) {
            inode.stat.uid = attr.uid;
        }
        if fields.contains(StatFields::GID) {
            inode.stat.gid = attr.gid;
        }
        if fields.contains(StatFields::ATIME) {
            inode.stat.atime = attr.atime;
        }
        if fields.contains(StatFields::MTIME) {
            inode.stat.mtime = attr.mtime;
        }
        Ok(inode.stat.clone())
    }

    fn open(&mut self, ino: u64) -> BackendResult<u64> {
        self.inode(ino)?;
        self.next_fh += 1;
        self.open.insert(self.next_fh, ino);
        Ok(self.next_fh)
    }

    fn release(&mut self, fh: u64) -> BackendResult<()> {
        self.open.remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn read(&self, ino: u64, offset: u64, size: usize) -> BackendResult<Vec<u8>> {
        let data = &self.inode(ino)?.data;
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?.min(data.len());
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(&mut self, ino: u64, offset: u64, bytes: &[u8]) -> BackendResult<usize> {
        let now = self.tick();
        let inode = self.inode_mut(ino)?;
        if inode.stat.node_type().is_dir() {
            return Err(Errno::EISDIR);
        }
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let end = start + bytes.len();
        if inode.data.len() < end {
            inode.data.resize(end, 0);
        }
        inode.data[start..end].copy_from_slice(bytes);
        inode.stat.size = inode.data.len() as u64;
        inode.stat.blocks = inode.stat.size.div_ceil(512);
        inode.stat.mtime = now;
        Ok(bytes.len())
    }

    fn readdir(&self, ino: u64) -> BackendResult<Vec<BackendDirEntry>> {
        let dir = self.dir(ino)?;
        let mut entries = vec![
            BackendDirEntry::new(".", NodeType::Directory),
            BackendDirEntry::new("..", NodeType::Directory),
        ];
        for (name, child) in &dir.children {
            let node_type = self.inode(*child)?.stat.node_type();
            entries.push(BackendDirEntry::new(name.clone(), node_type).with_ino(*child));
        }
        Ok(entries)
    }

    fn listxattr(&self, ino: u64, size: usize) -> BackendResult<XattrReply> {
        let mut list = Vec::new();
        for name in self.inode(ino)?.xattrs.keys() {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        XattrReply::sized(list, size)
    }

    fn getxattr(&self, ino: u64, name: &str, size: usize) -> BackendResult<XattrReply> {
        let value = self.inode(ino)?.xattrs.get(name).ok_or(Errno::ENODATA)?;
        XattrReply::sized(value.clone(), size)
    }

    fn statfs(&self) -> StatVfs {
        let used: u64 = self.inodes.values().map(|i| i.data.len() as u64).sum();
        let blocks = 1 << 20;
        StatVfs {
            block_size: BLOCK_SIZE,
            fragment_size: BLOCK_SIZE,
            blocks,
            blocks_free: blocks - used.div_ceil(BLOCK_SIZE),
            blocks_available: blocks - used.div_ceil(BLOCK_SIZE),
            files: 1 << 16,
            files_free: (1 << 16) - self.inodes.len() as u64,
            name_max: 255,
        }
    }
}

/// Shared in-memory tree.
#[derive(Debug)]
pub struct MemoryFs {
    state: Mutex<FsState>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let root = FileStat::with_type(MEMORY_ROOT_INO, NodeType::Directory, 0o755);
        let mut inodes = HashMap::new();
        inodes.insert(
            MEMORY_ROOT_INO,
            Inode {
                stat: root,
                data: Vec::new(),
                link_target: String::new(),
                children: BTreeMap::new(),
                xattrs: BTreeMap::new(),
            },
        );
        Self {
            state: Mutex::new(FsState {
                inodes,
                next_ino: MEMORY_ROOT_INO + 1,
                next_fh: 0,
                open: HashMap::new(),
                clock: 0,
                calls: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }
}

impl MemoryFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inode number the next created object receives.
    pub fn set_next_ino(&self, ino: u64) {
        self.state.lock().next_ino = ino;
    }

    /// Create a directory at an absolute path; the parent must exist.
    pub fn add_dir(&self, path: &str) -> u64 {
        self.add(path, NodeType::Directory, 0o755)
    }

    pub fn add_file(&self, path: &str, data: &[u8]) -> u64 {
        let ino = self.add(path, NodeType::File, 0o644);
        let mut state = self.state.lock();
        if let Err(errno) = state.write(ino, 0, data) {
            panic!("cannot fill {path}: {errno}");
        }
        ino
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> u64 {
        let ino = self.add(path, NodeType::Symlink, 0o777);
        let mut state = self.state.lock();
        if let Ok(inode) = state.inode_mut(ino) {
            inode.link_target = target.to_owned();
            inode.stat.size = target.len() as u64;
        }
        ino
    }

    fn add(&self, path: &str, node_type: NodeType, perm: u32) -> u64 {
        let mut state = self.state.lock();
        let result = state
            .resolve_parent(path)
            .and_then(|(parent, name)| state.add_node(parent, name, node_type, perm));
        match result {
            Ok(stat) => stat.ino,
            Err(errno) => panic!("cannot create {path}: {errno}"),
        }
    }

    /// Set an extended attribute; the object must exist.
    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8]) {
        let mut state = self.state.lock();
        let result = state.resolve(path).and_then(|ino| state.inode_mut(ino));
        match result {
            Ok(inode) => {
                inode.xattrs.insert(name.to_owned(), value.to_vec());
            }
            Err(errno) => panic!("cannot set {name} on {path}: {errno}"),
        }
    }

    /// Remove an object behind the volume's back.
    pub fn remove(&self, path: &str) -> BackendResult<()> {
        let mut state = self.state.lock();
        let (parent, name) = state.resolve_parent(path)?;
        let ino = state.lookup(parent, name)?;
        let is_dir = state.inode(ino)?.stat.node_type().is_dir();
        state.remove(parent, name, is_dir)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().resolve(path).is_ok()
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        self.state.lock().resolve(path).ok()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.resolve(path).ok()?;
        state.inode(ino).ok().map(|i| i.data.clone())
    }

    pub fn stat_of(&self, path: &str) -> Option<FileStat> {
        let state = self.state.lock();
        let ino = state.resolve(path).ok()?;
        state.inode(ino).ok().map(|i| i.stat.clone())
    }

    /// Number of backend handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Make every call to `op` fail with `errno` until cleared.
    pub fn fail(&self, op: &str, errno: Errno) {
        self.state.lock().failures.insert(op.to_owned(), errno);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Hook calls so far, as `"op arg"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Record a call and run `f` unless a failure is armed for `op`.
    fn with<T>(&self, op: &str, arg: &str, f: impl FnOnce(&mut FsState) -> BackendResult<T>) -> BackendResult<T> {
        let mut state = self.state.lock();
        state.calls.push(format!("{op} {arg}"));
        if let Some(errno) = state.failures.get(op) {
            return Err(*errno);
        }
        f(&mut state)
    }
}

/// Path-addressed view of a [`MemoryFs`].
///
/// By default every path hook except the legacy getdir is advertised.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    fs: Arc<MemoryFs>,
    hooks: BackendHooks,
}

impl MemoryBackend {
    pub fn new(fs: Arc<MemoryFs>) -> Self {
        Self {
            fs,
            hooks: BackendHooks::all() - BackendHooks::GETDIR - BackendHooks::LOOKUP - BackendHooks::SETATTR,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: BackendHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn without(mut self, hooks: BackendHooks) -> Self {
        self.hooks -= hooks;
        self
    }

    pub fn fs(&self) -> &Arc<MemoryFs> {
        &self.fs
    }
}

impl PathBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memfs"
    }

    fn hooks(&self) -> BackendHooks {
        self.hooks
    }

    fn getattr(&self, path: &str) -> BackendResult<FileStat> {
        self.fs.with("getattr", path, |s| {
            let ino = s.resolve(path)?;
            Ok(s.inode(ino)?.stat.clone())
        })
    }

    fn access(&self, path: &str, _mask: i32) -> BackendResult<()> {
        self.fs.with("access", path, |s| s.resolve(path).map(|_| ()))
    }

    fn readlink(&self, path: &str) -> BackendResult<String> {
        self.fs.with("readlink", path, |s| {
            let inode = s.inode(s.resolve(path)?)?;
            if inode.stat.node_type() != NodeType::Symlink {
                return Err(Errno::EINVAL);
            }
            Ok(inode.link_target.clone())
        })
    }

    fn create(&self, path: &str, mode: u32, _flags: i32) -> BackendResult<u64> {
        self.fs.with("create", path, |s| {
            let (parent, name) = s.resolve_parent(path)?;
            let stat = s.add_node(parent, name, NodeType::File, mode)?;
            s.open(stat.ino)
        })
    }

    fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()> {
        self.fs.with("mkdir", path, |s| {
            let (parent, name) = s.resolve_parent(path)?;
            s.add_node(parent, name, NodeType::Directory, mode).map(|_| ())
        })
    }

    fn unlink(&self, path: &str) -> BackendResult<()> {
        self.fs.with("unlink", path, |s| {
            let (parent, name) = s.resolve_parent(path)?;
            s.remove(parent, name, false)
        })
    }

    fn rmdir(&self, path: &str) -> BackendResult<()> {
        self.fs.with("rmdir", path, |s| {
            let (parent, name) = s.resolve_parent(path)?;
            s.remove(parent, name, true)
        })
    }

    fn symlink(&self, target: &str, path: &str) -> BackendResult<()> {
        self.fs.with("symlink", path, |s| {
            let (parent, name) = s.resolve_parent(path)?;
            let stat = s.add_node(parent, name, NodeType::Symlink, 0o777)?;
            let inode = s.inode_mut(stat.ino)?;
            inode.link_target = target.to_owned();
            inode.stat.size = target.len() as u64;
            Ok(())
        })
    }

    fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        self.fs.with("rename", &format!("{from} {to}"), |s| {
            let (parent, name) = s.resolve_parent(from)?;
            let (new_parent, new_name) = s.resolve_parent(to)?;
            s.rename(parent, name, new_parent, new_name)
        })
    }

    fn link(&self, from: &str, to: &str) -> BackendResult<()> {
        self.fs.with("link", &format!("{from} {to}"), |s| {
            let ino = s.resolve(from)?;
            let (new_parent, new_name) = s.resolve_parent(to)?;
            s.link(ino, new_parent, new_name).map(|_| ())
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> BackendResult<()> {
        self.fs.with("chmod", path, |s| {
            let ino = s.resolve(path)?;
            let attr = FileStat {
                mode,
                ..FileStat::default()
            };
            s.setattr(ino, &attr, StatFields::MODE).map(|_| ())
        })
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> BackendResult<()> {
        self.fs.with("chown", path, |s| {
            let ino = s.resolve(path)?;
            let mut fields = StatFields::empty();
            fields.set(StatFields::UID, uid.is_some());
            fields.set(StatFields::GID, gid.is_some());
            let attr = FileStat {
                uid: uid.unwrap_or(0),
                gid: gid.unwrap_or(0),
                ..FileStat::default()
            };
            s.setattr(ino, &attr, fields).map(|_| ())
        })
    }

    fn truncate(&self, path: &str, size: u64) -> BackendResult<()> {
        self.fs.with("truncate", &format!("{path} {size}"), |s| {
            let ino = s.resolve(path)?;
            s.set_size(ino, size)
        })
    }

    fn ftruncate(&self, path: &str, fh: u64, size: u64) -> BackendResult<()> {
        self.fs.with("ftruncate", &format!("{path} {size}"), |s| {
            let ino = s.open.get(&fh).copied().ok_or(Errno::EBADF)?;
            s.set_size(ino, size)
        })
    }

    fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()> {
        self.fs.with("utimens", path, |s| {
            let ino = s.resolve(path)?;
            let attr = FileStat {
                atime,
                mtime,
                ..FileStat::default()
            };
            s.setattr(ino, &attr, StatFields::ATIME | StatFields::MTIME)
                .map(|_| ())
        })
    }

    fn open(&self, path: &str, _flags: i32) -> BackendResult<u64> {
        self.fs.with("open", path, |s| {
            let ino = s.resolve(path)?;
            s.open(ino)
        })
    }

    fn read(&self, path: &str, fh: u64, offset: u64, size: usize) -> BackendResult<Vec<u8>> {
        self.fs.with("read", path, |s| {
            let ino = s.open.get(&fh).copied().ok_or(Errno::EBADF)?;
            s.read(ino, offset, size)
        })
    }

    fn write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> BackendResult<usize> {
        self.fs.with("write", path, |s| {
            let ino = s.open.get(&fh).copied().ok_or(Errno::EBADF)?;
            s.write(ino, offset, data)
        })
    }

    fn flush(&self, path: &str, fh: u64) -> BackendResult<()> {
        self.fs.with("flush", path, |s| {
            s.open.get(&fh).map(|_| ()).ok_or(Errno::EBADF)
        })
    }

    fn release(&self, path: &str, fh: u64) -> BackendResult<()> {
        self.fs.with("release", path, |s| s.release(fh))
    }

    fn fsync(&self, path: &str, fh: u64, _datasync: bool) -> BackendResult<()> {
        self.fs.with("fsync", path, |s| {
            s.open.get(&fh).map(|_| ()).ok_or(Errno::EBADF)
        })
    }

    fn opendir(&self, path: &str) -> BackendResult<u64> {
        self.fs.with("opendir", path, |s| {
            let ino = s.resolve(path)?;
            s.dir(ino)?;
            s.open(ino)
        })
    }

    fn readdir(&self, path: &str, _fh: u64) -> BackendResult<Vec<BackendDirEntry>> {
        self.fs.with("readdir", path, |s| s.readdir(s.resolve(path)?))
    }

    fn getdir(&self, path: &str) -> BackendResult<Vec<BackendDirEntry>> {
        self.fs.with("getdir", path, |s| s.readdir(s.resolve(path)?))
    }

    fn releasedir(&self, path: &str, fh: u64) -> BackendResult<()> {
        self.fs.with("releasedir", path, |s| s.release(fh))
    }

    fn statfs(&self, path: &str) -> BackendResult<StatVfs> {
        self.fs.with("statfs", path, |s| Ok(s.statfs()))
    }

    fn listxattr(&self, path: &str, size: usize) -> BackendResult<XattrReply> {
        self.fs.with("listxattr", &format!("{path} {size}"), |s| {
            s.listxattr(s.resolve(path)?, size)
        })
    }

    fn getxattr(&self, path: &str, name: &str, size: usize) -> BackendResult<XattrReply> {
        self.fs.with("getxattr", &format!("{path} {name} {size}"), |s| {
            s.getxattr(s.resolve(path)?, name, size)
        })
    }
}

/// Inode-addressed view of a [`MemoryFs`].
#[derive(Debug, Clone)]
pub struct MemoryLowlevelBackend {
    fs: Arc<MemoryFs>,
    hooks: BackendHooks,
    threaded: bool,
}

impl MemoryLowlevelBackend {
    pub fn new(fs: Arc<MemoryFs>) -> Self {
        Self {
            fs,
            hooks: BackendHooks::all()
                - BackendHooks::GETDIR
                - BackendHooks::CHMOD
                - BackendHooks::CHOWN
                - BackendHooks::TRUNCATE
                - BackendHooks::FTRUNCATE
                - BackendHooks::UTIMENS,
            threaded: false,
        }
    }

    /// Answer every request from a freshly spawned thread.
    #[must_use]
    pub fn replying_from_thread(mut self) -> Self {
        self.threaded = true;
        self
    }

    #[must_use]
    pub fn without(mut self, hooks: BackendHooks) -> Self {
        self.hooks -= hooks;
        self
    }

    fn answer(&self, reply: ReplyToken, f: impl FnOnce(&MemoryFs, &ReplyToken) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        if self.threaded {
            std::thread::spawn(move || f(&fs, &reply));
        } else {
            f(&fs, &reply);
        }
    }
}

fn reply_with<T>(reply: &ReplyToken, result: BackendResult<T>, ok: impl FnOnce(&ReplyToken, T)) {
    match result {
        Ok(value) => ok(reply, value),
        Err(errno) => reply.reply_err(errno),
    }
}

impl LowlevelBackend for MemoryLowlevelBackend {
    fn name(&self) -> &str {
        "memfs-ll"
    }

    fn hooks(&self) -> BackendHooks {
        self.hooks
    }

    fn getattr(&self, ino: NodeId, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("getattr", &ino.to_string(), |s| Ok(s.inode(ino)?.stat.clone()));
            reply_with(r, result, |r, stat| r.reply_attr(stat));
        });
    }

    fn lookup(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("lookup", &name, |s| {
                let ino = s.lookup(parent, &name)?;
                Ok(s.inode(ino)?.stat.clone())
            });
            reply_with(r, result, |r, stat| r.reply_entry(stat));
        });
    }

    fn access(&self, ino: NodeId, _mask: i32, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("access", &ino.to_string(), |s| s.inode(ino).map(|_| ()));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn readlink(&self, ino: NodeId, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("readlink", &ino.to_string(), |s| {
                Ok(s.inode(ino)?.link_target.clone())
            });
            reply_with(r, result, |r, target| r.reply_link(target));
        });
    }

    fn create(&self, parent: NodeId, name: &str, mode: u32, _flags: i32, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("create", &name, |s| {
                let stat = s.add_node(parent, &name, NodeType::File, mode)?;
                let fh = s.open(stat.ino)?;
                Ok((stat, fh))
            });
            reply_with(r, result, |r, (stat, fh)| r.reply_create(stat, fh));
        });
    }

    fn mkdir(&self, parent: NodeId, name: &str, mode: u32, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("mkdir", &name, |s| {
                s.add_node(parent, &name, NodeType::Directory, mode)
            });
            reply_with(r, result, |r, stat| r.reply_entry(stat));
        });
    }

    fn unlink(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("unlink", &name, |s| s.remove(parent, &name, false));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn rmdir(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("rmdir", &name, |s| s.remove(parent, &name, true));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn symlink(&self, target: &str, parent: NodeId, name: &str, reply: ReplyToken) {
        let target = target.to_owned();
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("symlink", &name, |s| {
                let stat = s.add_node(parent, &name, NodeType::Symlink, 0o777)?;
                let inode = s.inode_mut(stat.ino)?;
                inode.link_target.clone_from(&target);
                inode.stat.size = target.len() as u64;
                Ok(inode.stat.clone())
            });
            reply_with(r, result, |r, stat| r.reply_entry(stat));
        });
    }

    fn rename(&self, parent: NodeId, name: &str, new_parent: NodeId, new_name: &str, reply: ReplyToken) {
        let name = name.to_owned();
        let new_name = new_name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("rename", &format!("{name} {new_name}"), |s| {
                s.rename(parent, &name, new_parent, &new_name)
            });
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn link(&self, ino: NodeId, new_parent: NodeId, new_name: &str, reply: ReplyToken) {
        let new_name = new_name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("link", &new_name, |s| s.link(ino, new_parent, &new_name));
            reply_with(r, result, |r, stat| r.reply_entry(stat));
        });
    }

    fn setattr(&self, ino: NodeId, attr: &FileStat, fields: StatFields, reply: ReplyToken) {
        let attr = attr.clone();
        self.answer(reply, move |fs, r| {
            let result = fs.with("setattr", &ino.to_string(), |s| s.setattr(ino, &attr, fields));
            reply_with(r, result, |r, stat| r.reply_attr(stat));
        });
    }

    fn open(&self, ino: NodeId, _flags: i32, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("open", &ino.to_string(), |s| s.open(ino));
            reply_with(r, result, |r, fh| r.reply_open(fh));
        });
    }

    fn read(&self, ino: NodeId, _fh: u64, offset: u64, size: usize, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("read", &ino.to_string(), |s| s.read(ino, offset, size));
            reply_with(r, result, |r, data| r.reply_buffer(data));
        });
    }

    fn write(&self, ino: NodeId, _fh: u64, offset: u64, data: &[u8], reply: ReplyToken) {
        let data = data.to_vec();
        self.answer(reply, move |fs, r| {
            let result = fs.with("write", &ino.to_string(), |s| s.write(ino, offset, &data));
            reply_with(r, result, |r, n| r.reply_written(n));
        });
    }

    fn flush(&self, ino: NodeId, _fh: u64, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("flush", &ino.to_string(), |_| Ok(()));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn release(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("release", &ino.to_string(), |s| s.release(fh));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn fsync(&self, ino: NodeId, _fh: u64, _datasync: bool, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("fsync", &ino.to_string(), |_| Ok(()));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn opendir(&self, ino: NodeId, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("opendir", &ino.to_string(), |s| {
                s.dir(ino)?;
                s.open(ino)
            });
            reply_with(r, result, |r, fh| r.reply_open(fh));
        });
    }

    fn readdir(&self, ino: NodeId, _fh: u64, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("readdir", &ino.to_string(), |s| s.readdir(ino));
            reply_with(r, result, |r, entries| r.reply_entries(entries));
        });
    }

    fn releasedir(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("releasedir", &ino.to_string(), |s| s.release(fh));
            reply_with(r, result, |r, ()| r.reply_none());
        });
    }

    fn statfs(&self, ino: NodeId, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("statfs", &ino.to_string(), |s| Ok(s.statfs()));
            reply_with(r, result, |r, st| r.reply_statfs(st));
        });
    }

    fn listxattr(&self, ino: NodeId, size: usize, reply: ReplyToken) {
        self.answer(reply, move |fs, r| {
            let result = fs.with("listxattr", &format!("{ino} {size}"), |s| s.listxattr(ino, size));
            reply_with(r, result, |r, x| r.reply_xattr(x));
        });
    }

    fn getxattr(&self, ino: NodeId, name: &str, size: usize, reply: ReplyToken) {
        let name = name.to_owned();
        self.answer(reply, move |fs, r| {
            let result = fs.with("getxattr", &format!("{ino} {name} {size}"), |s| {
                s.getxattr(ino, &name, size)
            });
            reply_with(r, result, |r, x| r.reply_xattr(x));
        });
    }
}
