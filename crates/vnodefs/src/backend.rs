//! Backend interfaces.
//!
//! A backend is the filesystem implementation being served. It comes in two
//! flavours:
//!
//! - [`PathBackend`]: synchronous, addressed by absolute path strings.
//! - [`LowlevelBackend`]: addressed by node id, answering through a
//!   [`ReplyToken`] instead of a return value.
//!
//! Every hook is optional. Unimplemented hooks fall back to `ENOSYS`, and a
//! backend advertises what it really implements through [`BackendHooks`].
//! The volume derives its [`VolumeCapabilities`] from that set at
//! construction.

use crate::error::{BackendResult, Errno};
use crate::request_bridge::ReplyToken;
use crate::types::{FileStat, NodeId, NodeType, StatFields, StatVfs, Timespec};
use bitflags::bitflags;

/// One name reported by a backend directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDirEntry {
    pub name: String,
    /// Backend id, if the backend reports one.
    pub ino: Option<u64>,
    /// `NodeType::Unknown` makes the volume stat the entry to learn its type.
    pub node_type: NodeType,
}

impl BackendDirEntry {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            ino: None,
            node_type,
        }
    }

    #[must_use]
    pub fn with_ino(mut self, ino: u64) -> Self {
        self.ino = Some(ino);
        self
    }
}

/// Answer of an extended attribute hook, sized the way listxattr(2) and
/// getxattr(2) are: a zero `size` asks for the required length only, and a
/// buffer too small for the data fails with `ERANGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    Size(usize),
    Data(Vec<u8>),
}

impl XattrReply {
    /// Answer a sized request from the complete value.
    pub fn sized(value: Vec<u8>, size: usize) -> Result<Self, Errno> {
        if size == 0 {
            Ok(XattrReply::Size(value.len()))
        } else if value.len() > size {
            Err(Errno::ERANGE)
        } else {
            Ok(XattrReply::Data(value))
        }
    }
}

bitflags! {
    /// Hooks a backend actually implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackendHooks: u32 {
        const GETATTR = 1 << 0;
        const LOOKUP = 1 << 1;
        const ACCESS = 1 << 2;
        const READLINK = 1 << 3;
        const CREATE = 1 << 4;
        const MKDIR = 1 << 5;
        const UNLINK = 1 << 6;
        const RMDIR = 1 << 7;
        const SYMLINK = 1 << 8;
        const RENAME = 1 << 9;
        const LINK = 1 << 10;
        const CHMOD = 1 << 11;
        const CHOWN = 1 << 12;
        const TRUNCATE = 1 << 13;
        const FTRUNCATE = 1 << 14;
        const UTIMENS = 1 << 15;
        const SETATTR = 1 << 16;
        const OPEN = 1 << 17;
        const READ = 1 << 18;
        const WRITE = 1 << 19;
        const FLUSH = 1 << 20;
        const RELEASE = 1 << 21;
        const FSYNC = 1 << 22;
        const OPENDIR = 1 << 23;
        const READDIR = 1 << 24;
        const GETDIR = 1 << 25;
        const RELEASEDIR = 1 << 26;
        const STATFS = 1 << 27;
        const LISTXATTR = 1 << 28;
        const GETXATTR = 1 << 29;
    }
}

bitflags! {
    /// Volume operations the kernel may call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VolumeCapabilities: u32 {
        const READ_STAT = 1 << 0;
        const WRITE_STAT = 1 << 1;
        const ACCESS = 1 << 2;
        const READ_SYMLINK = 1 << 3;
        const CREATE_SYMLINK = 1 << 4;
        const LINK = 1 << 5;
        const UNLINK = 1 << 6;
        const RENAME = 1 << 7;
        const CREATE = 1 << 8;
        const OPEN = 1 << 9;
        const READ = 1 << 10;
        const WRITE = 1 << 11;
        const FSYNC = 1 << 12;
        const CREATE_DIR = 1 << 13;
        const REMOVE_DIR = 1 << 14;
        const OPEN_DIR = 1 << 15;
        const READ_DIR = 1 << 16;
        const READ_FS_INFO = 1 << 17;
        /// Attribute directories: open, read, rewind, close.
        const ATTR_DIR = 1 << 18;
        /// Read-only access to single attributes.
        const READ_ATTR = 1 << 19;
    }
}

/// How directory listings are obtained from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirInterface {
    /// opendir/readdir/releasedir. `opendir: false` means readdir exists
    /// without opendir and opening a directory is a no-op.
    ReadDir { opendir: bool },
    /// Legacy one-shot getdir; no open or release.
    GetDir,
    Unsupported,
}

impl DirInterface {
    pub fn from_hooks(hooks: BackendHooks) -> Self {
        if hooks.contains(BackendHooks::READDIR) {
            DirInterface::ReadDir {
                opendir: hooks.contains(BackendHooks::OPENDIR),
            }
        } else if hooks.contains(BackendHooks::GETDIR) {
            DirInterface::GetDir
        } else {
            DirInterface::Unsupported
        }
    }
}

impl VolumeCapabilities {
    /// Derive what the volume can offer from what the backend implements.
    pub fn from_hooks(hooks: BackendHooks, lowlevel: bool) -> Self {
        let pairs = [
            (BackendHooks::GETATTR, VolumeCapabilities::READ_STAT),
            (BackendHooks::ACCESS, VolumeCapabilities::ACCESS),
            (BackendHooks::READLINK, VolumeCapabilities::READ_SYMLINK),
            (BackendHooks::SYMLINK, VolumeCapabilities::CREATE_SYMLINK),
            (BackendHooks::LINK, VolumeCapabilities::LINK),
            (BackendHooks::UNLINK, VolumeCapabilities::UNLINK),
            (BackendHooks::RENAME, VolumeCapabilities::RENAME),
            (BackendHooks::CREATE, VolumeCapabilities::CREATE),
            (BackendHooks::OPEN, VolumeCapabilities::OPEN),
            (BackendHooks::READ, VolumeCapabilities::READ),
            (BackendHooks::WRITE, VolumeCapabilities::WRITE),
            (BackendHooks::MKDIR, VolumeCapabilities::CREATE_DIR),
            (BackendHooks::RMDIR, VolumeCapabilities::REMOVE_DIR),
            (BackendHooks::STATFS, VolumeCapabilities::READ_FS_INFO),
            (BackendHooks::LISTXATTR, VolumeCapabilities::ATTR_DIR),
            (BackendHooks::GETXATTR, VolumeCapabilities::READ_ATTR),
        ];
        let mut caps = VolumeCapabilities::empty();
        for (hook, cap) in pairs {
            if hooks.contains(hook) {
                caps |= cap;
            }
        }

        if hooks.contains(BackendHooks::OPEN | BackendHooks::FSYNC) {
            caps |= VolumeCapabilities::FSYNC;
        }

        let attr_writers = if lowlevel {
            BackendHooks::SETATTR
        } else {
            BackendHooks::CHMOD | BackendHooks::CHOWN | BackendHooks::TRUNCATE | BackendHooks::UTIMENS
        };
        if hooks.intersects(attr_writers) {
            caps |= VolumeCapabilities::WRITE_STAT;
        }

        let listing = if lowlevel {
            hooks.contains(BackendHooks::READDIR)
        } else {
            DirInterface::from_hooks(hooks) != DirInterface::Unsupported
        };
        if listing {
            caps |= VolumeCapabilities::OPEN_DIR | VolumeCapabilities::READ_DIR;
        }

        caps
    }
}

/// Synchronous, path-addressed backend.
///
/// Paths are absolute and `/`-separated; the root is `"/"`.
#[allow(unused_variables)]
pub trait PathBackend: Send + Sync {
    /// Filesystem name, used to derive the volume name.
    fn name(&self) -> &str;

    fn hooks(&self) -> BackendHooks;

    fn getattr(&self, path: &str) -> BackendResult<FileStat> {
        Err(Errno::ENOSYS)
    }

    fn access(&self, path: &str, mask: i32) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, path: &str) -> BackendResult<String> {
        Err(Errno::ENOSYS)
    }

    /// Create and open a regular file; returns the open handle.
    fn create(&self, path: &str, mode: u32, flags: i32) -> BackendResult<u64> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, path: &str) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, path: &str) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, target: &str, path: &str) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn link(&self, from: &str, to: &str) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, path: &str, mode: u32) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    /// `None` leaves the respective id unchanged.
    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, path: &str, size: u64) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn ftruncate(&self, path: &str, fh: u64, size: u64) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn open(&self, path: &str, flags: i32) -> BackendResult<u64> {
        Err(Errno::ENOSYS)
    }

    fn read(&self, path: &str, fh: u64, offset: u64, size: usize) -> BackendResult<Vec<u8>> {
        Err(Errno::ENOSYS)
    }

    fn write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> BackendResult<usize> {
        Err(Errno::ENOSYS)
    }

    fn flush(&self, path: &str, fh: u64) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn release(&self, path: &str, fh: u64) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn opendir(&self, path: &str) -> BackendResult<u64> {
        Err(Errno::ENOSYS)
    }

    fn readdir(&self, path: &str, fh: u64) -> BackendResult<Vec<BackendDirEntry>> {
        Err(Errno::ENOSYS)
    }

    /// Legacy listing interface without open/release.
    fn getdir(&self, path: &str) -> BackendResult<Vec<BackendDirEntry>> {
        Err(Errno::ENOSYS)
    }

    fn releasedir(&self, path: &str, fh: u64) -> BackendResult<()> {
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, path: &str) -> BackendResult<StatVfs> {
        Err(Errno::ENOSYS)
    }

    /// Extended attribute names, each followed by a NUL byte.
    fn listxattr(&self, path: &str, size: usize) -> BackendResult<XattrReply> {
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, path: &str, name: &str, size: usize) -> BackendResult<XattrReply> {
        Err(Errno::ENOSYS)
    }
}

/// Id-addressed backend that answers through reply tokens.
///
/// Every hook must eventually answer its token exactly once, either before
/// returning or later from any thread. The id passed for the root is the id
/// the backend reported for `"/"` at mount.
#[allow(unused_variables)]
pub trait LowlevelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn hooks(&self) -> BackendHooks;

    /// Id of the root object, queried once at mount.
    fn root_id(&self) -> NodeId {
        crate::types::ROOT_NODE_ID
    }

    /// Reply with `reply_attr`.
    fn getattr(&self, ino: NodeId, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_entry`.
    fn lookup(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn access(&self, ino: NodeId, mask: i32, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_link`.
    fn readlink(&self, ino: NodeId, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_create`.
    fn create(&self, parent: NodeId, name: &str, mode: u32, flags: i32, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_entry`.
    fn mkdir(&self, parent: NodeId, name: &str, mode: u32, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn unlink(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn rmdir(&self, parent: NodeId, name: &str, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_entry`.
    fn symlink(&self, target: &str, parent: NodeId, name: &str, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
        reply: ReplyToken,
    ) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_entry`.
    fn link(&self, ino: NodeId, new_parent: NodeId, new_name: &str, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Apply the fields selected by `fields`; reply with `reply_attr`.
    fn setattr(&self, ino: NodeId, attr: &FileStat, fields: StatFields, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_open`.
    fn open(&self, ino: NodeId, flags: i32, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_buffer`.
    fn read(&self, ino: NodeId, fh: u64, offset: u64, size: usize, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_written`.
    fn write(&self, ino: NodeId, fh: u64, offset: u64, data: &[u8], reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn flush(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn release(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn fsync(&self, ino: NodeId, fh: u64, datasync: bool, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_open`.
    fn opendir(&self, ino: NodeId, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_entries`, the complete listing.
    fn readdir(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    fn releasedir(&self, ino: NodeId, fh: u64, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_statfs`.
    fn statfs(&self, ino: NodeId, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_xattr`; see [`XattrReply`] for the sizing rules.
    fn listxattr(&self, ino: NodeId, size: usize, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }

    /// Reply with `reply_xattr`.
    fn getxattr(&self, ino: NodeId, name: &str, size: usize, reply: ReplyToken) {
        reply.reply_err(Errno::ENOSYS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rename_hook_means_no_rename() {
        let hooks = BackendHooks::all() - BackendHooks::RENAME;
        let caps = VolumeCapabilities::from_hooks(hooks, false);
        assert!(!caps.contains(VolumeCapabilities::RENAME));
        assert!(caps.contains(VolumeCapabilities::UNLINK));
    }

    #[test]
    fn test_readdir_without_opendir() {
        let hooks = BackendHooks::GETATTR | BackendHooks::READDIR;
        assert_eq!(
            DirInterface::from_hooks(hooks),
            DirInterface::ReadDir { opendir: false }
        );
        let caps = VolumeCapabilities::from_hooks(hooks, false);
        assert!(caps.contains(VolumeCapabilities::OPEN_DIR | VolumeCapabilities::READ_DIR));
    }

    #[test]
    fn test_getdir_only() {
        let hooks = BackendHooks::GETATTR | BackendHooks::GETDIR;
        assert_eq!(DirInterface::from_hooks(hooks), DirInterface::GetDir);
        assert!(VolumeCapabilities::from_hooks(hooks, false).contains(VolumeCapabilities::READ_DIR));
        // Lowlevel backends have no getdir interface.
        assert!(!VolumeCapabilities::from_hooks(hooks, true).contains(VolumeCapabilities::READ_DIR));
    }

    #[test]
    fn test_no_listing() {
        let hooks = BackendHooks::GETATTR;
        assert_eq!(DirInterface::from_hooks(hooks), DirInterface::Unsupported);
        let caps = VolumeCapabilities::from_hooks(hooks, false);
        assert_eq!(caps, VolumeCapabilities::READ_STAT);
    }

    #[test]
    fn test_write_stat_sources() {
        let path_caps = VolumeCapabilities::from_hooks(BackendHooks::CHMOD, false);
        assert!(path_caps.contains(VolumeCapabilities::WRITE_STAT));

        let ll_caps = VolumeCapabilities::from_hooks(BackendHooks::CHMOD, true);
        assert!(!ll_caps.contains(VolumeCapabilities::WRITE_STAT));

        let ll_caps = VolumeCapabilities::from_hooks(BackendHooks::SETATTR, true);
        assert!(ll_caps.contains(VolumeCapabilities::WRITE_STAT));
    }

    #[test]
    fn test_fsync_needs_open() {
        let caps = VolumeCapabilities::from_hooks(BackendHooks::FSYNC, false);
        assert!(!caps.contains(VolumeCapabilities::FSYNC));
        let caps = VolumeCapabilities::from_hooks(BackendHooks::FSYNC | BackendHooks::OPEN, false);
        assert!(caps.contains(VolumeCapabilities::FSYNC));
    }

    struct Bare;

    impl PathBackend for Bare {
        fn name(&self) -> &str {
            "bare"
        }

        fn hooks(&self) -> BackendHooks {
            BackendHooks::empty()
        }
    }

    #[test]
    fn test_default_hooks_return_enosys() {
        let backend = Bare;
        assert_eq!(backend.getattr("/"), Err(Errno::ENOSYS));
        assert_eq!(backend.rename("/a", "/b"), Err(Errno::ENOSYS));
        assert_eq!(backend.readdir("/", 0), Err(Errno::ENOSYS));
        assert_eq!(backend.listxattr("/", 0), Err(Errno::ENOSYS));
        assert_eq!(backend.getxattr("/", "user.x", 0), Err(Errno::ENOSYS));
    }

    #[test]
    fn test_attribute_capabilities() {
        let caps = VolumeCapabilities::from_hooks(BackendHooks::LISTXATTR, false);
        assert_eq!(caps, VolumeCapabilities::ATTR_DIR);
        let caps = VolumeCapabilities::from_hooks(BackendHooks::GETXATTR, true);
        assert_eq!(caps, VolumeCapabilities::READ_ATTR);
    }

    #[test]
    fn test_sized_xattr_reply() {
        let value = b"abc".to_vec();
        assert_eq!(XattrReply::sized(value.clone(), 0), Ok(XattrReply::Size(3)));
        assert_eq!(XattrReply::sized(value.clone(), 2), Err(Errno::ERANGE));
        assert_eq!(XattrReply::sized(value.clone(), 8), Ok(XattrReply::Data(value)));
    }
}
