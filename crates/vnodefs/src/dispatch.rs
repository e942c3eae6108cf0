//! Uniform blocking call surface over both backend flavours.
//!
//! The volume addresses backend objects through [`Target`] (an existing
//! object) and [`ChildTarget`] (a name inside a directory). For path
//! backends those carry a built path; for lowlevel backends they carry node
//! ids and every call goes through the [`RequestBridge`].

use crate::backend::{BackendDirEntry, BackendHooks, LowlevelBackend, PathBackend, XattrReply};
use crate::error::{Errno, FsError, FsResult};
use crate::graph::Tables;
use crate::request_bridge::{BridgeStats, ReplyKind, ReplyPayload, ReplyToken, RequestBridge};
use crate::types::{FileStat, NodeId, StatFields, StatVfs, Timespec};
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use vnodefs_mount::VolumeStats;

/// A backend handed to the volume.
pub enum Backend {
    Path(Box<dyn PathBackend>),
    Lowlevel(Box<dyn LowlevelBackend>),
}

impl Backend {
    pub fn path(backend: impl PathBackend + 'static) -> Self {
        Backend::Path(Box::new(backend))
    }

    pub fn lowlevel(backend: impl LowlevelBackend + 'static) -> Self {
        Backend::Lowlevel(Box::new(backend))
    }

    pub fn is_lowlevel(&self) -> bool {
        matches!(self, Backend::Lowlevel(_))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Path(b) => f.debug_tuple("Path").field(&b.name()).finish(),
            Backend::Lowlevel(b) => f.debug_tuple("Lowlevel").field(&b.name()).finish(),
        }
    }
}

/// An existing backend object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Path(String),
    Node(NodeId),
}

/// A name inside a backend directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildTarget {
    Path(String),
    Child { parent: NodeId, name: String },
}

/// Result of a create call. Lowlevel backends report the new attributes.
#[derive(Debug, Clone)]
pub struct Created {
    pub stat: Option<FileStat>,
    pub fh: u64,
}

/// Call surface used by the resolver, the directory cache and the volume.
#[derive(Debug)]
pub struct Dispatch {
    backend: Backend,
    bridge: RequestBridge,
    stats: Arc<VolumeStats>,
}

fn path_of(target: &Target) -> FsResult<&str> {
    match target {
        Target::Path(path) => Ok(path),
        Target::Node(_) => Err(FsError::BadData),
    }
}

fn ino_of(target: &Target) -> FsResult<NodeId> {
    match target {
        Target::Node(id) => Ok(*id),
        Target::Path(_) => Err(FsError::BadData),
    }
}

fn child_path(target: &ChildTarget) -> FsResult<&str> {
    match target {
        ChildTarget::Path(path) => Ok(path),
        ChildTarget::Child { .. } => Err(FsError::BadData),
    }
}

fn child_of(target: &ChildTarget) -> FsResult<(NodeId, &str)> {
    match target {
        ChildTarget::Child { parent, name } => Ok((*parent, name)),
        ChildTarget::Path(_) => Err(FsError::BadData),
    }
}

fn expect_none(payload: ReplyPayload) -> Option<()> {
    matches!(payload, ReplyPayload::None | ReplyPayload::Entry(_)).then_some(())
}

impl Dispatch {
    pub fn new(backend: Backend, stats: Arc<VolumeStats>) -> Self {
        Self {
            backend,
            bridge: RequestBridge::new(),
            stats,
        }
    }

    pub fn is_lowlevel(&self) -> bool {
        self.backend.is_lowlevel()
    }

    pub fn name(&self) -> &str {
        match &self.backend {
            Backend::Path(b) => b.name(),
            Backend::Lowlevel(b) => b.name(),
        }
    }

    pub fn hooks(&self) -> BackendHooks {
        match &self.backend {
            Backend::Path(b) => b.hooks(),
            Backend::Lowlevel(b) => b.hooks(),
        }
    }

    pub fn bridge_stats(&self) -> &BridgeStats {
        self.bridge.stats()
    }

    /// Root object of the backend.
    pub fn root_target(&self) -> Target {
        match &self.backend {
            Backend::Path(_) => Target::Path("/".to_owned()),
            Backend::Lowlevel(b) => Target::Node(b.root_id()),
        }
    }

    /// Address an existing node. Path backends need the table lock held to
    /// build the path.
    pub fn target(&self, tables: &Tables, id: NodeId) -> FsResult<Target> {
        match &self.backend {
            Backend::Path(_) => tables.build_path(id).map(Target::Path),
            Backend::Lowlevel(_) => Ok(Target::Node(id)),
        }
    }

    pub fn child_target(&self, tables: &Tables, dir: NodeId, name: &str) -> FsResult<ChildTarget> {
        match &self.backend {
            Backend::Path(_) => tables.build_child_path(dir, name).map(ChildTarget::Path),
            Backend::Lowlevel(_) => Ok(ChildTarget::Child {
                parent: dir,
                name: name.to_owned(),
            }),
        }
    }

    fn track<T>(&self, op: &'static str, result: FsResult<T>) -> FsResult<T> {
        self.stats.record_backend_call();
        if let Err(err) = &result {
            if err.backend_errno().is_some() {
                self.stats.record_backend_error();
            }
            trace!(op, error = %err, "backend call failed");
        }
        result
    }

    fn bridged<T>(
        &self,
        kind: ReplyKind,
        hook: impl FnOnce(ReplyToken),
        extract: impl FnOnce(ReplyPayload) -> Option<T>,
    ) -> FsResult<T> {
        let payload = self.bridge.call(kind, hook)?;
        extract(payload).ok_or(FsError::BadData)
    }

    pub fn getattr(&self, target: &Target) -> FsResult<FileStat> {
        let result = match &self.backend {
            Backend::Path(b) => b.getattr(path_of(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Attr, |t| b.getattr(ino, t), |p| match p {
                    ReplyPayload::Attr(stat) => Some(stat),
                    _ => None,
                })
            }
        };
        self.track("getattr", result)
    }

    /// Attributes of a name inside a directory.
    pub fn lookup(&self, target: &ChildTarget) -> FsResult<FileStat> {
        let result = match &self.backend {
            Backend::Path(b) => b.getattr(child_path(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(ReplyKind::Entry, |t| b.lookup(parent, name, t), |p| match p {
                    ReplyPayload::Entry(stat) => Some(stat),
                    _ => None,
                })
            }
        };
        self.track("lookup", result)
    }

    pub fn access(&self, target: &Target, mask: i32) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.access(path_of(target)?, mask).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::None, |t| b.access(ino, mask, t), expect_none)
            }
        };
        self.track("access", result)
    }

    pub fn readlink(&self, target: &Target) -> FsResult<String> {
        let result = match &self.backend {
            Backend::Path(b) => b.readlink(path_of(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Link, |t| b.readlink(ino, t), |p| match p {
                    ReplyPayload::Link(link) => Some(link),
                    _ => None,
                })
            }
        };
        self.track("readlink", result)
    }

    pub fn create(&self, target: &ChildTarget, mode: u32, flags: i32) -> FsResult<Created> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .create(child_path(target)?, mode, flags)
                .map(|fh| Created { stat: None, fh })
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(
                    ReplyKind::Create,
                    |t| b.create(parent, name, mode, flags, t),
                    |p| match p {
                        ReplyPayload::Create { stat, fh } => Some(Created {
                            stat: Some(stat),
                            fh,
                        }),
                        _ => None,
                    },
                )
            }
        };
        self.track("create", result)
    }

    pub fn mkdir(&self, target: &ChildTarget, mode: u32) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.mkdir(child_path(target)?, mode).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(ReplyKind::Entry, |t| b.mkdir(parent, name, mode, t), expect_none)
            }
        };
        self.track("mkdir", result)
    }

    pub fn unlink(&self, target: &ChildTarget) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.unlink(child_path(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(ReplyKind::None, |t| b.unlink(parent, name, t), expect_none)
            }
        };
        self.track("unlink", result)
    }

    pub fn rmdir(&self, target: &ChildTarget) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.rmdir(child_path(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(ReplyKind::None, |t| b.rmdir(parent, name, t), expect_none)
            }
        };
        self.track("rmdir", result)
    }

    pub fn symlink(&self, link_target: &str, target: &ChildTarget) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .symlink(link_target, child_path(target)?)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(target)?;
                self.bridged(
                    ReplyKind::Entry,
                    |t| b.symlink(link_target, parent, name, t),
                    expect_none,
                )
            }
        };
        self.track("symlink", result)
    }

    pub fn rename(&self, from: &ChildTarget, to: &ChildTarget) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .rename(child_path(from)?, child_path(to)?)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let (parent, name) = child_of(from)?;
                let (new_parent, new_name) = child_of(to)?;
                self.bridged(
                    ReplyKind::None,
                    |t| b.rename(parent, name, new_parent, new_name, t),
                    expect_none,
                )
            }
        };
        self.track("rename", result)
    }

    /// Create a hard link to `existing` under `to`.
    pub fn link(&self, existing: &Target, to: &ChildTarget) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .link(path_of(existing)?, child_path(to)?)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(existing)?;
                let (new_parent, new_name) = child_of(to)?;
                self.bridged(
                    ReplyKind::Entry,
                    |t| b.link(ino, new_parent, new_name, t),
                    expect_none,
                )
            }
        };
        self.track("link", result)
    }

    /// Apply the selected attribute fields.
    ///
    /// Path backends get one call per attribute group. A time update that
    /// sets only one of atime/mtime fetches the other from a fresh getattr,
    /// since utimens always sets both.
    pub fn write_stat(&self, target: &Target, stat: &FileStat, fields: StatFields) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => {
                let path = path_of(target)?;
                write_stat_by_path(b.as_ref(), path, stat, fields).map_err(FsError::from)
            }
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(
                    ReplyKind::Attr,
                    |t| b.setattr(ino, stat, fields, t),
                    |p| matches!(p, ReplyPayload::Attr(_)).then_some(()),
                )
            }
        };
        self.track("write_stat", result)
    }

    /// Truncate a freshly opened file to zero length.
    pub fn truncate_open(&self, target: &Target, fh: u64) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => {
                let path = path_of(target)?;
                match b.ftruncate(path, fh, 0) {
                    Err(Errno::ENOSYS) => b.truncate(path, 0),
                    other => other,
                }
                .map_err(FsError::from)
            }
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                let attr = FileStat::default();
                self.bridged(
                    ReplyKind::Attr,
                    |t| b.setattr(ino, &attr, StatFields::SIZE, t),
                    |p| matches!(p, ReplyPayload::Attr(_)).then_some(()),
                )
            }
        };
        self.track("truncate", result)
    }

    pub fn open(&self, target: &Target, flags: i32) -> FsResult<u64> {
        let result = match &self.backend {
            Backend::Path(b) => b.open(path_of(target)?, flags).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Open, |t| b.open(ino, flags, t), |p| match p {
                    ReplyPayload::Open { fh } => Some(fh),
                    _ => None,
                })
            }
        };
        self.track("open", result)
    }

    pub fn read(&self, target: &Target, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .read(path_of(target)?, fh, offset, size)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(
                    ReplyKind::Buffer,
                    |t| b.read(ino, fh, offset, size, t),
                    |p| match p {
                        ReplyPayload::Buffer(data) => Some(data),
                        _ => None,
                    },
                )
            }
        };
        self.track("read", result)
    }

    pub fn write(&self, target: &Target, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .write(path_of(target)?, fh, offset, data)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(
                    ReplyKind::Written,
                    |t| b.write(ino, fh, offset, data, t),
                    |p| match p {
                        ReplyPayload::Written(count) => Some(count),
                        _ => None,
                    },
                )
            }
        };
        self.track("write", result)
    }

    pub fn flush(&self, target: &Target, fh: u64) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.flush(path_of(target)?, fh).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::None, |t| b.flush(ino, fh, t), expect_none)
            }
        };
        self.track("flush", result)
    }

    pub fn release(&self, target: &Target, fh: u64) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.release(path_of(target)?, fh).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::None, |t| b.release(ino, fh, t), expect_none)
            }
        };
        self.track("release", result)
    }

    pub fn fsync(&self, target: &Target, fh: u64, datasync: bool) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .fsync(path_of(target)?, fh, datasync)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::None, |t| b.fsync(ino, fh, datasync, t), expect_none)
            }
        };
        self.track("fsync", result)
    }

    pub fn opendir(&self, target: &Target) -> FsResult<u64> {
        let result = match &self.backend {
            Backend::Path(b) => b.opendir(path_of(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Open, |t| b.opendir(ino, t), |p| match p {
                    ReplyPayload::Open { fh } => Some(fh),
                    _ => None,
                })
            }
        };
        self.track("opendir", result)
    }

    /// Full listing of a directory. `fh` is `None` for the getdir interface.
    pub fn list_dir(&self, target: &Target, fh: Option<u64>) -> FsResult<Vec<BackendDirEntry>> {
        let result = match &self.backend {
            Backend::Path(b) => {
                let path = path_of(target)?;
                match fh {
                    Some(fh) => b.readdir(path, fh),
                    None => b.getdir(path),
                }
                .map_err(FsError::from)
            }
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                let fh = fh.unwrap_or(0);
                self.bridged(ReplyKind::Entries, |t| b.readdir(ino, fh, t), |p| match p {
                    ReplyPayload::Entries(entries) => Some(entries),
                    _ => None,
                })
            }
        };
        self.track("readdir", result)
    }

    pub fn releasedir(&self, target: &Target, fh: u64) -> FsResult<()> {
        let result = match &self.backend {
            Backend::Path(b) => b.releasedir(path_of(target)?, fh).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::None, |t| b.releasedir(ino, fh, t), expect_none)
            }
        };
        self.track("releasedir", result)
    }

    pub fn statfs(&self, target: &Target) -> FsResult<StatVfs> {
        let result = match &self.backend {
            Backend::Path(b) => b.statfs(path_of(target)?).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Statfs, |t| b.statfs(ino, t), |p| match p {
                    ReplyPayload::Statfs(st) => Some(st),
                    _ => None,
                })
            }
        };
        self.track("statfs", result)
    }

    pub fn listxattr(&self, target: &Target, size: usize) -> FsResult<XattrReply> {
        let result = match &self.backend {
            Backend::Path(b) => b.listxattr(path_of(target)?, size).map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(ReplyKind::Xattr, |t| b.listxattr(ino, size, t), |p| match p {
                    ReplyPayload::Xattr(reply) => Some(reply),
                    _ => None,
                })
            }
        };
        self.track("listxattr", result)
    }

    pub fn getxattr(&self, target: &Target, name: &str, size: usize) -> FsResult<XattrReply> {
        let result = match &self.backend {
            Backend::Path(b) => b
                .getxattr(path_of(target)?, name, size)
                .map_err(FsError::from),
            Backend::Lowlevel(b) => {
                let ino = ino_of(target)?;
                self.bridged(
                    ReplyKind::Xattr,
                    |t| b.getxattr(ino, name, size, t),
                    |p| match p {
                        ReplyPayload::Xattr(reply) => Some(reply),
                        _ => None,
                    },
                )
            }
        };
        self.track("getxattr", result)
    }

    /// Complete attribute name list: ask for the size, then read.
    pub fn fetch_xattr_names(&self, target: &Target) -> FsResult<Vec<u8>> {
        fetch_sized(|size| self.listxattr(target, size))
    }

    /// Complete value of one attribute: ask for the size, then read.
    pub fn fetch_xattr(&self, target: &Target, name: &str) -> FsResult<Vec<u8>> {
        fetch_sized(|size| self.getxattr(target, name, size))
    }
}

/// Size-then-read attempts before giving up on a value that keeps growing.
const XATTR_FETCH_ATTEMPTS: usize = 4;

fn fetch_sized(mut call: impl FnMut(usize) -> FsResult<XattrReply>) -> FsResult<Vec<u8>> {
    for _ in 0..XATTR_FETCH_ATTEMPTS {
        let size = match call(0)? {
            XattrReply::Size(size) => size,
            // Ignored the size query and sent everything.
            XattrReply::Data(data) => return Ok(data),
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        match call(size) {
            Ok(XattrReply::Data(mut data)) => {
                data.truncate(size);
                return Ok(data);
            }
            Ok(XattrReply::Size(_)) => return Err(FsError::BadData),
            Err(FsError::Backend(Errno::ERANGE)) => {
                trace!(size, "attribute grew between size query and read");
            }
            Err(err) => return Err(err),
        }
    }
    Err(FsError::Backend(Errno::ERANGE))
}

fn write_stat_by_path(
    backend: &dyn PathBackend,
    path: &str,
    stat: &FileStat,
    fields: StatFields,
) -> Result<(), Errno> {
    if fields.contains(StatFields::MODE) {
        backend.chmod(path, stat.mode & 0o7777)?;
    }

    if fields.intersects(StatFields::UID | StatFields::GID) {
        let uid = fields.contains(StatFields::UID).then_some(stat.uid);
        let gid = fields.contains(StatFields::GID).then_some(stat.gid);
        backend.chown(path, uid, gid)?;
    }

    if fields.contains(StatFields::SIZE) {
        backend.truncate(path, stat.size)?;
    }

    if fields.intersects(StatFields::ATIME | StatFields::MTIME) {
        let (atime, mtime): (Timespec, Timespec) =
            if fields.contains(StatFields::ATIME | StatFields::MTIME) {
                (stat.atime, stat.mtime)
            } else {
                let current = backend.getattr(path)?;
                if fields.contains(StatFields::ATIME) {
                    (stat.atime, current.mtime)
                } else {
                    (current.atime, stat.mtime)
                }
            };
        backend.utimens(path, atime, mtime)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        no_ftruncate: bool,
    }

    impl PathBackend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn hooks(&self) -> BackendHooks {
            BackendHooks::all()
        }

        fn getattr(&self, path: &str) -> Result<FileStat, Errno> {
            self.calls.lock().push(format!("getattr {path}"));
            let mut stat = FileStat::with_type(9, NodeType::File, 0o644);
            stat.atime = Timespec::new(100, 0);
            stat.mtime = Timespec::new(200, 0);
            Ok(stat)
        }

        fn chmod(&self, path: &str, mode: u32) -> Result<(), Errno> {
            self.calls.lock().push(format!("chmod {path} {mode:o}"));
            Ok(())
        }

        fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
            self.calls.lock().push(format!("chown {path} {uid:?} {gid:?}"));
            Ok(())
        }

        fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> Result<(), Errno> {
            self.calls
                .lock()
                .push(format!("utimens {path} {} {}", atime.sec, mtime.sec));
            Ok(())
        }

        fn ftruncate(&self, path: &str, fh: u64, size: u64) -> Result<(), Errno> {
            if self.no_ftruncate {
                return Err(Errno::ENOSYS);
            }
            self.calls.lock().push(format!("ftruncate {path} {fh} {size}"));
            Ok(())
        }

        fn truncate(&self, path: &str, size: u64) -> Result<(), Errno> {
            self.calls.lock().push(format!("truncate {path} {size}"));
            Ok(())
        }

        fn unlink(&self, _path: &str) -> Result<(), Errno> {
            Err(Errno::ENOENT)
        }
    }

    fn target(path: &str) -> Target {
        Target::Path(path.to_owned())
    }

    #[test]
    fn test_write_stat_partial_times_fetch_the_other() {
        let backend = Recorder::default();
        let stat = FileStat {
            mtime: Timespec::new(999, 0),
            ..FileStat::default()
        };
        write_stat_by_path(&backend, "/f", &stat, StatFields::MTIME).unwrap();
        let calls = backend.calls.lock();
        assert_eq!(*calls, vec!["getattr /f", "utimens /f 100 999"]);
    }

    #[test]
    fn test_write_stat_chown_leaves_unset_ids() {
        let backend = Recorder::default();
        let stat = FileStat {
            uid: 1000,
            mode: 0o100_755,
            ..FileStat::default()
        };
        write_stat_by_path(&backend, "/f", &stat, StatFields::UID | StatFields::MODE).unwrap();
        let calls = backend.calls.lock();
        assert_eq!(*calls, vec!["chmod /f 755", "chown /f Some(1000) None"]);
    }

    #[test]
    fn test_truncate_falls_back_without_ftruncate() {
        let stats = Arc::new(VolumeStats::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatch = Dispatch::new(
            Backend::path(Recorder {
                calls: Arc::clone(&calls),
                no_ftruncate: true,
            }),
            Arc::clone(&stats),
        );
        dispatch.truncate_open(&target("/f"), 3).unwrap();
        assert_eq!(*calls.lock(), vec!["truncate /f 0"]);
        assert_eq!(stats.snapshot().backend_calls, 1);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatch = Dispatch::new(
            Backend::path(Recorder {
                calls: Arc::clone(&calls),
                no_ftruncate: false,
            }),
            Arc::clone(&stats),
        );
        dispatch.truncate_open(&target("/f"), 3).unwrap();
        assert_eq!(*calls.lock(), vec!["ftruncate /f 3 0"]);
    }

    #[test]
    fn test_backend_errors_are_counted() {
        let stats = Arc::new(VolumeStats::new());
        let dispatch = Dispatch::new(Backend::path(Recorder::default()), Arc::clone(&stats));
        let err = dispatch
            .unlink(&ChildTarget::Path("/gone".into()))
            .unwrap_err();
        assert_eq!(err.backend_errno(), Some(Errno::ENOENT));
        let snap = stats.snapshot();
        assert_eq!(snap.backend_calls, 1);
        assert_eq!(snap.backend_errors, 1);
    }

    #[test]
    fn test_mismatched_target_is_bad_data() {
        let dispatch = Dispatch::new(
            Backend::path(Recorder::default()),
            Arc::new(VolumeStats::new()),
        );
        assert!(matches!(
            dispatch.getattr(&Target::Node(4)),
            Err(FsError::BadData)
        ));
        assert_eq!(dispatch.root_target(), target("/"));
    }

    #[test]
    fn test_fetch_sized_rereads_when_value_grows() {
        let mut value = b"abc".to_vec();
        let mut reads = 0;
        let fetched = fetch_sized(|size| {
            if size > 0 {
                reads += 1;
                if reads == 1 {
                    // Grows between the first size query and its read.
                    value.extend_from_slice(b"de");
                }
            }
            XattrReply::sized(value.clone(), size).map_err(FsError::from)
        })
        .unwrap();
        assert_eq!(fetched, b"abcde");
        assert_eq!(reads, 2);
    }

    #[test]
    fn test_fetch_sized_empty_and_errors() {
        assert!(fetch_sized(|_| Ok(XattrReply::Size(0))).unwrap().is_empty());
        assert!(matches!(
            fetch_sized(|_| Err(FsError::Backend(Errno::ENODATA))),
            Err(FsError::Backend(Errno::ENODATA))
        ));
        let mut calls = 0;
        let err = fetch_sized(|size| {
            calls += 1;
            XattrReply::sized(vec![0; 8 + calls], size).map_err(FsError::from)
        })
        .unwrap_err();
        assert_eq!(err.backend_errno(), Some(Errno::ERANGE));
        assert_eq!(calls, 2 * XATTR_FETCH_ATTEMPTS);
    }
}
