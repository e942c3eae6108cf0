//! Path backend that mirrors a host directory.
//!
//! Every backend path is taken relative to the configured root. Open files
//! live in a handle table keyed by the fh handed back to the volume.

use crate::backend::{BackendDirEntry, BackendHooks, PathBackend, XattrReply};
use crate::error::{BackendResult, Errno};
use crate::types::{FileStat, NodeType, StatVfs, Timespec};
use nix::unistd::AccessFlags;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};
use vnodefs_mount::HandleTable;

fn nix_errno(err: nix::Error) -> Errno {
    Errno(err as i32)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
const XATTR_HOOKS: BackendHooks = BackendHooks::LISTXATTR.union(BackendHooks::GETXATTR);
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const XATTR_HOOKS: BackendHooks = BackendHooks::empty();

/// Attribute syscalls on the link itself. An empty buffer asks for the
/// required size.
#[cfg(target_os = "linux")]
mod host_xattr {
    use std::ffi::CStr;
    use std::io;

    fn byte_count(ret: libc::ssize_t) -> io::Result<usize> {
        usize::try_from(ret).map_err(|_| io::Error::last_os_error())
    }

    pub(super) fn list(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: path is NUL-terminated and buf is valid for buf.len() bytes.
        byte_count(unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) })
    }

    pub(super) fn get(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: as in `list`; name is NUL-terminated.
        byte_count(unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })
    }
}

#[cfg(target_os = "macos")]
mod host_xattr {
    use std::ffi::CStr;
    use std::io;

    fn byte_count(ret: libc::ssize_t) -> io::Result<usize> {
        usize::try_from(ret).map_err(|_| io::Error::last_os_error())
    }

    pub(super) fn list(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: path is NUL-terminated and buf is valid for buf.len() bytes.
        byte_count(unsafe {
            libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len(), libc::XATTR_NOFOLLOW)
        })
    }

    pub(super) fn get(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: as in `list`; name is NUL-terminated.
        byte_count(unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                libc::XATTR_NOFOLLOW,
            )
        })
    }
}

/// Shape a raw attribute syscall result the way the volume expects it.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn xattr_reply(mut buf: Vec<u8>, len: usize) -> XattrReply {
    if buf.is_empty() {
        XattrReply::Size(len)
    } else {
        buf.truncate(len);
        XattrReply::Data(buf)
    }
}

fn stat_from_metadata(meta: &fs::Metadata) -> FileStat {
    FileStat {
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        blksize: u32::try_from(meta.blksize()).unwrap_or(u32::MAX),
        blocks: meta.blocks(),
        atime: Timespec::new(meta.atime(), u32::try_from(meta.atime_nsec()).unwrap_or(0)),
        mtime: Timespec::new(meta.mtime(), u32::try_from(meta.mtime_nsec()).unwrap_or(0)),
        ctime: Timespec::new(meta.ctime(), u32::try_from(meta.ctime_nsec()).unwrap_or(0)),
    }
}

fn node_type_of(file_type: fs::FileType) -> NodeType {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_dir() {
        NodeType::Directory
    } else if file_type.is_file() {
        NodeType::File
    } else if file_type.is_symlink() {
        NodeType::Symlink
    } else if file_type.is_char_device() {
        NodeType::CharDevice
    } else if file_type.is_block_device() {
        NodeType::BlockDevice
    } else if file_type.is_fifo() {
        NodeType::Fifo
    } else if file_type.is_socket() {
        NodeType::Socket
    } else {
        NodeType::Unknown
    }
}

fn system_time(ts: Timespec) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(ts.nsec));
    match u64::try_from(ts.sec) {
        Ok(secs) => UNIX_EPOCH + Duration::from_secs(secs) + nanos,
        Err(_) => UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs()) + nanos,
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts
}

/// Serves a host directory through the path interface.
#[derive(Debug)]
pub struct PassthroughBackend {
    root: PathBuf,
    name: String,
    files: HandleTable<Arc<Mutex<File>>>,
}

impl PassthroughBackend {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("passthrough")
            .to_owned();
        debug!(root = %root.display(), "passthrough backend ready");
        Ok(Self {
            root,
            name,
            files: HandleTable::new_auto_id(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn host_cpath(&self, path: &str) -> BackendResult<CString> {
        use std::os::unix::ffi::OsStringExt;
        CString::new(self.host_path(path).into_os_string().into_vec()).map_err(|_| Errno::EINVAL)
    }

    fn file(&self, fh: u64) -> BackendResult<Arc<Mutex<File>>> {
        self.files.get_cloned(fh).ok_or(Errno::EBADF)
    }

    fn register(&self, file: File) -> u64 {
        self.files.insert_auto(Arc::new(Mutex::new(file)))
    }
}

impl PathBackend for PassthroughBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> BackendHooks {
        BackendHooks::GETATTR
            | BackendHooks::ACCESS
            | BackendHooks::READLINK
            | BackendHooks::CREATE
            | BackendHooks::MKDIR
            | BackendHooks::UNLINK
            | BackendHooks::RMDIR
            | BackendHooks::SYMLINK
            | BackendHooks::RENAME
            | BackendHooks::LINK
            | BackendHooks::CHMOD
            | BackendHooks::CHOWN
            | BackendHooks::TRUNCATE
            | BackendHooks::FTRUNCATE
            | BackendHooks::UTIMENS
            | BackendHooks::OPEN
            | BackendHooks::READ
            | BackendHooks::WRITE
            | BackendHooks::RELEASE
            | BackendHooks::FSYNC
            | BackendHooks::READDIR
            | BackendHooks::STATFS
            | XATTR_HOOKS
    }

    fn getattr(&self, path: &str) -> BackendResult<FileStat> {
        let meta = fs::symlink_metadata(self.host_path(path))?;
        Ok(stat_from_metadata(&meta))
    }

    fn access(&self, path: &str, mask: i32) -> BackendResult<()> {
        nix::unistd::access(&self.host_path(path), AccessFlags::from_bits_truncate(mask))
            .map_err(nix_errno)
    }

    fn readlink(&self, path: &str) -> BackendResult<String> {
        let target = fs::read_link(self.host_path(path))?;
        target.into_os_string().into_string().map_err(|_| Errno::EINVAL)
    }

    #[instrument(level = "trace", skip(self))]
    fn create(&self, path: &str, mode: u32, flags: i32) -> BackendResult<u64> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).mode(mode & 0o7777);
        if flags & libc::O_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        let file = opts.open(self.host_path(path))?;
        Ok(self.register(file))
    }

    fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()> {
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.host_path(path))?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> BackendResult<()> {
        Ok(fs::remove_file(self.host_path(path))?)
    }

    fn rmdir(&self, path: &str) -> BackendResult<()> {
        Ok(fs::remove_dir(self.host_path(path))?)
    }

    fn symlink(&self, target: &str, path: &str) -> BackendResult<()> {
        Ok(std::os::unix::fs::symlink(target, self.host_path(path))?)
    }

    fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        Ok(fs::rename(self.host_path(from), self.host_path(to))?)
    }

    fn link(&self, from: &str, to: &str) -> BackendResult<()> {
        Ok(fs::hard_link(self.host_path(from), self.host_path(to))?)
    }

    fn chmod(&self, path: &str, mode: u32) -> BackendResult<()> {
        Ok(fs::set_permissions(
            self.host_path(path),
            Permissions::from_mode(mode & 0o7777),
        )?)
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> BackendResult<()> {
        Ok(std::os::unix::fs::lchown(self.host_path(path), uid, gid)?)
    }

    fn truncate(&self, path: &str, size: u64) -> BackendResult<()> {
        let file = OpenOptions::new().write(true).open(self.host_path(path))?;
        Ok(file.set_len(size)?)
    }

    fn ftruncate(&self, _path: &str, fh: u64, size: u64) -> BackendResult<()> {
        Ok(self.file(fh)?.lock().set_len(size)?)
    }

    fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()> {
        let file = File::open(self.host_path(path))?;
        let times = FileTimes::new()
            .set_accessed(system_time(atime))
            .set_modified(system_time(mtime));
        Ok(file.set_times(times)?)
    }

    #[instrument(level = "trace", skip(self))]
    fn open(&self, path: &str, flags: i32) -> BackendResult<u64> {
        let file = open_options(flags).open(self.host_path(path))?;
        Ok(self.register(file))
    }

    fn read(&self, _path: &str, fh: u64, offset: u64, size: usize) -> BackendResult<Vec<u8>> {
        let file = self.file(fh)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        let file = file.lock();
        while filled < size {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, _path: &str, fh: u64, offset: u64, data: &[u8]) -> BackendResult<usize> {
        self.file(fh)?.lock().write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn release(&self, _path: &str, fh: u64) -> BackendResult<()> {
        self.files.remove(fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn fsync(&self, _path: &str, fh: u64, datasync: bool) -> BackendResult<()> {
        let file = self.file(fh)?;
        let file = file.lock();
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn readdir(&self, path: &str, _fh: u64) -> BackendResult<Vec<BackendDirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.host_path(path))? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!(?path, "skipping non-UTF-8 name");
                continue;
            };
            let node_type = entry
                .file_type()
                .map_or(NodeType::Unknown, node_type_of);
            entries.push(BackendDirEntry::new(name, node_type).with_ino(entry.ino()));
        }
        Ok(entries)
    }

    #[allow(clippy::useless_conversion)]
    fn statfs(&self, path: &str) -> BackendResult<StatVfs> {
        let st = nix::sys::statvfs::statvfs(&self.host_path(path)).map_err(nix_errno)?;
        Ok(StatVfs {
            block_size: u64::from(st.block_size()),
            fragment_size: u64::from(st.fragment_size()),
            blocks: u64::from(st.blocks()),
            blocks_free: u64::from(st.blocks_free()),
            blocks_available: u64::from(st.blocks_available()),
            files: u64::from(st.files()),
            files_free: u64::from(st.files_free()),
            name_max: u32::try_from(st.name_max()).unwrap_or(255),
        })
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn listxattr(&self, path: &str, size: usize) -> BackendResult<XattrReply> {
        let host = self.host_cpath(path)?;
        let mut buf = vec![0u8; size];
        let len = host_xattr::list(&host, &mut buf)?;
        Ok(xattr_reply(buf, len))
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn getxattr(&self, path: &str, name: &str, size: usize) -> BackendResult<XattrReply> {
        let host = self.host_cpath(path)?;
        let name = CString::new(name).map_err(|_| Errno::EINVAL)?;
        let mut buf = vec![0u8; size];
        let len = host_xattr::get(&host, &name, &mut buf)?;
        Ok(xattr_reply(buf, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (TempDir, PassthroughBackend) {
        let dir = TempDir::new().unwrap();
        let backend = PassthroughBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_rejects_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(PassthroughBackend::new(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_create_write_read() {
        let (dir, backend) = backend();
        let fh = backend.create("/a.txt", 0o644, libc::O_RDWR).unwrap();
        assert_eq!(backend.write("/a.txt", fh, 0, b"hello").unwrap(), 5);
        assert_eq!(backend.read("/a.txt", fh, 1, 10).unwrap(), b"ello");
        backend.release("/a.txt", fh).unwrap();
        assert_eq!(backend.open_files(), 0);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_getattr_reports_type_and_ino() {
        let (dir, backend) = backend();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let stat = backend.getattr("/sub").unwrap();
        assert_eq!(stat.node_type(), NodeType::Directory);
        assert_eq!(stat.ino, fs::metadata(dir.path().join("sub")).unwrap().ino());
        assert_eq!(backend.getattr("/nope").unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_readdir_lists_names_with_types() {
        let (dir, backend) = backend();
        fs::write(dir.path().join("f"), b"x").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("l")).unwrap();

        let mut entries = backend.readdir("/", 0).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.node_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("d", NodeType::Directory),
                ("f", NodeType::File),
                ("l", NodeType::Symlink),
            ]
        );
        assert!(entries.iter().all(|e| e.ino.is_some()));
    }

    #[test]
    fn test_ftruncate_through_handle() {
        let (dir, backend) = backend();
        fs::write(dir.path().join("t"), b"0123456789").unwrap();
        let fh = backend.open("/t", libc::O_RDWR).unwrap();
        backend.ftruncate("/t", fh, 4).unwrap();
        backend.release("/t", fh).unwrap();
        assert_eq!(fs::read(dir.path().join("t")).unwrap(), b"0123");
    }

    #[test]
    fn test_unknown_handle() {
        let (_dir, backend) = backend();
        assert_eq!(backend.read("/x", 99, 0, 1).unwrap_err(), Errno::EBADF);
        assert_eq!(backend.release("/x", 99).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn test_statfs_reports_blocks() {
        let (_dir, backend) = backend();
        let st = backend.statfs("/").unwrap();
        assert!(st.block_size > 0);
        assert!(st.blocks > 0);
    }

    /// Tag a host file with a user attribute; false where the filesystem
    /// has no user attributes.
    #[cfg(target_os = "linux")]
    fn tag(path: &Path, name: &str, value: &[u8]) -> bool {
        use std::os::unix::ffi::OsStrExt;
        let path = CString::new(path.as_os_str().as_bytes()).unwrap();
        let name = CString::new(name).unwrap();
        let ret = unsafe {
            libc::lsetxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0)
        };
        ret == 0
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_xattrs() {
        let (dir, backend) = backend();
        assert!(backend.hooks().contains(BackendHooks::LISTXATTR | BackendHooks::GETXATTR));
        fs::write(dir.path().join("t"), b"").unwrap();
        if !tag(&dir.path().join("t"), "user.colour", b"teal") {
            return;
        }

        let XattrReply::Size(len) = backend.listxattr("/t", 0).unwrap() else {
            panic!("size query returned data");
        };
        let XattrReply::Data(list) = backend.listxattr("/t", len).unwrap() else {
            panic!("read returned a size");
        };
        assert!(list.split(|b| *b == 0).any(|n| n == b"user.colour"));

        assert!(matches!(backend.getxattr("/t", "user.colour", 0), Ok(XattrReply::Size(4))));
        assert!(matches!(
            backend.getxattr("/t", "user.colour", 64),
            Ok(XattrReply::Data(ref v)) if v == b"teal"
        ));
        assert_eq!(backend.getxattr("/t", "user.colour", 2).unwrap_err(), Errno::ERANGE);
        assert_eq!(backend.getxattr("/t", "user.absent", 0).unwrap_err(), Errno::ENODATA);
        assert_eq!(backend.getxattr("/nope", "user.colour", 0).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_utimens_sets_mtime() {
        let (dir, backend) = backend();
        fs::write(dir.path().join("t"), b"").unwrap();
        backend
            .utimens("/t", Timespec::new(1_000, 0), Timespec::new(2_000, 0))
            .unwrap();
        let meta = fs::metadata(dir.path().join("t")).unwrap();
        assert_eq!(meta.mtime(), 2_000);
    }
}
