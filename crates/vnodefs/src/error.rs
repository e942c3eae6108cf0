//! Error types for volume operations.
//!
//! Backend failures travel as [`Errno`] and are passed through to the kernel
//! verbatim. Everything the bridge itself can fail with is an [`FsError`]
//! variant with a fixed errno mapping.

use crate::request_bridge::BridgeError;
use std::fmt;
use std::io;
use thiserror::Error;
use vnodefs_mount::io_error_to_errno;

/// A positive POSIX error number reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENODATA: Errno = Errno(libc::ENODATA);

    /// Interpret a C-style hook return: `>= 0` is success, negative is `-errno`.
    pub fn from_return(ret: i32) -> Result<u32, Errno> {
        if ret < 0 {
            Err(Errno(ret.checked_neg().unwrap_or(libc::EIO)))
        } else {
            Ok(ret.unsigned_abs())
        }
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(io_error_to_errno(&err))
    }
}

/// Result of a backend hook.
pub type BackendResult<T> = Result<T, Errno>;

/// Errors surfaced by volume operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Table miss, vanished node, or a lock walk that never reached the root.
    #[error("entry not found")]
    NotFound,

    /// "." or ".." resolved against something that is not a directory.
    #[error("not a directory")]
    NotADirectory,

    /// Ancestor walk exceeded the configured depth.
    #[error("node tree deeper than {0} levels")]
    TooDeep(usize),

    #[error("path longer than {0} bytes")]
    NameTooLong(usize),

    #[error("out of memory")]
    OutOfMemory,

    /// Backend failure, passed through unchanged.
    #[error("backend error: {0}")]
    Backend(Errno),

    /// A name was rebound to a different node while the table lock was
    /// released. Resolution retries internally; this never reaches callers.
    #[error("node identity changed during resolution")]
    Stale,

    /// Lock walk ran past the hop bound: the graph is cyclic or disconnected.
    #[error("lock chain did not reach the root")]
    LockFailure,

    #[error("operation not supported by the backend")]
    Unsupported,

    #[error("invalid cookie: {0}")]
    InvalidCookie(u64),

    /// The caller's buffer cannot hold even the next directory entry.
    #[error("buffer too small for the next entry")]
    BufferTooSmall,

    /// A request parameter the volume cannot act on, such as a zero count.
    #[error("invalid argument")]
    InvalidArgument,

    #[error("malformed data in the node graph")]
    BadData,

    #[error("request bridge: {0}")]
    Bridge(#[from] BridgeError),
}

impl FsError {
    /// Converts this error to a libc error code for the kernel.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::TooDeep(_) => libc::ELOOP,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Backend(errno) => errno.code(),
            FsError::Stale => libc::ESTALE,
            FsError::LockFailure | FsError::BadData | FsError::Bridge(_) => libc::EIO,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::InvalidCookie(_) => libc::EBADF,
            FsError::BufferTooSmall | FsError::InvalidArgument => libc::EINVAL,
        }
    }

    /// The backend errno, if this error came from the backend.
    pub fn backend_errno(&self) -> Option<Errno> {
        match self {
            FsError::Backend(errno) => Some(*errno),
            _ => None,
        }
    }
}

impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        FsError::Backend(errno)
    }
}

impl From<std::collections::TryReserveError> for FsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        FsError::OutOfMemory
    }
}

/// Result type for volume operations.
pub type FsResult<T> = Result<T, FsError>;
