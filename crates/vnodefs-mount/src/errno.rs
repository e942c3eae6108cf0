//! Conversion from `std::io::Error` to POSIX errno values.

use std::io;

/// Returns the errno carried by an I/O error, or a best-effort mapping of its kind.
pub fn io_error_to_errno(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::NotADirectory => libc::ENOTDIR,
        io::ErrorKind::IsADirectory => libc::EISDIR,
        io::ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        io::ErrorKind::ReadOnlyFilesystem => libc::EROFS,
        io::ErrorKind::StorageFull => libc::ENOSPC,
        io::ErrorKind::Unsupported => libc::ENOSYS,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::CrossesDevices => libc::EXDEV,
        io::ErrorKind::InvalidFilename => libc::ENAMETOOLONG,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_os_error_passes_through() {
        let err = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(io_error_to_errno(&err), libc::ENOTEMPTY);
    }

    #[test]
    fn test_kind_mapping() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(io_error_to_errno(&err), libc::ENOENT);

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(io_error_to_errno(&err), libc::EACCES);

        let err = io::Error::other("weird");
        assert_eq!(io_error_to_errno(&err), libc::EIO);
    }
}
