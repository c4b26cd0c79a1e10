//! Error taxonomy for passthrough operations and translation from
//! underlying-filesystem conditions.

use std::io;

use thiserror::Error;

pub type FsResult<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not supported")]
    NotSupported,
    #[error("no data available")]
    NoData,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    /// Errno value reported to the FUSE layer.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::PermissionDenied => libc::EPERM,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NoData => libc::ENODATA,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn eio() -> Self {
        FsError::Io(io::Error::from_raw_os_error(libc::EIO))
    }

    pub(crate) fn ebadf() -> Self {
        FsError::Io(io::Error::from_raw_os_error(libc::EBADF))
    }
}

/// Map an underlying-filesystem error to the protocol-level taxonomy.
/// Unknown conditions are passed through unchanged rather than swallowed.
pub fn translate(err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
        _ => FsError::Io(err),
    }
}
