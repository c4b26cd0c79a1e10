//! An open file or directory bound to a Node.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{DirEntryExt, FileExt};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::error::{translate, FsError, FsResult};
use crate::fs::node::Node;

/// Re-opens the same underlying resource with the same flags. Needed because
/// a directory stream cannot be rewound once fully consumed.
pub type Reopener = Box<dyn Fn() -> io::Result<Resource> + Send + Sync>;

/// The single underlying open resource a Handle owns at a time.
pub enum Resource {
    File(fs::File),
    Dir(fs::ReadDir),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryKind {
    RegularFile,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: OsString,
    pub kind: DirEntryKind,
}

pub struct Handle {
    node: Arc<Node>,
    reopener: Reopener,
    resource: Mutex<Option<Resource>>,
}

impl Handle {
    pub(crate) fn new(node: Arc<Node>, resource: Resource, reopener: Reopener) -> Arc<Self> {
        Arc::new(Self {
            node,
            reopener,
            resource: Mutex::new(Some(resource)),
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Read up to `size` bytes at `offset`. Short reads at EOF are returned
    /// as-is.
    pub fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let path = self.node.real_path();
        self.node.fs().pace("read", &path, || {
            let guard = self.resource.lock();
            match guard.as_ref() {
                Some(Resource::File(file)) => {
                    let mut buf = vec![0u8; size as usize];
                    let n = file.read_at(&mut buf, offset).map_err(translate)?;
                    buf.truncate(n);
                    Ok(buf)
                }
                Some(Resource::Dir(_)) => {
                    Err(FsError::Io(io::Error::from_raw_os_error(libc::EISDIR)))
                }
                None => Err(FsError::ebadf()),
            }
        })
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<u32> {
        let path = self.node.real_path();
        self.node.fs().pace("write", &path, || {
            let guard = self.resource.lock();
            match guard.as_ref() {
                Some(Resource::File(file)) => {
                    let n = file.write_at(data, offset).map_err(translate)?;
                    Ok(n as u32)
                }
                Some(Resource::Dir(_)) => {
                    Err(FsError::Io(io::Error::from_raw_os_error(libc::EISDIR)))
                }
                None => Err(FsError::ebadf()),
            }
        })
    }

    /// Sync the resource to stable storage without closing it.
    pub fn flush(&self) -> FsResult<()> {
        let path = self.node.real_path();
        self.node.fs().pace("flush", &path, || self.sync_contents())
    }

    pub(crate) fn sync_contents(&self) -> FsResult<()> {
        let guard = self.resource.lock();
        match guard.as_ref() {
            Some(Resource::File(file)) => file.sync_all().map_err(translate),
            Some(Resource::Dir(_)) => Ok(()),
            None => Err(FsError::ebadf()),
        }
    }

    /// Read the full remaining directory stream in one call, then close and
    /// reopen the stream: it cannot be rewound, and without the reopen a
    /// second listing on this handle would come back empty instead of
    /// starting from the beginning.
    pub fn read_dir_all(&self) -> FsResult<Vec<DirEntry>> {
        let path = self.node.real_path();
        self.node.fs().pace("readdirall", &path, || {
            let mut guard = self.resource.lock();
            let stream = match guard.as_mut() {
                Some(Resource::Dir(stream)) => stream,
                Some(Resource::File(_)) => return Err(FsError::NotSupported),
                None => return Err(FsError::ebadf()),
            };

            let mut entries = Vec::new();
            for entry in stream {
                let entry = entry.map_err(translate)?;
                let file_type = entry.file_type().map_err(translate)?;
                let kind = if file_type.is_dir() {
                    DirEntryKind::Directory
                } else if file_type.is_file() {
                    DirEntryKind::RegularFile
                } else if file_type.is_symlink() {
                    DirEntryKind::Symlink
                } else {
                    DirEntryKind::Other
                };
                entries.push(DirEntry {
                    ino: entry.ino(),
                    name: entry.file_name(),
                    kind,
                });
            }

            *guard = Some((self.reopener)().map_err(translate)?);
            Ok(entries)
        })
    }

    /// Deregister from the owning node, then close the resource. Close errors
    /// are surfaced, not swallowed. Safe to call more than once.
    pub fn release(self: &Arc<Self>) -> FsResult<()> {
        let path = self.node.real_path();
        self.node.fs().pace("release", &path, || {
            self.node.forget_handle(self);
            match self.resource.lock().take() {
                Some(Resource::File(file)) => {
                    let fd = file.into_raw_fd();
                    if unsafe { libc::close(fd) } != 0 {
                        return Err(translate(io::Error::last_os_error()));
                    }
                    Ok(())
                }
                // Dropping the stream closes the directory fd.
                Some(Resource::Dir(_)) => Ok(()),
                None => Ok(()),
            }
        })
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.node.real_path())
            .finish()
    }
}
