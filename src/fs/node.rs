//! One live reference to a path in the virtual tree. Several Node objects may
//! represent the same path at once (the kernel re-traverses directory entries
//! and re-looks paths up after forgetting them); the registry keeps all of
//! them consistent across renames.

use std::ffi::OsStr;
use std::os::unix::fs::{chown, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use std::{fs, io};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::fs::error::{translate, FsError, FsResult};
use crate::fs::handle::{Handle, Reopener, Resource};
use crate::fs::passthrough::{c_path, Passthrough};

/// Attribute changes requested by a single setattr call. Absent fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct SetattrRequest {
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Handle-scoped requests are accepted but not modeled; logged only.
    pub handle: Option<u64>,
}

/// Protocol open flags broken out of the raw OS flag word. The non-blocking
/// flag is accepted but has no effect here.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenDisposition {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    exclusive: bool,
    sync: bool,
    truncate: bool,
}

impl OpenDisposition {
    pub(crate) fn from_raw(flags: i32) -> Self {
        if flags & libc::O_NONBLOCK != 0 {
            debug!("O_NONBLOCK set in open flags but ignored");
        }
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
            sync: flags & libc::O_SYNC != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }

    fn options(&self, mode: Option<u32>) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options.read(self.read).write(self.write);
        if self.append {
            options.append(true);
        }
        if self.create && self.exclusive {
            options.create_new(true);
        } else if self.create {
            options.create(true);
        }
        if self.truncate {
            options.truncate(true);
        }
        if self.sync {
            options.custom_flags(libc::O_SYNC);
        }
        if let Some(mode) = mode {
            options.mode(mode);
        }
        options
    }
}

pub struct Node {
    fs: Arc<Passthrough>,
    real_path: RwLock<PathBuf>,
    is_dir: bool,
    handles: Mutex<Vec<Arc<Handle>>>,
}

impl Node {
    pub(crate) fn new(fs: Arc<Passthrough>, real_path: PathBuf, is_dir: bool) -> Arc<Self> {
        Arc::new(Self {
            fs,
            real_path: RwLock::new(real_path),
            is_dir,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the current real path. A rename racing with the caller may
    /// land before or after the snapshot; either is consistent with plain
    /// filesystem semantics.
    pub fn real_path(&self) -> PathBuf {
        self.real_path.read().clone()
    }

    pub(crate) fn set_real_path(&self, path: &Path) {
        *self.real_path.write() = path.to_path_buf();
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub(crate) fn fs(&self) -> &Arc<Passthrough> {
        &self.fs
    }

    /// Stat the current path.
    pub fn attributes(&self) -> FsResult<fs::Metadata> {
        let path = self.real_path();
        self.fs
            .pace("attr", &path, || fs::metadata(&path).map_err(translate))
    }

    /// Check requested permission bits against the owner bits of the mode.
    pub fn access(&self, mask: u32) -> FsResult<()> {
        let path = self.real_path();
        self.fs.pace("access", &path, || {
            let meta = fs::metadata(&path).map_err(translate)?;
            let owner = (meta.mode() >> 6) & 0o7;
            if mask & owner != mask {
                return Err(FsError::PermissionDenied);
            }
            Ok(())
        })
    }

    /// Resolve a child entry, constructing and registering a new Node for it.
    pub fn lookup(self: &Arc<Self>, name: &OsStr) -> FsResult<Arc<Node>> {
        let path = self.real_path().join(name);
        self.fs.pace("lookup", &path, || {
            if !self.is_dir {
                return Err(FsError::NotSupported);
            }
            let meta = fs::metadata(&path).map_err(translate)?;
            let node = Node::new(Arc::clone(&self.fs), path.clone(), meta.is_dir());
            self.fs.register(&node);
            Ok(node)
        })
    }

    /// Open the underlying resource and wrap it in a Handle. The reopener
    /// closure captures this node, so a refresh after a rename opens the
    /// node's path as it is then, not as it was.
    pub fn open(self: &Arc<Self>, flags: i32) -> FsResult<Arc<Handle>> {
        let path = self.real_path();
        self.fs.pace("open", &path, || {
            let disposition = OpenDisposition::from_raw(flags);
            let reopener = self.reopener(disposition, None);
            let resource = reopener().map_err(translate)?;
            let handle = Handle::new(Arc::clone(self), resource, reopener);
            self.remember_handle(&handle);
            Ok(handle)
        })
    }

    /// Create a child entry, producing both its Node and an open Handle.
    pub fn create(
        self: &Arc<Self>,
        name: &OsStr,
        flags: i32,
        mode: u32,
    ) -> FsResult<(Arc<Node>, Arc<Handle>)> {
        let path = self.real_path().join(name);
        self.fs.pace("create", &path, || {
            let disposition = OpenDisposition::from_raw(flags);
            let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
            let node = Node::new(Arc::clone(&self.fs), path.clone(), is_dir);
            let reopener = node.reopener(disposition, Some(mode & 0o7777));
            let resource = reopener().map_err(translate)?;
            let handle = Handle::new(Arc::clone(&node), resource, reopener);
            node.remember_handle(&handle);
            self.fs.register(&node);
            Ok((node, handle))
        })
    }

    pub fn mkdir(self: &Arc<Self>, name: &OsStr, mode: u32) -> FsResult<Arc<Node>> {
        let path = self.real_path().join(name);
        self.fs.pace("mkdir", &path, || {
            fs::DirBuilder::new()
                .mode(mode)
                .create(&path)
                .map_err(translate)?;
            let node = Node::new(Arc::clone(&self.fs), path.clone(), true);
            self.fs.register(&node);
            Ok(node)
        })
    }

    /// Unlink a child entry. The path is gone afterwards, so all emulated
    /// xattrs recorded for it are dropped.
    pub fn remove(&self, name: &OsStr) -> FsResult<()> {
        let path = self.real_path().join(name);
        self.fs.pace("remove", &path, || {
            let result = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(&path),
                Ok(_) => fs::remove_file(&path),
                Err(err) => Err(err),
            };
            result.map_err(translate)?;
            self.fs.xattrs().clear(&path);
            Ok(())
        })
    }

    /// Sync via any one open handle; they all refer to the same file.
    pub fn fsync(&self) -> FsResult<()> {
        let path = self.real_path();
        self.fs.pace("fsync", &path, || {
            let handles = self.handles.lock();
            match handles.first() {
                Some(handle) => handle.sync_contents(),
                None => Err(FsError::eio()),
            }
        })
    }

    /// Apply requested attribute changes in order (size, times, mode,
    /// owner/group), then re-stat and return the fresh attributes.
    pub fn setattr(&self, request: &SetattrRequest) -> FsResult<fs::Metadata> {
        let path = self.real_path();
        self.fs.pace("setattr", &path, || {
            if let Some(size) = request.size {
                let cpath = c_path(&path)?;
                if unsafe { libc::truncate(cpath.as_ptr(), size as libc::off_t) } != 0 {
                    return Err(translate(io::Error::last_os_error()));
                }
            }

            // Time updates are best-effort and platform dependent. When only
            // mtime was requested, atime falls back to the current time.
            if let Some(mtime) = request.mtime {
                let atime = request.atime.unwrap_or_else(SystemTime::now);
                let times = [timeval_from(atime), timeval_from(mtime)];
                let cpath = c_path(&path)?;
                if unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) } != 0 {
                    return Err(translate(io::Error::last_os_error()));
                }
            }

            if request.handle.is_some() {
                debug!(path = %path.display(), "handle-scoped setattr request ignored");
            }

            if let Some(mode) = request.mode {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(translate)?;
            }

            if request.uid.is_some() || request.gid.is_some() {
                // chown needs both halves; recover the unspecified one from a
                // fresh stat when only uid or only gid was requested.
                let (uid, gid) = match (request.uid, request.gid) {
                    (Some(uid), Some(gid)) => (uid, gid),
                    _ => {
                        let meta = fs::metadata(&path).map_err(translate)?;
                        (
                            request.uid.unwrap_or_else(|| meta.uid()),
                            request.gid.unwrap_or_else(|| meta.gid()),
                        )
                    }
                };
                chown(&path, Some(uid), Some(gid)).map_err(translate)?;
            }

            fs::metadata(&path).map_err(translate)
        })
    }

    /// Rename a child of this directory into `new_dir`. The underlying rename
    /// must succeed before any bookkeeping migrates, so registry and xattr
    /// state always reflect the real filesystem layout.
    pub fn rename(&self, old_name: &OsStr, new_dir: &Node, new_name: &OsStr) -> FsResult<()> {
        let old_path = self.real_path().join(old_name);
        let new_path = new_dir.real_path().join(new_name);
        self.fs.pace("rename", &old_path, || {
            fs::rename(&old_path, &new_path).map_err(translate)?;
            self.fs.xattrs().move_all(&old_path, &new_path);
            self.fs.rename_tracked(&old_path, &new_path);
            Ok(())
        })
    }

    pub fn getxattr(&self, name: &str) -> FsResult<Vec<u8>> {
        let path = self.real_path();
        self.fs.pace("getxattr", &path, || {
            if !self.fs.xattr_emulation() {
                return Err(FsError::NotSupported);
            }
            self.fs.xattrs().get(&path, name).ok_or(FsError::NoData)
        })
    }

    pub fn setxattr(&self, name: &str, value: &[u8]) -> FsResult<()> {
        let path = self.real_path();
        self.fs.pace("setxattr", &path, || {
            if !self.fs.xattr_emulation() {
                return Err(FsError::NotSupported);
            }
            self.fs.xattrs().set(&path, name, value);
            Ok(())
        })
    }

    /// List attribute names in stable sorted order; `offset`/`limit` paginate
    /// so repeated calls enumerate the set exactly once. `limit` 0 means all.
    pub fn listxattr(&self, offset: usize, limit: usize) -> FsResult<Vec<String>> {
        let path = self.real_path();
        self.fs.pace("listxattr", &path, || {
            if !self.fs.xattr_emulation() {
                return Err(FsError::NotSupported);
            }
            Ok(self.fs.xattrs().list(&path, offset, limit))
        })
    }

    pub fn removexattr(&self, name: &str) -> FsResult<()> {
        let path = self.real_path();
        self.fs.pace("removexattr", &path, || {
            if !self.fs.xattr_emulation() {
                return Err(FsError::NotSupported);
            }
            if self.fs.xattrs().remove(&path, name) {
                Ok(())
            } else {
                Err(FsError::NoData)
            }
        })
    }

    /// The protocol layer holds no further references to this node; drop it
    /// from the registry.
    pub fn forget(self: &Arc<Self>) {
        self.fs.forget(self);
    }

    fn reopener(self: &Arc<Self>, disposition: OpenDisposition, mode: Option<u32>) -> Reopener {
        let node = Arc::clone(self);
        if self.is_dir {
            Box::new(move || fs::read_dir(node.real_path()).map(Resource::Dir))
        } else {
            let options = disposition.options(mode);
            Box::new(move || options.open(node.real_path()).map(Resource::File))
        }
    }

    pub(crate) fn remember_handle(&self, handle: &Arc<Handle>) {
        let mut handles = self.handles.lock();
        handles.push(Arc::clone(handle));
        self.fs.handle_opened();
    }

    pub(crate) fn forget_handle(&self, handle: &Arc<Handle>) {
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|candidate| !Arc::ptr_eq(candidate, handle));
        if handles.len() < before {
            self.fs.handle_released();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("real_path", &self.real_path())
            .field("is_dir", &self.is_dir)
            .finish()
    }
}

fn timeval_from(t: SystemTime) -> libc::timeval {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
        Err(_) => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    }
}
