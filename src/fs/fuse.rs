//! FUSE adapter binding kernel inodes and file handles to the passthrough
//! core's Node and Handle objects.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow, FUSE_ROOT_ID,
};

use crate::fs::handle::{DirEntryKind, Handle};
use crate::fs::node::{Node, SetattrRequest};
use crate::fs::passthrough::Passthrough;
use crate::Result;

const ATTR_TTL: Duration = Duration::from_secs(1);

pub struct PassthroughFuse {
    fs: Arc<Passthrough>,
    nodes: HashMap<u64, Arc<Node>>,
    handles: HashMap<u64, Arc<Handle>>,
    dir_listings: HashMap<u64, DirListing>,
    next_ino: u64,
    next_fh: u64,
}

impl PassthroughFuse {
    pub fn new(fs: Arc<Passthrough>) -> Self {
        let root = fs.root();
        let mut nodes = HashMap::new();
        nodes.insert(FUSE_ROOT_ID, root);
        Self {
            fs,
            nodes,
            handles: HashMap::new(),
            dir_listings: HashMap::new(),
            next_ino: FUSE_ROOT_ID + 1,
            next_fh: 1,
        }
    }

    fn node_for(&self, ino: u64) -> Option<Arc<Node>> {
        self.nodes.get(&ino).cloned()
    }

    fn handle_for(&self, fh: u64) -> Option<Arc<Handle>> {
        self.handles.get(&fh).cloned()
    }

    fn insert_node(&mut self, node: Arc<Node>) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        ino
    }

    fn insert_handle(&mut self, handle: Arc<Handle>) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }
}

fn file_attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.is_file() {
        FileType::RegularFile
    } else {
        FileType::Symlink
    };

    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: meta.created().unwrap_or(UNIX_EPOCH),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind,
        perm: meta.mode() as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn entry_kind(kind: DirEntryKind) -> FileType {
    match kind {
        DirEntryKind::Directory => FileType::Directory,
        DirEntryKind::RegularFile => FileType::RegularFile,
        DirEntryKind::Symlink => FileType::Symlink,
        DirEntryKind::Other => FileType::RegularFile,
    }
}

fn systime(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Snapshot of one directory's entries, built on the first readdir call for
/// a handle and replayed across the kernel's follow-up calls. One reply
/// buffer holds only part of a large directory, so each later call must
/// resume from the offset the kernel saw last instead of starting over or
/// stopping early.
#[derive(Debug, Default)]
pub struct DirListing {
    entries: Vec<(u64, FileType, OsString)>,
}

impl DirListing {
    pub fn push(&mut self, ino: u64, kind: FileType, name: OsString) {
        self.entries.push((ino, kind, name));
    }

    /// Entries from `offset` on, each paired with the offset the kernel
    /// passes back to resume after it.
    pub fn resume_from(
        &self,
        offset: i64,
    ) -> impl Iterator<Item = (i64, u64, FileType, &OsStr)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, (ino, kind, name))| ((i + 1) as i64, *ino, *kind, name.as_os_str()))
    }
}

/// Pack xattr names into the NUL-separated wire format.
fn pack_names(names: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf
}

impl Filesystem for PassthroughFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_node = match self.node_for(parent) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match parent_node.lookup(name) {
            Ok(node) => match node.attributes() {
                Ok(meta) => {
                    let ino = self.insert_node(node);
                    reply.entry(&ATTR_TTL, &file_attr(ino, &meta), 0);
                }
                Err(err) => {
                    node.forget();
                    reply.error(err.errno());
                }
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        if let Some(node) = self.nodes.remove(&ino) {
            node.forget();
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match node.attributes() {
            Ok(meta) => reply.attr(&ATTR_TTL, &file_attr(ino, &meta)),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let request = SetattrRequest {
            size,
            atime: atime.map(systime),
            mtime: mtime.map(systime),
            mode,
            uid,
            gid,
            handle: fh,
        };
        match node.setattr(&request) {
            Ok(meta) => reply.attr(&ATTR_TTL, &file_attr(ino, &meta)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_node = match self.node_for(parent) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match parent_node.mkdir(name, mode) {
            Ok(node) => match node.attributes() {
                Ok(meta) => {
                    let ino = self.insert_node(node);
                    reply.entry(&ATTR_TTL, &file_attr(ino, &meta), 0);
                }
                Err(err) => {
                    node.forget();
                    reply.error(err.errno());
                }
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.node_for(parent) {
            Some(node) => match node.remove(name) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.node_for(parent) {
            Some(node) => match node.remove(name) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_dir, new_dir) = match (self.node_for(parent), self.node_for(newparent)) {
            (Some(old_dir), Some(new_dir)) => (old_dir, new_dir),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match old_dir.rename(name, &new_dir, newname) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match node.open(flags) {
            Ok(handle) => {
                let fh = self.insert_handle(handle);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_node = match self.node_for(parent) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match parent_node.create(name, flags, mode) {
            Ok((node, handle)) => match node.attributes() {
                Ok(meta) => {
                    let ino = self.insert_node(node);
                    let fh = self.insert_handle(handle);
                    reply.created(&ATTR_TTL, &file_attr(ino, &meta), 0, fh, 0);
                }
                Err(err) => {
                    let _ = handle.release();
                    node.forget();
                    reply.error(err.errno());
                }
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.handle_for(fh) {
            Some(handle) => match handle.read(offset.max(0) as u64, size) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.handle_for(fh) {
            Some(handle) => match handle.write(offset.max(0) as u64, data) {
                Ok(written) => reply.written(written),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handle_for(fh) {
            Some(handle) => match handle.flush() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(handle) => match handle.release() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.node_for(ino) {
            Some(node) => match node.fsync() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match node.open(flags) {
            Ok(handle) => {
                let fh = self.insert_handle(handle);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // The full listing is drained in one pass at offset 0 and cached for
        // the handle; releasedir drops the cache.
        if offset == 0 {
            let handle = match self.handle_for(fh) {
                Some(handle) => handle,
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            };
            let entries = match handle.read_dir_all() {
                Ok(entries) => entries,
                Err(err) => {
                    reply.error(err.errno());
                    return;
                }
            };

            let mut listing = DirListing::default();
            listing.push(ino, FileType::Directory, OsString::from("."));
            listing.push(ino, FileType::Directory, OsString::from(".."));
            for entry in entries {
                listing.push(entry.ino, entry_kind(entry.kind), entry.name);
            }
            self.dir_listings.insert(fh, listing);
        }

        // A full reply buffer ends the loop partway through; the kernel comes
        // back with the last offset it saw and the cached listing resumes
        // there instead of answering EOF with entries still pending.
        let listing = match self.dir_listings.get(&fh) {
            Some(listing) => listing,
            None => {
                reply.ok();
                return;
            }
        };
        for (next_offset, ino, kind, name) in listing.resume_from(offset) {
            if reply.add(ino, next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_listings.remove(&fh);
        match self.handles.remove(&fh) {
            Some(handle) => match handle.release() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks,
                stat.bfree,
                stat.bavail,
                stat.files,
                stat.ffree,
                stat.bsize,
                stat.namelen,
                stat.frsize,
            ),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.node_for(ino) {
            Some(node) => match node.setxattr(&name.to_string_lossy(), value) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match node.getxattr(&name.to_string_lossy()) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let node = match self.node_for(ino) {
            Some(node) => node,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match node.listxattr(0, 0) {
            Ok(names) => {
                let packed = pack_names(&names);
                if size == 0 {
                    reply.size(packed.len() as u32);
                } else if packed.len() <= size as usize {
                    reply.data(&packed);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.node_for(ino) {
            Some(node) => match node.removexattr(&name.to_string_lossy()) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.node_for(ino) {
            Some(node) => match node.access(mask as u32) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }
}

/// Handle to a running mount; dropping it will not unmount automatically, so
/// callers should invoke `unmount` explicitly to clean up.
pub struct MountHandle {
    mountpoint: String,
    session: BackgroundSession,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl MountHandle {
    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn unmount(self) {
        self.session.join();
    }
}

/// Spawn a background FUSE mount projecting the passthrough tree.
pub fn spawn_passthrough<P: AsRef<Path>>(
    fs: Arc<Passthrough>,
    mountpoint: P,
    allow_other: bool,
) -> Result<MountHandle> {
    let mountpoint = mountpoint.as_ref().to_string_lossy().to_string();
    let adapter = PassthroughFuse::new(fs);
    let mut options = vec![MountOption::FSName("lagfs".into())];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    let session = fuser::spawn_mount2(adapter, &mountpoint, &options)?;
    Ok(MountHandle {
        mountpoint,
        session,
    })
}
