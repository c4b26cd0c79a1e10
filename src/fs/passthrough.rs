//! Root registry for the passthrough filesystem: tracks every live Node per
//! real path, owns the xattr store, and applies the cross-cutting latency and
//! logging decoration around each operation.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::fs::error::{translate, FsError, FsResult};
use crate::fs::node::Node;
use crate::fs::xattr::XattrStore;
use crate::logging::FsOpSnapshot;

/// Immutable per-mount configuration, supplied at construction.
#[derive(Debug, Clone)]
pub struct PassthroughConfig {
    /// Artificial delay inserted before every operation's real work.
    pub latency: Duration,
    /// Whether xattr get/set/list/remove are emulated in memory. When false
    /// all xattr operations fail with NotSupported.
    pub xattr_emulation: bool,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            xattr_emulation: true,
        }
    }
}

/// Filesystem statistics reported to statfs. `files` and `namelen` are fixed
/// placeholders, not derived from the underlying filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStatistics {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug, Default)]
struct OpMetrics {
    ops_total: AtomicU64,
    ops_failed: AtomicU64,
}

/// The FS-wide registry. One real path may be represented by several live
/// Node objects at once (re-traversal creates aliases), so the map holds a
/// list per key, in registration order.
pub struct Passthrough {
    root_path: PathBuf,
    config: PassthroughConfig,
    nodes: Mutex<HashMap<PathBuf, Vec<Arc<Node>>>>,
    xattrs: XattrStore,
    handles_open: AtomicU64,
    metrics: OpMetrics,
}

impl Passthrough {
    pub fn new(root: impl Into<PathBuf>, config: PassthroughConfig) -> Arc<Self> {
        Arc::new(Self {
            root_path: root.into(),
            config,
            nodes: Mutex::new(HashMap::new()),
            xattrs: XattrStore::new(),
            handles_open: AtomicU64::new(0),
            metrics: OpMetrics::default(),
        })
    }

    /// Create and register a directory Node for the configured root path.
    pub fn root(self: &Arc<Self>) -> Arc<Node> {
        let node = Node::new(Arc::clone(self), self.root_path.clone(), true);
        self.register(&node);
        debug!(path = %self.root_path.display(), "root node created");
        node
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn xattrs(&self) -> &XattrStore {
        &self.xattrs
    }

    pub fn xattr_emulation(&self) -> bool {
        self.config.xattr_emulation
    }

    /// Append a node under its current path. Repeated registration of nodes
    /// for the same path produces aliases by design; no uniqueness here.
    pub(crate) fn register(&self, node: &Arc<Node>) {
        let path = node.real_path();
        let mut nodes = self.nodes.lock();
        nodes.entry(path).or_default().push(Arc::clone(node));
    }

    /// Move every node registered under `old` to `new` and update each moved
    /// node's path field, all inside the registry critical section so readers
    /// never observe a torn registry/path pair. An occupied destination keeps
    /// its existing aliases; the moved list is appended.
    pub(crate) fn rename_tracked(&self, old: &Path, new: &Path) {
        let mut nodes = self.nodes.lock();
        if let Some(moved) = nodes.remove(old) {
            for node in &moved {
                node.set_real_path(new);
            }
            nodes.entry(new.to_path_buf()).or_default().extend(moved);
        }
    }

    /// Remove one node (by object identity) from the bucket for its current
    /// path. No-op when the node is not registered.
    pub(crate) fn forget(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.lock();
        let path = node.real_path();
        if let Some(bucket) = nodes.get_mut(&path) {
            bucket.retain(|candidate| !Arc::ptr_eq(candidate, node));
            if bucket.is_empty() {
                nodes.remove(&path);
            }
        }
    }

    /// Number of live nodes currently registered for a path.
    pub fn alias_count(&self, path: &Path) -> usize {
        let nodes = self.nodes.lock();
        nodes.get(path).map_or(0, Vec::len)
    }

    /// Query statistics of the filesystem backing the root path. File count
    /// and filename length limit are not derived from real data.
    pub fn statfs(&self) -> FsResult<FsStatistics> {
        self.pace("statfs", &self.root_path, || {
            let path = c_path(&self.root_path)?;
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
                return Err(translate(io::Error::last_os_error()));
            }
            Ok(FsStatistics {
                blocks: stat.f_blocks as u64,
                bfree: stat.f_bfree as u64,
                bavail: stat.f_bavail as u64,
                files: 0,
                ffree: stat.f_ffree as u64,
                bsize: stat.f_bsize as u32,
                namelen: 255,
                frsize: 8,
            })
        })
    }

    /// Cross-cutting wrapper applied around every public operation: inserts
    /// the configured artificial delay before the real work and logs the
    /// outcome with op name, target path, and translated error.
    pub(crate) fn pace<T>(
        &self,
        op: &'static str,
        path: &Path,
        f: impl FnOnce() -> FsResult<T>,
    ) -> FsResult<T> {
        if !self.config.latency.is_zero() {
            thread::sleep(self.config.latency);
        }

        let result = f();
        self.metrics.ops_total.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => debug!(op, path = %path.display(), "fs op"),
            Err(err) => {
                self.metrics.ops_failed.fetch_add(1, Ordering::Relaxed);
                warn!(op, path = %path.display(), error = %err, "fs op failed");
            }
        }
        result
    }

    pub(crate) fn handle_opened(&self) {
        self.handles_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handle_released(&self) {
        self.handles_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn metrics_snapshot(&self) -> FsOpSnapshot {
        let nodes_tracked = {
            let nodes = self.nodes.lock();
            nodes.values().map(Vec::len).sum()
        };
        FsOpSnapshot {
            ops_total: self.metrics.ops_total.load(Ordering::Relaxed),
            ops_failed: self.metrics.ops_failed.load(Ordering::Relaxed),
            nodes_tracked,
            handles_open: self.handles_open.load(Ordering::Relaxed) as usize,
        }
    }
}

impl std::fmt::Debug for Passthrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passthrough")
            .field("root_path", &self.root_path)
            .field("config", &self.config)
            .finish()
    }
}

/// Convert a path to a NUL-terminated C string for raw libc calls.
pub(crate) fn c_path(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::Io(io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL")))
}
