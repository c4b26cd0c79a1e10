//! In-memory extended-attribute emulation keyed by current real path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// Process-wide xattr map. Entries are keyed by the path's *current* name;
/// renames transfer ownership of the whole entry set and removal drops it.
/// A path with no attributes has no entry at all.
#[derive(Debug, Default)]
pub struct XattrStore {
    entries: RwLock<HashMap<PathBuf, HashMap<String, Vec<u8>>>>,
}

impl XattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path, name: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        entries.get(path).and_then(|attrs| attrs.get(name)).cloned()
    }

    pub fn set(&self, path: &Path, name: &str, value: &[u8]) {
        let mut entries = self.entries.write();
        entries
            .entry(path.to_path_buf())
            .or_default()
            .insert(name.to_string(), value.to_vec());
    }

    /// Remove one attribute. Returns false when the attribute was absent.
    pub fn remove(&self, path: &Path, name: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(path) {
            Some(attrs) => attrs.remove(name).is_some(),
            None => false,
        }
    }

    /// List attribute names in stable sorted order, starting at `offset` and
    /// returning at most `limit` names (0 means no limit). Repeated calls that
    /// advance the offset by the returned count enumerate the full set exactly
    /// once.
    pub fn list(&self, path: &Path, offset: usize, limit: usize) -> Vec<String> {
        let entries = self.entries.read();
        let mut names: Vec<String> = match entries.get(path) {
            Some(attrs) => attrs.keys().cloned().collect(),
            None => return Vec::new(),
        };
        names.sort();

        if offset >= names.len() {
            return Vec::new();
        }
        let mut names = names.split_off(offset);
        if limit > 0 && limit < names.len() {
            names.truncate(limit);
        }
        names
    }

    /// Transfer all attributes from one path to another, atomically with
    /// respect to concurrent access. Used on rename.
    pub fn move_all(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.write();
        if let Some(attrs) = entries.remove(from) {
            entries.insert(to.to_path_buf(), attrs);
        }
    }

    /// Drop all attributes for a path. Used on remove/unlink.
    pub fn clear(&self, path: &Path) {
        let mut entries = self.entries.write();
        entries.remove(path);
    }
}
