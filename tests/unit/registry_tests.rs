use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use lagfs::fs::passthrough::{Passthrough, PassthroughConfig};
use tempfile::tempdir;

fn new_fs(root: &Path) -> Arc<Passthrough> {
    Passthrough::new(root, PassthroughConfig::default())
}

#[test]
fn root_registers_a_directory_node() {
    let dir = tempdir().unwrap();
    let fs = new_fs(dir.path());

    let root = fs.root();
    assert!(root.is_dir());
    assert_eq!(dir.path(), root.real_path());
    assert_eq!(1, fs.alias_count(dir.path()));
}

#[test]
fn repeated_lookup_creates_aliases() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"x")?;

    let fs = new_fs(dir.path());
    let root = fs.root();

    let first = root.lookup(OsStr::new("a.txt"))?;
    let second = root.lookup(OsStr::new("a.txt"))?;

    assert_eq!(first.real_path(), second.real_path());
    assert_eq!(2, fs.alias_count(&dir.path().join("a.txt")));
    Ok(())
}

#[test]
fn rename_migrates_every_alias() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"x")?;

    let fs = new_fs(dir.path());
    let root = fs.root();

    let first = root.lookup(OsStr::new("a.txt"))?;
    let second = root.lookup(OsStr::new("a.txt"))?;

    root.rename(OsStr::new("a.txt"), &root, OsStr::new("b.txt"))?;

    // Both aliases must observe the new path, not just the one that renamed.
    let new_path = dir.path().join("b.txt");
    assert_eq!(new_path, first.real_path());
    assert_eq!(new_path, second.real_path());
    assert_eq!(0, fs.alias_count(&dir.path().join("a.txt")));
    assert_eq!(2, fs.alias_count(&new_path));

    assert!(fs::metadata(dir.path().join("a.txt")).is_err());
    assert!(fs::metadata(&new_path).is_ok());
    Ok(())
}

#[test]
fn rename_into_occupied_path_appends_aliases() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"a")?;
    fs::write(dir.path().join("b.txt"), b"b")?;

    let fs = new_fs(dir.path());
    let root = fs.root();

    let moved = root.lookup(OsStr::new("a.txt"))?;
    let resident = root.lookup(OsStr::new("b.txt"))?;

    root.rename(OsStr::new("a.txt"), &root, OsStr::new("b.txt"))?;

    let target = dir.path().join("b.txt");
    assert_eq!(target, moved.real_path());
    assert_eq!(target, resident.real_path());
    assert_eq!(2, fs.alias_count(&target));
    Ok(())
}

#[test]
fn forget_removes_only_that_node() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"x")?;

    let fs = new_fs(dir.path());
    let root = fs.root();

    let first = root.lookup(OsStr::new("a.txt"))?;
    let second = root.lookup(OsStr::new("a.txt"))?;
    let path = dir.path().join("a.txt");
    assert_eq!(2, fs.alias_count(&path));

    first.forget();
    assert_eq!(1, fs.alias_count(&path));

    // Forgetting an already-absent node is a no-op, not a failure.
    first.forget();
    assert_eq!(1, fs.alias_count(&path));

    second.forget();
    assert_eq!(0, fs.alias_count(&path));
    Ok(())
}

#[test]
fn forget_after_rename_finds_the_new_bucket() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"x")?;

    let fs = new_fs(dir.path());
    let root = fs.root();
    let node = root.lookup(OsStr::new("a.txt"))?;

    root.rename(OsStr::new("a.txt"), &root, OsStr::new("b.txt"))?;
    node.forget();

    assert_eq!(0, fs.alias_count(&dir.path().join("a.txt")));
    assert_eq!(0, fs.alias_count(&dir.path().join("b.txt")));
    Ok(())
}
