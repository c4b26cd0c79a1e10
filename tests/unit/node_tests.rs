use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use lagfs::fs::error::FsError;
use lagfs::fs::node::SetattrRequest;
use lagfs::fs::passthrough::{Passthrough, PassthroughConfig};
use tempfile::tempdir;

fn new_fs(root: &Path) -> Arc<Passthrough> {
    Passthrough::new(root, PassthroughConfig::default())
}

fn no_xattr_fs(root: &Path) -> Arc<Passthrough> {
    Passthrough::new(
        root,
        PassthroughConfig {
            xattr_emulation: false,
            ..PassthroughConfig::default()
        },
    )
}

#[test]
fn lookup_missing_entry_is_not_found() {
    let dir = tempdir().unwrap();
    let root = new_fs(dir.path()).root();

    let err = root.lookup(OsStr::new("missing")).unwrap_err();
    assert!(matches!(err, FsError::NotFound));
}

#[test]
fn lookup_on_file_node_is_not_supported() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    let err = file.lookup(OsStr::new("anything")).unwrap_err();
    assert!(matches!(err, FsError::NotSupported));
    Ok(())
}

#[test]
fn create_produces_node_and_open_handle() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let fs = new_fs(dir.path());
    let root = fs.root();

    let flags = libc::O_RDWR | libc::O_CREAT;
    let (node, handle) = root.create(OsStr::new("f"), flags, libc::S_IFREG | 0o644)?;

    assert!(!node.is_dir());
    assert_eq!(dir.path().join("f"), node.real_path());
    assert_eq!(1, fs.alias_count(&dir.path().join("f")));

    handle.write(0, b"payload")?;
    assert_eq!(b"payload".to_vec(), handle.read(0, 7)?);
    handle.release()?;
    Ok(())
}

#[test]
fn create_exclusive_fails_on_existing_entry() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = new_fs(dir.path()).root();
    let flags = libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL;
    let err = root
        .create(OsStr::new("f"), flags, libc::S_IFREG | 0o644)
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists));
    Ok(())
}

#[test]
fn mkdir_registers_directory_node() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let fs = new_fs(dir.path());
    let root = fs.root();

    let node = root.mkdir(OsStr::new("sub"), 0o755)?;
    assert!(node.is_dir());
    assert!(dir.path().join("sub").is_dir());
    assert_eq!(1, fs.alias_count(&dir.path().join("sub")));

    let err = root.mkdir(OsStr::new("sub"), 0o755).unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists));
    Ok(())
}

#[test]
fn remove_unlinks_and_clears_xattrs() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let fs = new_fs(dir.path());
    let root = fs.root();
    let file = root.lookup(OsStr::new("f"))?;
    file.setxattr("user.tag", b"v")?;

    root.remove(OsStr::new("f"))?;
    assert!(!dir.path().join("f").exists());

    // The path is gone, so no stale attribute may survive.
    let err = file.getxattr("user.tag").unwrap_err();
    assert!(matches!(err, FsError::NoData));
    Ok(())
}

#[test]
fn remove_handles_directories_too() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("sub"))?;

    let root = new_fs(dir.path()).root();
    root.remove(OsStr::new("sub"))?;
    assert!(!dir.path().join("sub").exists());

    let err = root.remove(OsStr::new("sub")).unwrap_err();
    assert!(matches!(err, FsError::NotFound));
    Ok(())
}

#[test]
fn access_checks_owner_permission_bits() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"x")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    file.access(0o4)?;
    file.access(0o2)?;
    let err = file.access(0o1).unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied));
    Ok(())
}

#[test]
fn setattr_truncates_chmods_and_sets_mtime() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"hello world")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
    let meta = file.setattr(&SetattrRequest {
        size: Some(5),
        mtime: Some(mtime),
        mode: Some(0o640),
        ..SetattrRequest::default()
    })?;

    assert_eq!(5, meta.len());
    assert_eq!(0o640, meta.mode() & 0o7777);
    let modified = meta.modified()?.duration_since(UNIX_EPOCH)?;
    assert_eq!(1_000_000, modified.as_secs());
    Ok(())
}

#[test]
fn setattr_partial_chown_recovers_missing_half() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"x")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;
    let before = fs::metadata(&path)?;

    // Chown to our own gid with no uid given; the uid half must be re-statted,
    // not zeroed.
    let meta = file.setattr(&SetattrRequest {
        gid: Some(before.gid()),
        ..SetattrRequest::default()
    })?;
    assert_eq!(before.uid(), meta.uid());
    assert_eq!(before.gid(), meta.gid());
    Ok(())
}

#[test]
fn fsync_requires_an_open_handle() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    let err = file.fsync().unwrap_err();
    assert!(matches!(err, FsError::Io(_)));

    let handle = file.open(libc::O_RDWR)?;
    file.fsync()?;
    handle.release()?;

    // All handles released again: back to the no-handle failure.
    assert!(file.fsync().is_err());
    Ok(())
}

#[test]
fn xattr_ops_fail_when_emulation_disabled() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = no_xattr_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    assert!(matches!(
        file.setxattr("user.a", b"1").unwrap_err(),
        FsError::NotSupported
    ));
    assert!(matches!(
        file.getxattr("user.a").unwrap_err(),
        FsError::NotSupported
    ));
    assert!(matches!(
        file.listxattr(0, 0).unwrap_err(),
        FsError::NotSupported
    ));
    assert!(matches!(
        file.removexattr("user.a").unwrap_err(),
        FsError::NotSupported
    ));
    Ok(())
}

#[test]
fn xattr_roundtrip_through_node() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;

    assert!(matches!(
        file.getxattr("user.a").unwrap_err(),
        FsError::NoData
    ));
    file.setxattr("user.a", b"1")?;
    file.setxattr("user.b", b"2")?;
    assert_eq!(b"1".to_vec(), file.getxattr("user.a")?);
    assert_eq!(vec!["user.a", "user.b"], file.listxattr(0, 0)?);

    file.removexattr("user.a")?;
    assert!(matches!(
        file.removexattr("user.a").unwrap_err(),
        FsError::NoData
    ));
    Ok(())
}
