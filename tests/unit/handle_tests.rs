use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use lagfs::fs::error::FsError;
use lagfs::fs::passthrough::{Passthrough, PassthroughConfig};
use tempfile::tempdir;

fn new_fs(root: &Path) -> Arc<Passthrough> {
    Passthrough::new(root, PassthroughConfig::default())
}

#[test]
fn write_then_read_at_offsets() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let root = new_fs(dir.path()).root();

    let (_, handle) = root.create(
        OsStr::new("f"),
        libc::O_RDWR | libc::O_CREAT,
        libc::S_IFREG | 0o644,
    )?;

    assert_eq!(5, handle.write(0, b"hello")?);
    assert_eq!(b"hello".to_vec(), handle.read(0, 5)?);
    assert_eq!(b"ell".to_vec(), handle.read(1, 3)?);

    // Reads past EOF come back short, not as errors.
    assert_eq!(b"lo".to_vec(), handle.read(3, 64)?);
    assert!(handle.read(5, 64)?.is_empty());

    handle.flush()?;
    handle.release()?;
    Ok(())
}

#[test]
fn read_dir_all_is_repeatable_after_full_drain() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    for name in ["a", "b", "c"] {
        fs::write(dir.path().join(name), b"x")?;
    }

    let root = new_fs(dir.path()).root();
    let handle = root.open(libc::O_RDONLY)?;

    let names = |entries: Vec<lagfs::fs::handle::DirEntry>| {
        entries
            .into_iter()
            .map(|e| e.name.to_string_lossy().to_string())
            .collect::<HashSet<_>>()
    };

    let first = names(handle.read_dir_all()?);
    assert_eq!(
        HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()]),
        first
    );

    // The stream was reopened after the drain, so a second listing sees the
    // directory from the start instead of coming back empty.
    let second = names(handle.read_dir_all()?);
    assert_eq!(first, second);

    handle.release()?;
    Ok(())
}

#[test]
fn read_dir_all_on_file_handle_is_not_supported() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), b"x")?;

    let root = new_fs(dir.path()).root();
    let file = root.lookup(OsStr::new("f"))?;
    let handle = file.open(libc::O_RDONLY)?;

    let err = handle.read_dir_all().unwrap_err();
    assert!(matches!(err, FsError::NotSupported));
    handle.release()?;
    Ok(())
}

#[test]
fn directory_reopen_follows_renames() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("d"))?;

    let root = new_fs(dir.path()).root();
    let sub = root.lookup(OsStr::new("d"))?;
    let handle = sub.open(libc::O_RDONLY)?;

    assert!(handle.read_dir_all()?.is_empty());

    root.rename(OsStr::new("d"), &root, OsStr::new("e"))?;
    fs::write(dir.path().join("e").join("inner"), b"x")?;

    // The reopener captured the node, not a fixed path, so the refreshed
    // stream lists the renamed directory.
    let entries = handle.read_dir_all()?;
    assert_eq!(1, entries.len());
    assert_eq!("inner", entries[0].name.to_string_lossy());

    handle.release()?;
    Ok(())
}

#[test]
fn open_file_survives_rename_of_its_path() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let root = new_fs(dir.path()).root();

    let (node, handle) = root.create(
        OsStr::new("f"),
        libc::O_RDWR | libc::O_CREAT,
        libc::S_IFREG | 0o644,
    )?;
    handle.write(0, b"hello")?;

    root.rename(OsStr::new("f"), &root, OsStr::new("g"))?;
    assert_eq!(dir.path().join("g"), node.real_path());

    // The open descriptor is unaffected by the rename.
    assert_eq!(b"hello".to_vec(), handle.read(0, 5)?);
    handle.release()?;
    Ok(())
}

#[test]
fn release_is_safe_to_call_twice() -> lagfs::Result<()> {
    let dir = tempdir().unwrap();
    let root = new_fs(dir.path()).root();

    let (_, handle) = root.create(
        OsStr::new("f"),
        libc::O_RDWR | libc::O_CREAT,
        libc::S_IFREG | 0o644,
    )?;

    handle.release()?;
    handle.release()?;

    // Operations after release fail instead of touching a closed resource.
    let err = handle.read(0, 1).unwrap_err();
    assert!(matches!(err, FsError::Io(_)));
    Ok(())
}
