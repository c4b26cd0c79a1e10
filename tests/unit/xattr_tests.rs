use std::path::Path;

use lagfs::fs::xattr::XattrStore;

#[test]
fn set_get_roundtrip() {
    let store = XattrStore::new();
    let path = Path::new("/tmp/file");

    assert!(store.get(path, "user.tag").is_none());
    store.set(path, "user.tag", b"v1");
    assert_eq!(Some(b"v1".to_vec()), store.get(path, "user.tag"));

    // Overwrite replaces the value.
    store.set(path, "user.tag", b"v2");
    assert_eq!(Some(b"v2".to_vec()), store.get(path, "user.tag"));
}

#[test]
fn remove_reports_absence() {
    let store = XattrStore::new();
    let path = Path::new("/tmp/file");

    assert!(!store.remove(path, "user.missing"));
    store.set(path, "user.tag", b"v");
    assert!(store.remove(path, "user.tag"));
    assert!(!store.remove(path, "user.tag"));
    assert!(store.get(path, "user.tag").is_none());
}

#[test]
fn list_is_sorted_and_paginates_exactly_once() {
    let store = XattrStore::new();
    let path = Path::new("/tmp/file");
    for name in ["user.c", "user.a", "user.d", "user.b"] {
        store.set(path, name, b"v");
    }

    assert_eq!(
        vec!["user.a", "user.b", "user.c", "user.d"],
        store.list(path, 0, 0)
    );

    // Walking with limit 1 and advancing the offset by the returned count
    // enumerates every name exactly once.
    let mut seen = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.list(path, offset, 1);
        if page.is_empty() {
            break;
        }
        offset += page.len();
        seen.extend(page);
    }
    assert_eq!(vec!["user.a", "user.b", "user.c", "user.d"], seen);

    // Offset at or past the end yields an empty page.
    assert!(store.list(path, 4, 2).is_empty());
    assert!(store.list(path, 100, 0).is_empty());
}

#[test]
fn list_of_unknown_path_is_empty() {
    let store = XattrStore::new();
    assert!(store.list(Path::new("/nope"), 0, 0).is_empty());
}

#[test]
fn move_all_transfers_ownership() {
    let store = XattrStore::new();
    let from = Path::new("/tmp/old");
    let to = Path::new("/tmp/new");

    store.set(from, "user.a", b"1");
    store.set(from, "user.b", b"2");
    store.move_all(from, to);

    assert!(store.get(from, "user.a").is_none());
    assert!(store.list(from, 0, 0).is_empty());
    assert_eq!(Some(b"1".to_vec()), store.get(to, "user.a"));
    assert_eq!(Some(b"2".to_vec()), store.get(to, "user.b"));

    // Moving a path with no entries is a no-op.
    store.move_all(Path::new("/tmp/ghost"), to);
    assert_eq!(2, store.list(to, 0, 0).len());
}

#[test]
fn clear_drops_all_entries_for_a_path() {
    let store = XattrStore::new();
    let path = Path::new("/tmp/file");
    store.set(path, "user.a", b"1");
    store.set(path, "user.b", b"2");

    store.clear(path);
    assert!(store.get(path, "user.a").is_none());
    assert!(store.list(path, 0, 0).is_empty());
}
