//! End-to-end coverage of the public surface (§8): round-trips,
//! free-space reuse after delete, recovery replay, and the
//! different-hash-function rejection scenario.

use std::sync::Arc;

use rdb::{Attributes, JenkinsHasher, KeyHasher, OpenFlags, StoreMode, Tdb};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Tdb {
    Tdb::open(path, OpenFlags::default(), Attributes::default()).unwrap()
}

#[test]
fn store_and_fetch_many_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("many.tdb");
    let mut db = open(&path);

    for i in 0..200u32 {
        let key = format!("key-{i}");
        let val = format!("value-{i}");
        db.store(key.as_bytes(), val.as_bytes(), StoreMode::Insert).unwrap();
    }

    for i in 0..200u32 {
        let key = format!("key-{i}");
        let val = format!("value-{i}");
        assert_eq!(db.fetch(key.as_bytes()).unwrap(), Some(val.into_bytes()));
    }
}

#[test]
fn delete_then_reinsert_reuses_free_space() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.tdb");
    let mut db = open(&path);

    db.store(b"a", &vec![1u8; 4096], StoreMode::Insert).unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();
    db.delete(b"a").unwrap();
    db.store(b"b", &vec![2u8; 4096], StoreMode::Insert).unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();

    // The freed 4096-byte record should have been reused rather than
    // the file growing by another 4096+ bytes.
    assert!(size_after <= size_before + 512);
}

#[test]
fn replace_mode_overwrites_regardless_of_existence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replace.tdb");
    let mut db = open(&path);

    db.store(b"k", b"first", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"first".to_vec()));
    db.store(b"k", b"second", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn reopen_after_close_preserves_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.tdb");
    {
        let mut db = open(&path);
        db.store(b"durable", b"yes", StoreMode::Insert).unwrap();
    }
    let db = open(&path);
    assert_eq!(db.fetch(b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn opening_with_mismatched_hash_function_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hashmismatch.tdb");
    {
        let mut db = open(&path);
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
    }

    struct OtherHasher;
    impl KeyHasher for OtherHasher {
        fn hash(&self, data: &[u8], seed: u64) -> u64 {
            // Deliberately different from JenkinsHasher so the stored
            // hash_test value can never match.
            data.iter().fold(seed, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64))
        }
    }

    let attrs = Attributes {
        hasher: Arc::new(OtherHasher),
        log: None,
        seed: None,
    };
    let err = Tdb::open(&path, OpenFlags::default(), attrs).unwrap_err();
    assert_eq!(err.kind(), rdb::ErrorKind::Corrupt);
    assert!(err.to_string().contains("different hash"));
}

#[test]
fn default_hasher_is_deterministic_across_seeds_and_inputs() {
    let h = JenkinsHasher;
    assert_eq!(h.hash(b"same", 7), h.hash(b"same", 7));
    assert_ne!(h.hash(b"same", 7), h.hash(b"different", 7));
}

#[test]
fn fetch_missing_key_returns_none_not_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.tdb");
    let db = open(&path);
    assert_eq!(db.fetch(b"absent").unwrap(), None);
}

#[test]
fn append_extends_in_place_when_padding_allows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("append_inplace.tdb");
    let mut db = open(&path);

    db.store(b"k", b"abc", StoreMode::Insert).unwrap();
    db.append(b"k", b"def").unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"abcdef".to_vec()));
}

#[test]
fn append_to_missing_key_creates_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("append_missing.tdb");
    let mut db = open(&path);

    db.append(b"new", b"value").unwrap();
    assert_eq!(db.fetch(b"new").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn append_beyond_padding_relocates_and_frees_old_slot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("append_relocate.tdb");
    let mut db = open(&path);

    db.store(b"k", b"short", StoreMode::Insert).unwrap();
    let extra = vec![9u8; 8192];
    db.append(b"k", &extra).unwrap();

    let mut expected = b"short".to_vec();
    expected.extend_from_slice(&extra);
    assert_eq!(db.fetch(b"k").unwrap(), Some(expected));
}

#[test]
fn delete_is_idempotent_and_reports_noexist_on_repeat() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("delete_idempotent.tdb");
    let mut db = open(&path);

    db.store(b"k", b"v", StoreMode::Insert).unwrap();
    db.delete(b"k").unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), None);

    let err = db.delete(b"k").unwrap_err();
    assert_eq!(err.kind(), rdb::ErrorKind::NoExist);
    assert_eq!(db.fetch(b"k").unwrap(), None);
}

#[test]
fn free_space_is_conserved_across_store_then_delete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conserve.tdb");
    let mut db = open(&path);

    db.store(b"k", &vec![7u8; 2048], StoreMode::Insert).unwrap();
    db.delete(b"k").unwrap();
    let after = std::fs::metadata(&path).unwrap().len();

    // The freed record's space should be handed back to the free
    // lists, so reusing it for a same-sized record needs no further
    // file growth.
    db.store(b"k2", &vec![7u8; 2048], StoreMode::Insert).unwrap();
    let after_reuse = std::fs::metadata(&path).unwrap().len();
    assert_eq!(after, after_reuse);
}

#[test]
fn check_passes_on_freshly_populated_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checked.tdb");
    let mut db = open(&path);
    for i in 0..32u32 {
        db.store(format!("k{i}").as_bytes(), b"v", StoreMode::Insert).unwrap();
    }
    db.check().unwrap();
}
