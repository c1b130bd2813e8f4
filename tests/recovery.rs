//! Exercises the crash-recovery path directly (§4.6, §8): plant a
//! valid recovery record by hand (simulating a crash between commit
//! steps 3 and 7, i.e. after the data may already have been applied
//! but before the commit is durable) and confirm the next `open` rolls
//! it back to the pre-commit state. The recovery log is an *undo* log
//! (§3 invariant 5, §4.6 step 2, §8 scenario 5): it stores the bytes
//! that were there *before* the staged write, not the bytes the
//! transaction was writing, so replaying it always restores the last
//! durable state regardless of how far step 5's forward application
//! got before the crash.

use rdb::header::Header;
use rdb::region::Region;
use rdb::{Attributes, KeyHasher, OpenFlags, StoreMode, Tdb};
use tempfile::tempdir;

#[test]
fn pending_recovery_record_rolls_back_to_pre_commit_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.tdb");

    // Create the database and a record normally, then close it. This
    // is the last durably-committed state recovery must restore.
    {
        let mut db = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap();
        db.store(b"k", b"before!", StoreMode::Insert).unwrap();
    }

    // Reopen at the region level (bypassing Tdb), overwrite the
    // record's data in place with what an in-flight transaction was
    // writing (simulating step 5 having already applied it to disk),
    // then hand-plant a *valid* recovery record whose triple carries
    // the *old* bytes — exactly what `Transaction::commit` writes at
    // step 1, before step 5 ever touches the real location.
    {
        let mut region = Region::open(&path, false, 0).unwrap();

        let hash = rdb::JenkinsHasher.hash(b"k", Header::hash_seed(&region));
        let top = Header::top_group_offset();
        let offset = rdb::hashtable::lookup(&region, top, hash).expect("record exists");

        let lo = region.read_u64(offset as usize);
        let hi = region.read_u64(offset as usize + 8);
        let hdr = rdb::record::RecordHeader::from_words(lo, hi);
        let body = offset as usize + rdb::record::RECORD_HEADER_SIZE;
        let data_off = (body + hdr.rec_key_length() as usize) as u64;

        let old_bytes = b"before!".to_vec();
        let in_flight = b"after!!";
        assert_eq!(old_bytes.len(), in_flight.len());

        let mut recovery_body = Vec::new();
        recovery_body.extend_from_slice(&1u64.to_le_bytes()); // valid = true
        recovery_body.extend_from_slice(&1u64.to_le_bytes()); // one entry
        recovery_body.extend_from_slice(&data_off.to_le_bytes());
        recovery_body.extend_from_slice(&(old_bytes.len() as u64).to_le_bytes());
        recovery_body.extend_from_slice(&old_bytes);

        let rec_offset = region.map_size() as u64;
        region.oob(rec_offset as usize + 16 + recovery_body.len()).unwrap();
        let rec_hdr = rdb::record::RecordHeader::new(
            rdb::record::RecordMagic::Recovery,
            0,
            0,
            recovery_body.len() as u64,
            recovery_body.len() as u64,
        );
        let (lo, hi) = rec_hdr.to_words();
        region.write_u64(rec_offset as usize, lo);
        region.write_u64(rec_offset as usize + 8, hi);
        region.write_bytes(rec_offset as usize + 16, &recovery_body);

        // Simulate step 5 having already run: the live data now reads
        // as the transaction's new value, with only the (still valid)
        // recovery record standing between this and durability.
        region.write_bytes(data_off as usize, in_flight);

        Header::set_recovery_offset(&mut region, rec_offset);
        region.flush().unwrap();
    }

    // The crash happened before step 6/7 ever ran, so the commit never
    // became durable — the next open must undo step 5's write and
    // restore the key to its last durably-committed value.
    {
        let db = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"before!".to_vec()));
    }

    // Recovery must have cleared the header's recovery pointer; a
    // second open should not re-replay (and in particular should not
    // error trying to interpret a stale recovery record).
    let db = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), Some(b"before!".to_vec()));
}

#[test]
fn empty_transaction_commit_is_a_harmless_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("noop.tdb");
    let mut db = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap();
    db.transaction_begin().unwrap();
    db.transaction_commit().unwrap();
    assert_eq!(db.fetch(b"anything").unwrap(), None);
}
