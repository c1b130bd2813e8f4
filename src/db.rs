//! Public operations (§4.7): the `Tdb` handle.
//!
//! Ties the header, hash trie, free-space manager, lock manager and
//! transaction log together into `open`/`store`/`fetch`/`append`/
//! `delete`/`traverse`/`check`/`close`. Grounded on the original
//! implementation's `tdb_open()` sequence: take the open lock, run
//! recovery if a valid recovery record is present, then release the
//! open lock before doing anything else (`tdb.c`'s open-then-recover
//! ordering, preserved here so a half-recovered file is never visible
//! to a second opener).

use std::collections::HashSet;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Result, TdbError};
use crate::freelist::FreeTable;
use crate::hash::{hash_test_value, JenkinsHasher, KeyHasher};
use crate::hashtable;
use crate::header::{Header, HEADER_SIZE};
use crate::lock::{self, LockKind, LockRegion, OwnedLockGuard};
use crate::record::{RecordHeader, RecordMagic, RECORD_HEADER_SIZE};
use crate::region::Region;
use crate::stats::{Stats, StatsSnapshot};
use crate::transaction::{recover_if_needed, Transaction};

/// Severity passed to the embedder's log sink (§7): `Error` for
/// corruption and other serious failures, `Warning` for degraded but
/// recoverable conditions (a weak seed fallback, a replayed recovery
/// record), and `UseError` for embedder misuse — always safe to ignore
/// in production, per §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    UseError,
}

pub type LogFn = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `Exists` if the key is already present.
    Insert,
    /// Fail with `NoExist` if the key is absent.
    Modify,
    /// Insert or overwrite unconditionally.
    Replace,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub read_only: bool,
    /// Create the file (with a fresh header) if it doesn't exist.
    pub create: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags {
            read_only: false,
            create: true,
        }
    }
}

/// Embedder-tunable knobs (§6 "Attribute" surface): hash function,
/// explicit seed, log sink, and the stats block to share.
pub struct Attributes {
    pub hasher: Arc<dyn KeyHasher>,
    pub log: Option<LogFn>,
    /// Force a specific hash seed rather than generating (or reading)
    /// one. Mismatches against an existing file's stored seed are
    /// rejected at open time (§3 invariant 4).
    pub seed: Option<u64>,
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes {
            hasher: Arc::new(JenkinsHasher),
            log: None,
            seed: None,
        }
    }
}

/// Registry of currently open (device, inode) pairs in this process,
/// mirroring the original implementation's "already open" check — two
/// handles on the same file in one process corrupt each other's view
/// of the mmap since neither would see the other's in-memory state.
fn registry() -> &'static Mutex<HashSet<(u64, u64)>> {
    static REGISTRY: OnceLock<Mutex<HashSet<(u64, u64)>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

struct TxnState {
    _lock: OwnedLockGuard,
}

pub struct Tdb {
    region: Region,
    hasher: Arc<dyn KeyHasher>,
    stats: Arc<Stats>,
    log: Option<LogFn>,
    read_only: bool,
    path: PathBuf,
    registry_key: (u64, u64),
    txn: Option<TxnState>,
}

impl Tdb {
    /// Open (creating if requested and absent) the database at `path`,
    /// running crash recovery if needed before returning a usable
    /// handle.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, attrs: Attributes) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        if !existed && !flags.create {
            return Err(TdbError::Einval(format!(
                "{} does not exist and create was not requested",
                path.display()
            )));
        }
        if flags.read_only && !existed {
            return Err(TdbError::Einval(format!(
                "{} does not exist; a read-only open cannot create it",
                path.display()
            )));
        }

        let mut region = if flags.read_only {
            Region::open_readonly(&path)?
        } else {
            Region::open(&path, true, HEADER_SIZE as u64)?
        };
        let meta = region.file().metadata().map_err(TdbError::from)?;
        let registry_key = (meta.dev(), meta.ino());

        {
            let mut reg = registry().lock();
            if reg.contains(&registry_key) {
                log_msg(
                    &attrs.log,
                    LogLevel::UseError,
                    &format!("{} is already open in this process", path.display()),
                );
                return Err(TdbError::Einval(
                    "database already open in this process".into(),
                ));
            }
            reg.insert(registry_key);
        }

        // Read-only opens never take locks (§4.2): skip the open lock
        // and the write-side `open_locked` path (formatting, hash-test
        // check and recovery replay all mutate the file) entirely.
        let result = if flags.read_only {
            Self::open_readonly_validated(&mut region, &path, &attrs)
        } else {
            let file_for_lock = region.file().try_clone().map_err(TdbError::from)?;
            let open_guard = lock::lock(&file_for_lock, LockRegion::Open, LockKind::Exclusive)?;
            let result = Self::open_locked(&mut region, &path, existed, &attrs);
            drop(open_guard);
            result
        };

        if let Err(e) = result {
            registry().lock().remove(&registry_key);
            return Err(e);
        }

        Ok(Tdb {
            region,
            hasher: attrs.hasher,
            stats: Arc::new(Stats::new()),
            log: attrs.log,
            read_only: flags.read_only,
            path,
            registry_key,
            txn: None,
        })
    }

    /// Validate-only counterpart of `open_locked` for read-only handles:
    /// no formatting (a read-only open never creates), and no recovery
    /// replay, since both would mutate the file and §4.2 requires a
    /// read-only open to never take a lock to serialize that mutation
    /// against concurrent openers. A pending recovery record is instead
    /// reported as an error rather than silently served.
    fn open_readonly_validated(region: &mut Region, path: &Path, attrs: &Attributes) -> Result<()> {
        Header::validate(region)?;
        let stored_seed = Header::hash_seed(region);
        let stored_test = Header::hash_test(region);
        let computed_test = hash_test_value(attrs.hasher.as_ref(), stored_seed);
        if stored_test != computed_test {
            let msg = format!(
                "{} is using a different hash function than the one this database was created with",
                path.display()
            );
            log_msg(&attrs.log, LogLevel::Error, &msg);
            return Err(TdbError::Corrupt(msg));
        }
        if let Some(wanted) = attrs.seed {
            if wanted != stored_seed {
                return Err(TdbError::Einval(
                    "requested seed does not match database's stored seed".into(),
                ));
            }
        }
        if Header::recovery_offset(region) != 0 {
            return Err(TdbError::Einval(
                "a crash-recovery record is pending; open read-write once to replay it before opening read-only".into(),
            ));
        }
        Ok(())
    }

    fn open_locked(
        region: &mut Region,
        path: &Path,
        existed: bool,
        attrs: &Attributes,
    ) -> Result<()> {
        let freshly_formatted = !existed || region.file().metadata().map_err(TdbError::from)?.len() == 0;

        if freshly_formatted {
            let seed = attrs.seed.unwrap_or_else(|| generate_seed(attrs.log.as_ref()));
            let test = hash_test_value(attrs.hasher.as_ref(), seed);
            Header::format(region, seed, test)?;
            let free_table = FreeTable::create(region)?;
            Header::set_free_table_offset(region, free_table.body_offset() as u64);
            log::debug!("formatted new database {}", path.display());
            return Ok(());
        }

        Header::validate(region)?;
        let stored_seed = Header::hash_seed(region);
        let stored_test = Header::hash_test(region);
        let computed_test = hash_test_value(attrs.hasher.as_ref(), stored_seed);
        if stored_test != computed_test {
            let msg = format!(
                "{} is using a different hash function than the one this database was created with",
                path.display()
            );
            log_msg(&attrs.log, LogLevel::Error, &msg);
            return Err(TdbError::Corrupt(msg));
        }
        if let Some(wanted) = attrs.seed {
            if wanted != stored_seed {
                return Err(TdbError::Einval(
                    "requested seed does not match database's stored seed".into(),
                ));
            }
        }

        let recovery_offset = Header::recovery_offset(region);
        let recovered = recover_if_needed(region, recovery_offset)?;
        if recovered {
            Header::set_recovery_offset(region, 0);
            log_msg(&attrs.log, LogLevel::Warning, "replayed pending recovery record on open");
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence_number(&self) -> u64 {
        Header::sequence_number(&self.region)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn seed(&self) -> u64 {
        Header::hash_seed(&self.region)
    }

    fn hash_of(&self, key: &[u8]) -> u64 {
        self.hasher.hash(key, self.seed())
    }

    fn free_table(&self) -> FreeTable {
        FreeTable::at(Header::free_table_offset(&self.region) as usize)
    }

    /// The whole-database region (§4.2). Taken `Shared` by every
    /// single-key operation (so they only ever contend with each other
    /// over their actual hash-bucket lock, never over this one) and
    /// `Exclusive` by `traverse`/`check`, which need a view no
    /// concurrent mutator can tear.
    fn all_records_lock(&self, kind: LockKind) -> Result<OwnedLockGuard> {
        self.acquire(LockRegion::AllRecords, kind)
    }

    /// The specific hash-bucket region (§4.2, §8 scenario 6): two keys
    /// whose hashes land in different buckets take disjoint byte
    /// ranges and so never block each other, even across processes.
    fn hash_bucket_lock(&self, hash: u64, kind: LockKind) -> Result<OwnedLockGuard> {
        self.acquire(LockRegion::HashBucket(hash), kind)
    }

    /// The free-list region. Deliberately coarse — a single region
    /// (`FreeBin(0)`) guarding the whole free-space manager rather than
    /// one lock per bin, since a single `alloc()` call can scan and
    /// mutate several bins (its first-fit search walks bins upward from
    /// the ideal one) and per-bin locking would need its own ordering
    /// discipline to stay deadlock-free. Taken only around the handful
    /// of calls that actually touch `freelist.rs`.
    fn free_list_lock(&self, kind: LockKind) -> Result<OwnedLockGuard> {
        self.acquire(LockRegion::FreeBin(0), kind)
    }

    /// Try the region non-blocking first so a contended acquisition can
    /// be counted (`Stats::lock_waits`, §8 scenario 6's "lock wait
    /// counters remain 0" check) before falling back to a blocking wait.
    fn acquire(&self, region: LockRegion, kind: LockKind) -> Result<OwnedLockGuard> {
        let file = self.region.file().try_clone().map_err(TdbError::from)?;
        match lock::try_lock_owned(file, region, kind) {
            Ok(guard) => Ok(guard),
            Err(TdbError::Lock(_)) => {
                self.stats.record_lock_wait();
                let file = self.region.file().try_clone().map_err(TdbError::from)?;
                lock::lock_owned(file, region, kind)
            }
            Err(e) => Err(e),
        }
    }

    /// Read a `Used` record's header, key and data given its offset.
    fn read_record(&self, offset: u64) -> Result<(RecordHeader, Vec<u8>, Vec<u8>)> {
        let lo = self.region.read_u64(offset as usize);
        let hi = self.region.read_u64(offset as usize + 8);
        let hdr = RecordHeader::from_words(lo, hi);
        if hdr.magic() != Some(RecordMagic::Used) {
            return Err(TdbError::Corrupt(format!(
                "expected used record at offset {offset}, found {:?}",
                hdr.magic()
            )));
        }
        let body = offset as usize + RECORD_HEADER_SIZE;
        let key_len = hdr.rec_key_length() as usize;
        let data_len = hdr.rec_data_length() as usize;
        let key = self.region.read_bytes(body, key_len);
        let data = self.region.read_bytes(body + key_len, data_len);
        Ok((hdr, key, data))
    }

    fn resolve_hash_at(region: &Region, hasher: &dyn KeyHasher, seed: u64, offset: u64) -> Result<u64> {
        let lo = region.read_u64(offset as usize);
        let hi = region.read_u64(offset as usize + 8);
        let hdr = RecordHeader::from_words(lo, hi);
        let body = offset as usize + RECORD_HEADER_SIZE;
        let key = region.read_bytes(body, hdr.rec_key_length() as usize);
        Ok(hasher.hash(&key, seed))
    }

    /// Find the existing record offset for `key`, verifying the stored
    /// key bytes actually match (not just the hash) since a 64-bit hash
    /// collision, while statistically negligible, would otherwise
    /// silently return the wrong record.
    fn find(&self, key: &[u8], hash: u64) -> Result<Option<(u64, RecordHeader)>> {
        let Some(offset) = hashtable::lookup(&self.region, Header::top_group_offset(), hash) else {
            return Ok(None);
        };
        let (hdr, stored_key, _data) = self.read_record(offset)?;
        if stored_key == key {
            Ok(Some((offset, hdr)))
        } else {
            Ok(None)
        }
    }

    fn write_record_body(&mut self, body_offset: usize, key: &[u8], data: &[u8]) {
        self.region.write_bytes(body_offset, key);
        self.region.write_bytes(body_offset + key.len(), data);
    }

    /// `store(key, data, mode)` (§4.7).
    pub fn store(&mut self, key: &[u8], data: &[u8], mode: StoreMode) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        let hash = self.hash_of(key);
        let _all = self.all_records_lock(LockKind::Shared)?;
        let _guard = self.hash_bucket_lock(hash, LockKind::Exclusive)?;

        let existing = self.find(key, hash)?;
        match (&existing, mode) {
            (Some(_), StoreMode::Insert) => return Err(TdbError::Exists),
            (None, StoreMode::Modify) => return Err(TdbError::NoExist),
            _ => {}
        }

        if let Some((offset, hdr)) = existing {
            let fits = hdr.rec_key_length() + (data.len() as u64) <= hdr.allocated_body_len();
            if fits {
                let body = offset as usize + RECORD_HEADER_SIZE;
                self.write_record_body(body, key, data);
                let new_hdr = RecordHeader::new(
                    RecordMagic::Used,
                    hdr.rec_hash_prefix(),
                    key.len() as u64,
                    data.len() as u64,
                    hdr.allocated_body_len(),
                );
                let (lo, hi) = new_hdr.to_words();
                self.region.write_u64(offset as usize, lo);
                self.region.write_u64(offset as usize + 8, hi);
            } else {
                let _free = self.free_list_lock(LockKind::Exclusive)?;
                self.free_table().add_free(&mut self.region, offset);
                self.stats.record_free();
                self.allocate_and_link(key, data, hash, true)?;
            }
        } else {
            self.allocate_and_link(key, data, hash, false)?;
        }

        Header::bump_sequence_number(&mut self.region);
        self.region.flush()?;
        Ok(())
    }

    /// Allocate a fresh record and link it into the hash trie. Callers
    /// hold the target hash bucket's lock already; this additionally
    /// takes the free-list lock around the allocation itself (but not
    /// the trie insert, which only ever touches the caller's own bucket).
    fn allocate_and_link(&mut self, key: &[u8], data: &[u8], hash: u64, growing: bool) -> Result<()> {
        let hash_prefix = (hash & 0x3F) as u8;
        let offset = {
            let _free = self.free_list_lock(LockKind::Exclusive)?;
            self.free_table().alloc(
                &mut self.region,
                &self.stats,
                key.len() as u64,
                data.len() as u64,
                hash_prefix,
                growing,
            )?
        };
        self.stats.record_alloc();
        let body = offset as usize + RECORD_HEADER_SIZE;
        self.write_record_body(body, key, data);

        let hasher = self.hasher.clone();
        let seed = self.seed();
        hashtable::insert(&mut self.region, Header::top_group_offset(), hash, offset, &move |region, off| {
            Self::resolve_hash_at(region, hasher.as_ref(), seed, off)
        })
    }

    /// `fetch(key)` (§4.7). Read-only handles never take locks (§4.2,
    /// §8): there's nothing concurrently mutating the file through
    /// this handle to serialize against, and a writer elsewhere already
    /// holds its own locks around any change we might otherwise race.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = self.hash_of(key);
        let (_all, _guard) = if self.read_only {
            (None, None)
        } else {
            (
                Some(self.all_records_lock(LockKind::Shared)?),
                Some(self.hash_bucket_lock(hash, LockKind::Shared)?),
            )
        };
        match self.find(key, hash)? {
            Some((offset, _)) => {
                let (_, _, data) = self.read_record(offset)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// `append(key, data)` (§4.7): extend an existing record's data in
    /// place if its padding allows, otherwise relocate.
    pub fn append(&mut self, key: &[u8], extra: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        let hash = self.hash_of(key);
        let _all = self.all_records_lock(LockKind::Shared)?;
        let _guard = self.hash_bucket_lock(hash, LockKind::Exclusive)?;

        match self.find(key, hash)? {
            None => {
                self.allocate_and_link(key, extra, hash, true)?;
            }
            Some((offset, hdr)) => {
                let new_data_len = hdr.rec_data_length() + extra.len() as u64;
                if hdr.rec_key_length() + new_data_len <= hdr.allocated_body_len() {
                    let body = offset as usize + RECORD_HEADER_SIZE;
                    let data_off = body + hdr.rec_key_length() as usize + hdr.rec_data_length() as usize;
                    self.region.write_bytes(data_off, extra);
                    let new_hdr = RecordHeader::new(
                        RecordMagic::Used,
                        hdr.rec_hash_prefix(),
                        hdr.rec_key_length(),
                        new_data_len,
                        hdr.allocated_body_len(),
                    );
                    let (lo, hi) = new_hdr.to_words();
                    self.region.write_u64(offset as usize, lo);
                    self.region.write_u64(offset as usize + 8, hi);
                } else {
                    let (_, old_key, old_data) = self.read_record(offset)?;
                    let mut combined = old_data;
                    combined.extend_from_slice(extra);
                    {
                        let _free = self.free_list_lock(LockKind::Exclusive)?;
                        self.free_table().add_free(&mut self.region, offset);
                    }
                    self.stats.record_free();
                    self.allocate_and_link(&old_key, &combined, hash, true)?;
                }
            }
        }

        Header::bump_sequence_number(&mut self.region);
        self.region.flush()?;
        Ok(())
    }

    /// `delete(key)` (§4.7).
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        let hash = self.hash_of(key);
        let _all = self.all_records_lock(LockKind::Shared)?;
        let _guard = self.hash_bucket_lock(hash, LockKind::Exclusive)?;

        let Some((offset, _)) = self.find(key, hash)? else {
            return Err(TdbError::NoExist);
        };

        hashtable::delete(&mut self.region, Header::top_group_offset(), hash)?;
        {
            let _free = self.free_list_lock(LockKind::Exclusive)?;
            self.free_table().add_free(&mut self.region, offset);
        }
        self.stats.record_free();

        Header::bump_sequence_number(&mut self.region);
        self.region.flush()?;
        Ok(())
    }

    /// `traverse(f)` (§4.7): visit every key/data pair. Returns the
    /// number of records visited.
    pub fn traverse(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<u64> {
        let _guard = if self.read_only {
            None
        } else {
            Some(self.all_records_lock(LockKind::Exclusive)?)
        };
        let mut count = 0u64;
        let mut first_err: Option<TdbError> = None;
        hashtable::walk(&self.region, Header::top_group_offset(), &mut |offset| {
            if first_err.is_some() {
                return;
            }
            match self.read_record(offset) {
                Ok((_, key, data)) => {
                    if let Err(e) = f(&key, &data) {
                        first_err = Some(e);
                    } else {
                        count += 1;
                    }
                }
                Err(e) => first_err = Some(e),
            }
        });
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(count)
    }

    /// `check()` (§4.7): a full structural pass over the three
    /// invariants listed in §3 that nothing short of a linear walk can
    /// verify:
    ///
    /// 1. every trie-reachable record has a sane `Used` header whose
    ///    hash prefix matches the slot it was found under,
    /// 2. record ranges partition `[end-of-header, map-size)` exactly —
    ///    no gap, no overlap (§3 invariant 1),
    /// 3. every free record appears in exactly one free-list bin, and
    ///    each bin's list is acyclic (§3 invariant 3, §9).
    pub fn check(&self) -> Result<()> {
        let _guard = if self.read_only {
            None
        } else {
            Some(self.all_records_lock(LockKind::Exclusive)?)
        };

        let mut error: Option<TdbError> = None;
        let hasher = self.hasher.clone();
        let seed = self.seed();
        hashtable::walk(&self.region, Header::top_group_offset(), &mut |offset| {
            if error.is_some() {
                return;
            }
            match self.read_record(offset) {
                Ok((hdr, key, _data)) => {
                    let expected = hasher.hash(&key, seed);
                    if (expected & 0x3F) as u8 != hdr.rec_hash_prefix() {
                        error = Some(TdbError::Corrupt(format!(
                            "record at {offset} has stale hash prefix"
                        )));
                    }
                }
                Err(e) => error = Some(e),
            }
        });
        if let Some(e) = error {
            return Err(e);
        }

        let map_size = self.region.map_size();
        let mut cursor = HEADER_SIZE;
        let mut free_offsets: HashSet<u64> = HashSet::new();
        while cursor < map_size {
            if cursor + RECORD_HEADER_SIZE > map_size {
                return Err(TdbError::Corrupt(format!(
                    "record header at {cursor} runs past end of file"
                )));
            }
            let lo = self.region.read_u64(cursor);
            let hi = self.region.read_u64(cursor + 8);
            let hdr = RecordHeader::from_words(lo, hi);
            let magic = hdr.magic().ok_or_else(|| {
                TdbError::Corrupt(format!("unrecognized record magic at offset {cursor}"))
            })?;
            let total = RECORD_HEADER_SIZE + hdr.allocated_body_len() as usize;
            if cursor + total > map_size {
                return Err(TdbError::Corrupt(format!(
                    "record at {cursor} extends past end of file"
                )));
            }
            if matches!(magic, RecordMagic::Free | RecordMagic::CoalescedFree) {
                free_offsets.insert(cursor as u64);
            }
            cursor += total;
        }
        if cursor != map_size {
            return Err(TdbError::Corrupt(
                "record ranges do not exactly cover the file".into(),
            ));
        }

        let free_table = self.free_table();
        let mut seen_in_lists: HashSet<u64> = HashSet::new();
        for bin in 0..crate::freelist::NUM_BINS {
            let mut visited: HashSet<u64> = HashSet::new();
            let mut cur = free_table.bin_head(&self.region, bin);
            while cur != 0 {
                if !visited.insert(cur) {
                    return Err(TdbError::Corrupt(format!(
                        "cycle detected in free list bin {bin} at offset {cur}"
                    )));
                }
                if !seen_in_lists.insert(cur) {
                    return Err(TdbError::Corrupt(format!(
                        "record at {cur} appears in more than one free list bin"
                    )));
                }
                if !free_offsets.contains(&cur) {
                    return Err(TdbError::Corrupt(format!(
                        "free list bin {bin} references a non-free record at {cur}"
                    )));
                }
                cur = free_table.read_next(&self.region, cur);
            }
        }
        if seen_in_lists.len() != free_offsets.len() {
            return Err(TdbError::Corrupt(
                "a free record is not reachable from any free list bin".into(),
            ));
        }

        Ok(())
    }

    /// Begin an explicit transaction spanning multiple calls. Mutating
    /// calls made while a transaction is open still take their usual
    /// locks, but every write lands in `self.region`'s staging overlay
    /// instead of the mmap (§4.6 "Write") — nothing outside staging is
    /// touched until `transaction_commit` applies it for real, so
    /// `transaction_cancel` can always undo by simply discarding what
    /// was staged.
    pub fn transaction_begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(TdbError::Einval("transaction already open".into()));
        }
        let file = self.region.file().try_clone().map_err(TdbError::from)?;
        let guard = lock::lock_owned(file, LockRegion::Transaction, LockKind::Exclusive)?;
        self.region.begin_transaction();
        self.txn = Some(TxnState { _lock: guard });
        Ok(())
    }

    pub fn transaction_commit(&mut self) -> Result<()> {
        let Some(state) = self.txn.take() else {
            return Err(TdbError::Einval("no transaction is open".into()));
        };
        // §4.6 step 1: take the all-records lock for the duration of
        // the commit so no concurrent reader can observe a half-applied
        // write between step 5 (apply) and step 6 (fsync).
        let _all = self.all_records_lock(LockKind::Exclusive)?;
        let staged = self.region.take_staging();
        let txn = Transaction::from_staged(staged);
        txn.commit(&mut self.region)?;
        self.stats.record_commit();
        drop(state);
        Ok(())
    }

    pub fn transaction_cancel(&mut self) -> Result<()> {
        let Some(state) = self.txn.take() else {
            return Err(TdbError::Einval("no transaction is open".into()));
        };
        // Nothing outside staging was ever written (§5 Cancellation),
        // so undoing is just discarding the staged writes.
        self.region.take_staging();
        self.stats.record_cancel();
        drop(state);
        Ok(())
    }
}

impl Drop for Tdb {
    fn drop(&mut self) {
        registry().lock().remove(&self.registry_key);
    }
}

fn log_msg(log: &Option<LogFn>, level: LogLevel, msg: &str) {
    if let Some(f) = log {
        f(level, msg);
    }
    match level {
        LogLevel::Error => log::error!("{msg}"),
        LogLevel::Warning => log::warn!("{msg}"),
        LogLevel::UseError => log::debug!("{msg}"),
    }
}

/// Generate a fresh 64-bit hash seed for a new database. Falls back
/// through the same three-tier chain as the original implementation's
/// random-seed path: `/dev/urandom`, then `/dev/egd-pool` (an entropy
/// gathering daemon socket some older Unix systems expose in place of
/// `/dev/urandom`), then a weaker mix of PID, wall-clock time and a
/// stack address, logging a warning since that last resort is not
/// cryptographically strong (§9 Open Question — documented, not hidden).
fn generate_seed(log: &Option<LogFn>) -> u64 {
    for path in ["/dev/urandom", "/dev/egd-pool"] {
        if let Ok(mut f) = File::open(path) {
            use std::io::Read;
            let mut buf = [0u8; 8];
            if f.read_exact(&mut buf).is_ok() {
                return u64::from_le_bytes(buf);
            }
        }
    }

    log_msg(
        log,
        LogLevel::Warning,
        "/dev/urandom and /dev/egd-pool unavailable, falling back to a weak seed derived from pid/time/stack address",
    );

    let pid = std::process::id() as u64;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let stack_addr = &pid as *const u64 as u64;
    pid.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ nanos.rotate_left(17)
        ^ stack_addr.rotate_left(31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_fresh(dir: &std::path::Path, name: &str) -> Tdb {
        Tdb::open(
            dir.join(name),
            OpenFlags::default(),
            Attributes::default(),
        )
        .unwrap()
    }

    #[test]
    fn store_then_fetch_roundtrips() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "a.tdb");
        db.store(b"k1", b"v1", StoreMode::Insert).unwrap();
        assert_eq!(db.fetch(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn insert_existing_key_fails() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "b.tdb");
        db.store(b"k1", b"v1", StoreMode::Insert).unwrap();
        let err = db.store(b"k1", b"v2", StoreMode::Insert).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exists);
    }

    #[test]
    fn modify_missing_key_fails() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "c.tdb");
        let err = db.store(b"nope", b"v", StoreMode::Modify).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoExist);
    }

    #[test]
    fn delete_then_fetch_returns_none() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "d.tdb");
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        db.delete(b"k").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), None);
    }

    #[test]
    fn double_delete_fails_with_noexist() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "e.tdb");
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        db.delete(b"k").unwrap();
        let err = db.delete(b"k").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoExist);
    }

    #[test]
    fn append_grows_value() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "f.tdb");
        db.store(b"k", b"ab", StoreMode::Insert).unwrap();
        db.append(b"k", b"cd").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"abcd".to_vec()));
    }

    #[test]
    fn traverse_visits_all_records() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "g.tdb");
        db.store(b"k1", b"v1", StoreMode::Insert).unwrap();
        db.store(b"k2", b"v2", StoreMode::Insert).unwrap();
        let mut seen = Vec::new();
        let n = db
            .traverse(|k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        seen.sort();
        assert_eq!(seen, vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), b"v2".to_vec())]);
    }

    #[test]
    fn transaction_cancel_restores_prior_state() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "h.tdb");
        db.store(b"k", b"v1", StoreMode::Insert).unwrap();
        db.transaction_begin().unwrap();
        db.store(b"k", b"v2", StoreMode::Replace).unwrap();
        db.transaction_cancel().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn transaction_commit_keeps_changes() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "i.tdb");
        db.transaction_begin().unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        db.transaction_commit().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn sequence_number_bumps_on_mutation() {
        let dir = tempdir().unwrap();
        let mut db = open_fresh(dir.path(), "j.tdb");
        let before = db.sequence_number();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        assert!(db.sequence_number() > before);
    }

    #[test]
    fn reopening_same_file_in_process_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.tdb");
        let _db = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap();
        let err = Tdb::open(&path, OpenFlags::default(), Attributes::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Einval);
    }
}
