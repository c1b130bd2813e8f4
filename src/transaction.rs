//! Transaction & recovery log (§3, §4.6).
//!
//! Writes inside a transaction are staged in memory, keyed by file
//! offset, by `Region`'s own staging overlay (`region.rs`) — nothing
//! outside staging is touched until commit, so a crash mid-transaction
//! can never leave a partial write on disk. `Transaction` itself only
//! runs commit: it takes the drained staging map and turns it into a
//! crash-safe write, recording the *old* bytes (not the new ones) in
//! the recovery record so a replay undoes an interrupted commit back
//! to the pre-transaction state (§3 invariant 5).
//!
//! Commit follows the seven steps of §4.6 exactly:
//!   1. Read the pre-commit bytes under every staged offset and write
//!      them into a single recovery record, marked invalid.
//!   2. fsync the recovery record.
//!   3. Mark the recovery record valid (one aligned word write).
//!   4. fsync again.
//!   5. Apply the staged pages to their real locations in the file.
//!   6. fsync the real locations.
//!   7. Mark the recovery record invalid (free it).
//!
//! If the process dies between steps 3 and 7, `recover_if_needed` (run
//! at every `open`) finds the still-valid recovery record and replays
//! it — writing the old bytes back — before anything else touches the
//! file. That rollback runs unconditionally whenever the valid flag is
//! found set: a transaction is only durable once step 6 (flag clear +
//! sync) has completed, so even a crash after step 5 fully applied the
//! staged pages is undone, matching §8 scenario 5.

use ahash::RandomState;
use hashbrown::HashMap;

use crate::error::Result;
use crate::header::Header;
use crate::record::{RecordHeader, RecordMagic, RECORD_HEADER_SIZE};
use crate::region::Region;

/// The drained contents of a `Region`'s staging overlay, ready to
/// commit: for each offset, the new bytes that should land there.
pub struct Transaction {
    pages: HashMap<u64, Vec<u8>, RandomState>,
}

impl Transaction {
    /// Wrap an already-staged set of writes (as produced by
    /// `Region::take_staging`) for commit.
    pub fn from_staged(pages: HashMap<u64, Vec<u8>, RandomState>) -> Self {
        Transaction { pages }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Step 1-4: read the bytes currently at each staged offset (the
    /// pre-commit state — `region` hasn't been touched yet, since the
    /// transaction body wrote only into staging), serialize them into
    /// one recovery record (magic `Recovery`, initially written with a
    /// zero "valid" word), fsync, flip the valid word, fsync again.
    fn write_recovery_record(&self, region: &mut Region) -> Result<u64> {
        // Layout: [valid: u64][count: u64] then `count` * ([offset: u64][len: u64][old bytes...])
        let mut body = Vec::new();
        body.extend_from_slice(&0u64.to_le_bytes()); // valid = false initially
        body.extend_from_slice(&(self.pages.len() as u64).to_le_bytes());
        for (offset, staged) in &self.pages {
            let old = region.read_bytes(*offset as usize, staged.len());
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&(old.len() as u64).to_le_bytes());
            body.extend_from_slice(&old);
        }

        let total = RECORD_HEADER_SIZE + body.len();
        let rec_offset = region.map_size() as u64;
        region.oob(rec_offset as usize + total)?;

        let hdr = RecordHeader::new(RecordMagic::Recovery, 0, 0, body.len() as u64, body.len() as u64);
        let (lo, hi) = hdr.to_words();
        region.write_u64(rec_offset as usize, lo);
        region.write_u64(rec_offset as usize + 8, hi);
        region.write_bytes(rec_offset as usize + RECORD_HEADER_SIZE, &body);

        Ok(rec_offset)
    }

    /// Commit this transaction against `region`, following §4.6's
    /// seven-step protocol. The caller (`db.rs`) owns persisting the
    /// header's `recovery` offset field under the transaction lock.
    pub fn commit(self, region: &mut Region) -> Result<()> {
        if self.pages.is_empty() {
            return Ok(());
        }

        // Step 1: compute the undo record (old bytes under every
        // staged offset) and point the header at it, so a crash past
        // this point leaves a record `recover_if_needed` (run on the
        // next open) can find — without this, the record above would
        // be durable but undiscoverable.
        let rec_offset = self.write_recovery_record(region)?;
        Header::set_recovery_offset(region, rec_offset);

        // Step 2: fsync the recovery record (header pointer included;
        // the valid flag is still 0, so a crash here is harmless — the
        // next open sees an unfinished, not-yet-valid record and skips it).
        let rec_hdr_bytes = {
            let lo = region.read_u64(rec_offset as usize);
            let hi = region.read_u64(rec_offset as usize + 8);
            RecordHeader::from_words(lo, hi)
        };
        let rec_total = RECORD_HEADER_SIZE + rec_hdr_bytes.allocated_body_len() as usize;
        region.flush_range(rec_offset as usize, rec_total)?;
        region.flush()?;

        // Step 3: mark the recovery record valid (single aligned word).
        let valid_offset = rec_offset as usize + RECORD_HEADER_SIZE;
        region.write_u64(valid_offset, 1);

        // Step 4: fsync again so the valid flag is durable before we
        // touch the real data.
        region.flush_range(valid_offset, 8)?;

        // Step 5: apply staged pages to their real locations.
        for (offset, data) in &self.pages {
            region.write_bytes(*offset as usize, data);
        }

        // Step 6: fsync the real locations.
        for (offset, data) in &self.pages {
            region.flush_range(*offset as usize, data.len())?;
        }

        // Step 7: invalidate (logically free) the recovery record and
        // clear the header pointer so the next open doesn't look at it.
        region.write_u64(valid_offset, 0);
        region.flush_range(valid_offset, 8)?;
        Header::set_recovery_offset(region, 0);
        region.flush()?;

        Ok(())
    }
}

/// Scan for a valid recovery record left behind by a crash between
/// steps 3 and 7, and roll it back (write the old bytes back to their
/// offsets) before anything else opens the file. Called once from
/// `Tdb::open` under the open lock.
pub fn recover_if_needed(region: &mut Region, recovery_offset: u64) -> Result<bool> {
    if recovery_offset == 0 {
        return Ok(false);
    }

    let lo = region.read_u64(recovery_offset as usize);
    let hi = region.read_u64(recovery_offset as usize + 8);
    let hdr = RecordHeader::from_words(lo, hi);
    if hdr.magic() != Some(RecordMagic::Recovery) {
        return Ok(false);
    }

    let valid_offset = recovery_offset as usize + RECORD_HEADER_SIZE;
    let valid = region.read_u64(valid_offset);
    if valid == 0 {
        return Ok(false);
    }

    let count_offset = valid_offset + 8;
    let count = region.read_u64(count_offset);
    let mut cursor = count_offset + 8;
    for _ in 0..count {
        let offset = region.read_u64(cursor);
        let len = region.read_u64(cursor + 8) as usize;
        let old = region.read_bytes(cursor + 16, len);
        region.write_bytes(offset as usize, &old);
        cursor += 16 + len;
    }
    region.flush()?;

    region.write_u64(valid_offset, 0);
    region.flush_range(valid_offset, 8)?;

    Ok(true)
}
