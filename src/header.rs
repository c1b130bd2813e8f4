//! Fixed file header at offset 0 (§3, §6).
//!
//! The header is a plain byte layout, not a `#[repr(C)]` overlay: every
//! multi-byte field may need to be byte-swapped on read/write depending
//! on the file's format bit (§4.1), so all access goes through
//! `Region::read_u64`/`write_u64` rather than through a transmuted
//! struct. This module only defines the layout (offsets and constants).

use crate::hashtable::GROUP_SIZE;
use crate::region::Region;

/// Fixed 32-byte ASCII marker identifying the file as ours (§6).
pub const MAGIC_FOOD: &[u8; 18] = b"RDB_MAGIC_FOOD_v1\n";
pub const MAGIC_FOOD_SIZE: usize = 32;

/// Format version. The top bit is never set by us, so a reader that
/// finds the byte-swapped value of this constant knows the file was
/// written on a machine of the opposite endianness (§4.1, §6).
pub const FORMAT_VERSION: u64 = 0x0000_0000_0000_0001;

// Field offsets, in declaration order. Every field is 8-byte aligned.
pub const OFF_MAGIC_FOOD: usize = 0;
pub const OFF_VERSION: usize = OFF_MAGIC_FOOD + MAGIC_FOOD_SIZE;
pub const OFF_HASH_SEED: usize = OFF_VERSION + 8;
pub const OFF_HASH_TEST: usize = OFF_HASH_SEED + 8;
pub const OFF_RECOVERY: usize = OFF_HASH_TEST + 8;
pub const OFF_FREE_TABLE: usize = OFF_RECOVERY + 8;
pub const OFF_SEQNUM: usize = OFF_FREE_TABLE + 8;
pub const OFF_TOP_GROUP: usize = OFF_SEQNUM + 8;
pub const TOP_GROUP_BYTES: usize = GROUP_SIZE * 8;
pub const OFF_RESERVED: usize = OFF_TOP_GROUP + TOP_GROUP_BYTES;

/// Header is padded out to a round number so the hash table and slab
/// region that follow stay 8-byte aligned with room to spare for format
/// growth (§9: "any change must bump the format version").
pub const HEADER_SIZE: usize = 640;

const _: () = assert!(OFF_RESERVED <= HEADER_SIZE);

/// Thin accessor layer over the byte offsets above. Kept free-standing
/// (rather than a method on some `Header` owner type) since the header
/// lives inside the same `Region` as everything else — there is no
/// separate buffer to own.
pub struct Header;

impl Header {
    /// Format a brand new file: magic, version, seed, hash-test, and a
    /// zeroed top-level group. Caller has already sized the region to
    /// at least `HEADER_SIZE`.
    pub fn format(
        region: &mut Region,
        hash_seed: u64,
        hash_test: u64,
    ) -> crate::error::Result<()> {
        region.oob(HEADER_SIZE)?;

        let mut magic_buf = [0u8; MAGIC_FOOD_SIZE];
        magic_buf[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD.as_slice());
        region.write_bytes(OFF_MAGIC_FOOD, &magic_buf);

        region.write_u64(OFF_VERSION, FORMAT_VERSION);
        region.write_u64(OFF_HASH_SEED, hash_seed);
        region.write_u64(OFF_HASH_TEST, hash_test);
        region.write_u64(OFF_RECOVERY, 0);
        region.write_u64(OFF_FREE_TABLE, 0);
        region.write_u64(OFF_SEQNUM, 0);
        for i in 0..GROUP_SIZE {
            region.write_u64(OFF_TOP_GROUP + i * 8, 0);
        }
        Ok(())
    }

    /// Validate the magic marker and version, setting `region.convert`
    /// if the file was written on a machine of opposite endianness
    /// (§4.1). Returns an error if the magic doesn't match at all —
    /// this isn't our file, swapped or not.
    pub fn validate(region: &mut Region) -> crate::error::Result<()> {
        let found = region.read_bytes(OFF_MAGIC_FOOD, MAGIC_FOOD.len());
        if found != MAGIC_FOOD.as_slice() {
            // The magic is a byte string, not a multi-byte integer, so
            // it reads the same regardless of which machine wrote it;
            // a mismatch here means this simply isn't our file.
            return Err(crate::error::TdbError::Corrupt(
                "bad magic food marker".into(),
            ));
        }

        // Read the version word raw (bypassing `region.convert`, which
        // is still false at this point) so we can tell a same-endian
        // file from an opposite-endian one before any other field is
        // interpreted.
        let raw: [u8; 8] = region.read_bytes(OFF_VERSION, 8).try_into().unwrap();
        let raw_version = u64::from_le_bytes(raw);
        if raw_version == FORMAT_VERSION {
            return Ok(());
        }
        if raw_version.swap_bytes() == FORMAT_VERSION {
            region.convert = true;
            return Ok(());
        }
        Err(crate::error::TdbError::Corrupt(
            "unrecognized format version".into(),
        ))
    }

    pub fn version(region: &Region) -> u64 {
        region.read_u64(OFF_VERSION)
    }

    pub fn hash_seed(region: &Region) -> u64 {
        region.read_u64(OFF_HASH_SEED)
    }

    pub fn hash_test(region: &Region) -> u64 {
        region.read_u64(OFF_HASH_TEST)
    }

    pub fn recovery_offset(region: &Region) -> u64 {
        region.read_u64(OFF_RECOVERY)
    }

    pub fn set_recovery_offset(region: &mut Region, offset: u64) {
        region.write_u64(OFF_RECOVERY, offset);
    }

    pub fn free_table_offset(region: &Region) -> u64 {
        region.read_u64(OFF_FREE_TABLE)
    }

    pub fn set_free_table_offset(region: &mut Region, offset: u64) {
        region.write_u64(OFF_FREE_TABLE, offset);
    }

    pub fn sequence_number(region: &Region) -> u64 {
        region.read_u64(OFF_SEQNUM)
    }

    pub fn bump_sequence_number(region: &mut Region) -> u64 {
        let next = region.read_u64(OFF_SEQNUM).wrapping_add(1);
        region.write_u64(OFF_SEQNUM, next);
        next
    }

    pub fn top_group_offset() -> usize {
        OFF_TOP_GROUP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    #[test]
    fn validate_accepts_native_endian_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut region = Region::open(tmp.path(), true, HEADER_SIZE as u64).unwrap();
        Header::format(&mut region, 42, 99).unwrap();
        Header::validate(&mut region).unwrap();
        assert!(!region.convert);
        assert_eq!(Header::hash_seed(&region), 42);
        assert_eq!(Header::hash_test(&region), 99);
    }

    #[test]
    fn validate_detects_opposite_endian_file_and_unswaps_fields() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut region = Region::open(tmp.path(), true, HEADER_SIZE as u64).unwrap();
        Header::format(&mut region, 42, 99).unwrap();

        // Simulate a file written by an opposite-endian machine: every
        // stored u64 word on disk is the byte-swap of what a
        // same-endian writer would have stored.
        for off in (OFF_VERSION..OFF_RESERVED).step_by(8) {
            let raw: [u8; 8] = region.read_bytes(off, 8).try_into().unwrap();
            let swapped = u64::from_le_bytes(raw).swap_bytes();
            region.write_bytes(off, &swapped.to_le_bytes());
        }

        Header::validate(&mut region).unwrap();
        assert!(region.convert);
        assert_eq!(Header::hash_seed(&region), 42);
        assert_eq!(Header::hash_test(&region), 99);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut region = Region::open(tmp.path(), true, HEADER_SIZE as u64).unwrap();
        Header::format(&mut region, 1, 2).unwrap();
        region.write_bytes(OFF_MAGIC_FOOD, b"not the right magic food marker");
        assert!(Header::validate(&mut region).is_err());
    }
}
