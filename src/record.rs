//! Record headers (§3, §4.5, §6).
//!
//! Every non-header byte range in the file belongs to a record, and
//! every record starts with this fixed 16-byte header. The layout is
//! bit-exact per §6:
//!
//! ```text
//! bits 0..5    magic
//! bits 5..11   hash prefix
//! bits 11..24  reserved
//! bits 24..48  key length
//! bits 48..80  data length
//! bits 80..128 total allocated length
//! ```
//!
//! We pack/unpack through a `u128` scratch value and split it into two
//! little-endian `u64` words for the on-disk representation, since the
//! data-length field straddles the word boundary.

pub const RECORD_HEADER_SIZE: usize = 16;

const MAGIC_BITS: u32 = 5;
const HASH_PREFIX_BITS: u32 = 6;
const RESERVED_BITS: u32 = 13;
const KEY_LEN_BITS: u32 = 24;
const DATA_LEN_BITS: u32 = 32;
const TOTAL_LEN_BITS: u32 = 48;

const MAGIC_SHIFT: u32 = 0;
const HASH_PREFIX_SHIFT: u32 = MAGIC_SHIFT + MAGIC_BITS;
const RESERVED_SHIFT: u32 = HASH_PREFIX_SHIFT + HASH_PREFIX_BITS;
const KEY_LEN_SHIFT: u32 = RESERVED_SHIFT + RESERVED_BITS;
const DATA_LEN_SHIFT: u32 = KEY_LEN_SHIFT + KEY_LEN_BITS;
const TOTAL_LEN_SHIFT: u32 = DATA_LEN_SHIFT + DATA_LEN_BITS;

const fn mask(bits: u32) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

/// The 5-bit record kind tag. Only a handful of the 32 possible values
/// are assigned; any other value read from disk is corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMagic {
    Used = 1,
    Free = 2,
    CoalescedFree = 3,
    HashSubgroup = 4,
    FreeTable = 5,
    Recovery = 6,
}

impl RecordMagic {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordMagic::Used),
            2 => Some(RecordMagic::Free),
            3 => Some(RecordMagic::CoalescedFree),
            4 => Some(RecordMagic::HashSubgroup),
            5 => Some(RecordMagic::FreeTable),
            6 => Some(RecordMagic::Recovery),
            _ => None,
        }
    }
}

/// An in-memory decoded view of a 16-byte record header. `rec_*`
/// accessors match the names used in the original implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    bits: u128,
}

impl RecordHeader {
    /// Build (and bit-pack) a record header — the `set_header` operation
    /// of §4.5. `hash_prefix` is ignored for non-`Used` magics.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        magic: RecordMagic,
        hash_prefix: u8,
        key_len: u64,
        data_len: u64,
        total_len: u64,
    ) -> Self {
        let mut bits: u128 = 0;
        bits |= (magic as u128 & mask(MAGIC_BITS)) << MAGIC_SHIFT;
        bits |= ((hash_prefix as u128) & mask(HASH_PREFIX_BITS)) << HASH_PREFIX_SHIFT;
        bits |= ((key_len as u128) & mask(KEY_LEN_BITS)) << KEY_LEN_SHIFT;
        bits |= ((data_len as u128) & mask(DATA_LEN_BITS)) << DATA_LEN_SHIFT;
        bits |= ((total_len as u128) & mask(TOTAL_LEN_BITS)) << TOTAL_LEN_SHIFT;
        RecordHeader { bits }
    }

    /// Decode from the two little-endian u64 words as they appear on disk.
    pub fn from_words(lo: u64, hi: u64) -> Self {
        let bits = (lo as u128) | ((hi as u128) << 64);
        RecordHeader { bits }
    }

    /// Encode to the two little-endian u64 words for on-disk storage.
    pub fn to_words(self) -> (u64, u64) {
        (self.bits as u64, (self.bits >> 64) as u64)
    }

    pub fn magic_raw(&self) -> u8 {
        ((self.bits >> MAGIC_SHIFT) & mask(MAGIC_BITS)) as u8
    }

    pub fn magic(&self) -> Option<RecordMagic> {
        RecordMagic::from_u8(self.magic_raw())
    }

    /// `rec_hash_prefix` (§4.5): top bits of the key's hash, cached for
    /// fast probe-chain filtering. Meaningless for non-`Used` records.
    pub fn rec_hash_prefix(&self) -> u8 {
        ((self.bits >> HASH_PREFIX_SHIFT) & mask(HASH_PREFIX_BITS)) as u8
    }

    /// `rec_key_length`.
    pub fn rec_key_length(&self) -> u64 {
        ((self.bits >> KEY_LEN_SHIFT) & mask(KEY_LEN_BITS)) as u64
    }

    /// `rec_data_length`.
    pub fn rec_data_length(&self) -> u64 {
        ((self.bits >> DATA_LEN_SHIFT) & mask(DATA_LEN_BITS)) as u64
    }

    fn rec_total_length(&self) -> u64 {
        ((self.bits >> TOTAL_LEN_SHIFT) & mask(TOTAL_LEN_BITS)) as u64
    }

    /// `rec_extra_padding`: allocated bytes beyond key+data, available
    /// for in-place growth (§3 "Slack").
    pub fn rec_extra_padding(&self) -> u64 {
        self.rec_total_length()
            .saturating_sub(self.rec_key_length() + self.rec_data_length())
    }

    /// Total bytes occupied by this record after its own 16-byte header
    /// (key + data + padding).
    pub fn allocated_body_len(&self) -> u64 {
        self.rec_total_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_words() {
        let h = RecordHeader::new(RecordMagic::Used, 0x2A, 12, 34, 12 + 34 + 8);
        let (lo, hi) = h.to_words();
        let h2 = RecordHeader::from_words(lo, hi);
        assert_eq!(h.magic(), h2.magic());
        assert_eq!(h2.rec_hash_prefix(), 0x2A);
        assert_eq!(h2.rec_key_length(), 12);
        assert_eq!(h2.rec_data_length(), 34);
        assert_eq!(h2.rec_extra_padding(), 8);
    }

    #[test]
    fn magic_roundtrip_for_each_kind() {
        for m in [
            RecordMagic::Used,
            RecordMagic::Free,
            RecordMagic::CoalescedFree,
            RecordMagic::HashSubgroup,
            RecordMagic::FreeTable,
            RecordMagic::Recovery,
        ] {
            let h = RecordHeader::new(m, 0, 0, 0, 0);
            assert_eq!(h.magic(), Some(m));
        }
    }

    #[test]
    fn hash_prefix_fits_six_bits() {
        let h = RecordHeader::new(RecordMagic::Used, 0xFF, 0, 0, 0);
        assert_eq!(h.rec_hash_prefix(), 0x3F);
    }
}
