//! Two-level hash index (§3, §4.4).
//!
//! A pure hash trie: the header holds the top-level group (`GROUP_SIZE`
//! slots), and any slot whose entry collides with a second key is
//! replaced by a pointer to a freshly allocated subgroup of the same
//! size, one trie level deeper. Lookup descends slot-by-slot; there is
//! no linear probing within a group — collisions are resolved purely by
//! descending the trie, which is what keeps a single 6-bit
//! `rec_hash_prefix` in the record header (`record.rs`) meaningful at
//! every depth: it always names "the bits that selected this slot at
//! this level".
//!
//! A subgroup collapses back into its parent slot when a delete leaves
//! it with a single occupant, so the trie never carries more depth than
//! the data currently needs (§3 invariant on subgroup occupancy).

use crate::error::{Result, TdbError};
use crate::freelist::FreeTable;
use crate::hash::remix;
use crate::header::Header;
use crate::record::{RecordHeader, RecordMagic, RECORD_HEADER_SIZE};
use crate::region::Region;

/// Uniform fanout at every trie level, top group included. Six bits
/// of hash consumed per level keeps `rec_hash_prefix` (6 bits, see
/// `record.rs`) able to represent the slot a record currently occupies
/// regardless of depth.
pub const GROUP_BITS: u32 = 6;
pub const GROUP_SIZE: usize = 1 << GROUP_BITS;
const SLOT_MASK: u64 = (GROUP_SIZE as u64) - 1;

/// Maximum trie depth before we fall back to `hash::remix` for more
/// bits. 64 bits / 6 bits-per-level ~= 10 full levels before exhaustion.
const NATIVE_DEPTH: u32 = 64 / GROUP_BITS as u32;

/// A slot in any group (top-level or subgroup) is either empty, a
/// pointer to a used record, or a pointer to a child subgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Record(u64),
    Subgroup(u64),
}

const EMPTY: u64 = 0;
/// High bit of a slot word marks it as a subgroup pointer rather than a
/// record offset; record/subgroup offsets never use the top bit since
/// the file can't grow past `2^63` bytes.
const SUBGROUP_TAG: u64 = 1 << 63;

fn decode_slot(raw: u64) -> Slot {
    if raw == EMPTY {
        Slot::Empty
    } else if raw & SUBGROUP_TAG != 0 {
        Slot::Subgroup(raw & !SUBGROUP_TAG)
    } else {
        Slot::Record(raw)
    }
}

fn encode_slot(slot: Slot) -> u64 {
    match slot {
        Slot::Empty => EMPTY,
        Slot::Record(off) => off,
        Slot::Subgroup(off) => off | SUBGROUP_TAG,
    }
}

fn slot_index(hash: u64, depth: u32) -> usize {
    let bits = if depth < NATIVE_DEPTH {
        hash >> (depth * GROUP_BITS)
    } else {
        remix(hash, depth)
    };
    (bits & SLOT_MASK) as usize
}

fn slot_offset(group_offset: usize, index: usize) -> usize {
    group_offset + index * 8
}

fn read_slot(region: &Region, group_offset: usize, index: usize) -> Slot {
    decode_slot(region.read_u64(slot_offset(group_offset, index)))
}

fn write_slot(region: &mut Region, group_offset: usize, index: usize, slot: Slot) {
    region.write_u64(slot_offset(group_offset, index), encode_slot(slot));
}

/// Allocate a fresh, zeroed subgroup record at the end of the file and
/// return its body offset (past the subgroup's own record header).
/// Subgroups are tracked with `RecordMagic::HashSubgroup` so `check`
/// (§4.7) can distinguish them from data records during a full walk.
fn alloc_subgroup(region: &mut Region) -> Result<usize> {
    let body_len = GROUP_SIZE * 8;
    let total = RECORD_HEADER_SIZE + body_len;
    let offset = region.map_size();
    region.oob(offset + total)?;

    let hdr = RecordHeader::new(RecordMagic::HashSubgroup, 0, 0, body_len as u64, body_len as u64);
    let (lo, hi) = hdr.to_words();
    region.write_u64(offset, lo);
    region.write_u64(offset + 8, hi);

    let body_offset = offset + RECORD_HEADER_SIZE;
    for i in 0..GROUP_SIZE {
        region.write_u64(body_offset + i * 8, EMPTY);
    }

    // `oob` may have rounded the file up past what the subgroup itself
    // needs; claim the remainder as a free record rather than leaving
    // it outside every record's range (§3 invariant 1).
    let free_table = FreeTable::at(Header::free_table_offset(region) as usize);
    free_table.register_tail_slack(region, offset + total);
    Ok(body_offset)
}

/// Find the record offset for `hash`, descending through subgroups as
/// needed. `top_group_offset` is the header's embedded top-level group.
pub fn lookup(region: &Region, top_group_offset: usize, hash: u64) -> Option<u64> {
    let mut group_offset = top_group_offset;
    let mut depth = 0u32;
    loop {
        let idx = slot_index(hash, depth);
        match read_slot(region, group_offset, idx) {
            Slot::Empty => return None,
            Slot::Record(off) => return Some(off),
            Slot::Subgroup(off) => {
                group_offset = off as usize;
                depth += 1;
            }
        }
    }
}

/// Insert `record_offset` under `hash`. If the target slot is already
/// occupied by a different record, push both down a level by
/// allocating a subgroup (possibly repeatedly, for hash collisions that
/// agree across several levels — exceedingly unlikely but handled).
///
/// `existing_hash` must be supplied by the caller (the hash index
/// itself does not read record bodies) whenever a collision needs to be
/// resolved; pass it as `None` only when the caller has already
/// verified the slot is empty.
pub fn insert(
    region: &mut Region,
    top_group_offset: usize,
    hash: u64,
    record_offset: u64,
    resolve_hash_at: &dyn Fn(&Region, u64) -> Result<u64>,
) -> Result<()> {
    let mut group_offset = top_group_offset;
    let mut depth = 0u32;
    loop {
        let idx = slot_index(hash, depth);
        match read_slot(region, group_offset, idx) {
            Slot::Empty => {
                write_slot(region, group_offset, idx, Slot::Record(record_offset));
                return Ok(());
            }
            Slot::Subgroup(off) => {
                group_offset = off as usize;
                depth += 1;
            }
            Slot::Record(existing_offset) => {
                let existing_hash = resolve_hash_at(region, existing_offset)?;
                let sub_offset = alloc_subgroup(region)?;
                let existing_idx = slot_index(existing_hash, depth + 1);
                write_slot(region, sub_offset, existing_idx, Slot::Record(existing_offset));
                write_slot(region, group_offset, idx, Slot::Subgroup(sub_offset as u64));

                if existing_idx == slot_index(hash, depth + 1) {
                    group_offset = sub_offset;
                    depth += 1;
                    continue;
                }
                let new_idx = slot_index(hash, depth + 1);
                write_slot(region, sub_offset, new_idx, Slot::Record(record_offset));
                return Ok(());
            }
        }
    }
}

/// Remove the record stored under `hash`, collapsing any subgroup left
/// with a single remaining occupant back into its parent slot.
pub fn delete(region: &mut Region, top_group_offset: usize, hash: u64) -> Result<()> {
    // path[i] = (group_offset at depth i, index used at depth i)
    let mut path: Vec<(usize, usize)> = Vec::new();
    let mut group_offset = top_group_offset;
    let mut depth = 0u32;

    loop {
        let idx = slot_index(hash, depth);
        match read_slot(region, group_offset, idx) {
            Slot::Empty => return Err(TdbError::NoExist),
            Slot::Record(_) => {
                path.push((group_offset, idx));
                write_slot(region, group_offset, idx, Slot::Empty);
                break;
            }
            Slot::Subgroup(off) => {
                path.push((group_offset, idx));
                group_offset = off as usize;
                depth += 1;
            }
        }
    }

    // Walk back up, collapsing any subgroup that now holds exactly one
    // record slot (top-level group is never collapsed — it lives in
    // the header and has no parent slot to collapse into).
    while path.len() > 1 {
        let (parent_offset, parent_idx) = path[path.len() - 2];
        let (this_offset, _this_idx) = path[path.len() - 1];

        let mut sole: Option<(usize, u64)> = None;
        let mut occupied = 0usize;
        for i in 0..GROUP_SIZE {
            if let Slot::Record(off) = read_slot(region, this_offset, i) {
                occupied += 1;
                sole = Some((i, off));
            } else if !matches!(read_slot(region, this_offset, i), Slot::Empty) {
                occupied += 2; // a nested subgroup blocks collapse
                break;
            }
        }

        if occupied == 1 {
            let (_, off) = sole.unwrap();
            write_slot(region, parent_offset, parent_idx, Slot::Record(off));
            path.pop();
        } else {
            break;
        }
    }

    Ok(())
}

/// Visit every occupied slot across the whole trie in slot order,
/// calling `f` with each record's stored offset. Used by `traverse`
/// and `check` (§4.7).
pub fn walk(region: &Region, top_group_offset: usize, f: &mut dyn FnMut(u64)) {
    walk_group(region, top_group_offset, f);
}

fn walk_group(region: &Region, group_offset: usize, f: &mut dyn FnMut(u64)) {
    for i in 0..GROUP_SIZE {
        match read_slot(region, group_offset, i) {
            Slot::Empty => {}
            Slot::Record(off) => f(off),
            Slot::Subgroup(off) => walk_group(region, off as usize, f),
        }
    }
}
