//! File I/O & mmap (§4.1).
//!
//! Owns the single mapped view of the backing file. Growth is
//! truncate-up-then-remap; everything else goes straight through the
//! map. Endian conversion is centralized here: every multi-byte read
//! or write that touches the file goes through `read_u64`/`write_u64`
//! (or the slice helpers), which swap bytes when `convert` is set.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use ahash::RandomState;
use hashbrown::HashMap;
use memmap2::MmapMut;

use crate::error::{Result, TdbError};

/// Grow the file by at least this much extra slack (relative to its
/// current size) when an allocation can't be satisfied, so repeated
/// small grows don't thrash `ftruncate` (§4.3).
const GROWTH_FACTOR: f64 = 1.25;

pub struct Region {
    file: File,
    mmap: MmapMut,
    /// True if the file's format version is the byte-swap of ours —
    /// every field we read or write must then be swapped (§4.1, §6).
    pub convert: bool,
    page_size: usize,
    /// Per-offset write overlay active while a transaction is open
    /// (§4.6 "Write"): `Some` redirects every write below to the
    /// staging map instead of the mmap, and every read checks it
    /// first, so nothing outside staging is touched until commit
    /// applies it for real.
    staging: Option<HashMap<u64, Vec<u8>, RandomState>>,
}

impl Region {
    /// Open an existing file (or create one of `initial_size` bytes),
    /// mapping the whole thing read-write.
    pub fn open(path: &Path, create: bool, initial_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(TdbError::from)?;

        let len = file.metadata().map_err(TdbError::from)?.len();
        if len == 0 {
            file.set_len(initial_size).map_err(TdbError::from)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(TdbError::from)? };

        let page_size = page_size();

        Ok(Region {
            file,
            mmap,
            convert: false,
            page_size,
            staging: None,
        })
    }

    /// Open an existing file for a read-only handle: never creates,
    /// never truncates. The fd is still opened read-write because a
    /// shared mutable mapping needs a writable fd to exist at all, but
    /// nothing above this layer ever calls a write method on a `Tdb`
    /// opened read-only — that contract is enforced in `db.rs`.
    pub fn open_readonly(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(TdbError::from)?;
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(TdbError::from)? };
        Ok(Region {
            file,
            mmap,
            convert: false,
            page_size: page_size(),
            staging: None,
        })
    }

    /// Activate the write-staging overlay for the duration of a
    /// transaction (§4.6 "Begin").
    pub fn begin_transaction(&mut self) {
        self.staging = Some(HashMap::with_hasher(RandomState::new()));
    }

    /// Drain and return whatever was staged, deactivating the overlay.
    /// Subsequent reads/writes go straight to the mmap again.
    pub fn take_staging(&mut self) -> HashMap<u64, Vec<u8>, RandomState> {
        self.staging.take().unwrap_or_else(|| HashMap::with_hasher(RandomState::new()))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn map_size(&self) -> usize {
        self.mmap.len()
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn base_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Out-of-bounds primitive (§4.1): grow the map if `want` bytes
    /// aren't yet mapped. Fails if the underlying file can't be grown.
    pub fn oob(&mut self, want: usize) -> Result<()> {
        if want <= self.map_size() {
            return Ok(());
        }
        let current = self.file.metadata().map_err(TdbError::from)?.len() as usize;
        let grown = ((current as f64) * GROWTH_FACTOR) as usize;
        let new_len = want.max(grown).max(current + self.page_size);
        let new_len = round_up(new_len, self.page_size);

        self.file.set_len(new_len as u64).map_err(TdbError::from)?;
        let mmap = unsafe { MmapMut::map_mut(&self.file).map_err(TdbError::from)? };
        self.mmap = mmap;
        Ok(())
    }

    /// Grow to exactly `new_len` bytes (rounded up to a page), used by
    /// the free-space manager when extending the file for an
    /// allocation (§4.3).
    pub fn grow_to(&mut self, new_len: usize) -> Result<()> {
        let new_len = round_up(new_len, self.page_size);
        if new_len <= self.map_size() {
            return Ok(());
        }
        self.file.set_len(new_len as u64).map_err(TdbError::from)?;
        let mmap = unsafe { MmapMut::map_mut(&self.file).map_err(TdbError::from)? };
        self.mmap = mmap;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(TdbError::from)
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.mmap
            .flush_range(offset, len)
            .map_err(TdbError::from)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // --- endian-aware primitive access ---
    //
    // Every one of these bottoms out in `read_raw`/`write_raw`, which
    // check the staging overlay first (§4.6): inside a transaction,
    // nothing here ever touches the mmap directly.

    pub fn read_u64(&self, offset: usize) -> u64 {
        let bytes: [u8; 8] = self.read_raw(offset, 8).try_into().unwrap();
        let v = u64::from_le_bytes(bytes);
        if self.convert {
            v.swap_bytes()
        } else {
            v
        }
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        let v = if self.convert {
            value.swap_bytes()
        } else {
            value
        };
        self.write_raw(offset, &v.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.read_raw(offset, 4).try_into().unwrap();
        let v = u32::from_le_bytes(bytes);
        if self.convert {
            v.swap_bytes()
        } else {
            v
        }
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        let v = if self.convert {
            value.swap_bytes()
        } else {
            value
        };
        self.write_raw(offset, &v.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.read_raw(offset, len)
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.write_raw(offset, data);
    }

    fn read_raw(&self, offset: usize, len: usize) -> Vec<u8> {
        if let Some(staging) = self.staging.as_ref() {
            if let Some(data) = staging.get(&(offset as u64)) {
                if data.len() == len {
                    return data.clone();
                }
            }
        }
        self.mmap[offset..offset + len].to_vec()
    }

    fn write_raw(&mut self, offset: usize, data: &[u8]) {
        if let Some(staging) = self.staging.as_mut() {
            staging.insert(offset as u64, data.to_vec());
            return;
        }
        self.mmap[offset..offset + data.len()].copy_from_slice(data);
    }
}

fn round_up(n: usize, page: usize) -> usize {
    n.div_ceil(page) * page
}

fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v > 0 {
            v as usize
        } else {
            4096
        }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Ensure a raw filesystem error maps to `TdbError::Io` rather than
/// panicking deep in a helper.
pub fn io_err(e: io::Error) -> TdbError {
    TdbError::Io(e.to_string())
}
