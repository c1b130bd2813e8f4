//! Error taxonomy for the store (§7).
//!
//! Mirrors the embedder-facing error kinds: every fallible operation on
//! a handle ultimately reduces to one of these. Kept as a flat enum
//! (rather than nested source errors) because the embedder API in §6
//! exposes a single `error()` / `error_string()` pair per handle.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TdbError>;

#[derive(Error, Debug)]
pub enum TdbError {
    /// An on-disk invariant from §3 failed: bad magic, misaligned record,
    /// free-list cycle, etc.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// The OS returned an error from read/write/mmap/ftruncate.
    #[error("io error: {0}")]
    Io(String),

    /// A non-blocking lock attempt failed, or a required lock could not
    /// be acquired.
    #[error("locking error: {0}")]
    Lock(String),

    /// Allocation failure (including failure to grow the backing file).
    #[error("out of memory")]
    Oom,

    /// `StoreMode::Insert` against a key that is already present.
    #[error("record exists")]
    Exists,

    /// API misuse: write-only open, unknown attribute, etc.
    #[error("invalid parameter: {0}")]
    Einval(String),

    /// `StoreMode::Modify`, `fetch`, or `delete` against an absent key.
    #[error("record does not exist")]
    NoExist,

    /// A mutation was attempted on a read-only handle.
    #[error("write not permitted on read-only handle")]
    ReadOnly,
}

impl TdbError {
    /// Stable, human-readable string for the error kind — the `error_string()`
    /// half of the §6 embedder API (the `Display` impl already provides the
    /// message text; this returns the bare kind name used by `ErrorKind`).
    pub fn kind(&self) -> ErrorKind {
        match self {
            TdbError::Corrupt(_) => ErrorKind::Corrupt,
            TdbError::Io(_) => ErrorKind::Io,
            TdbError::Lock(_) => ErrorKind::Lock,
            TdbError::Oom => ErrorKind::Oom,
            TdbError::Exists => ErrorKind::Exists,
            TdbError::Einval(_) => ErrorKind::Einval,
            TdbError::NoExist => ErrorKind::NoExist,
            TdbError::ReadOnly => ErrorKind::Readonly,
        }
    }
}

impl From<std::io::Error> for TdbError {
    fn from(e: std::io::Error) -> Self {
        TdbError::Io(e.to_string())
    }
}

/// The bare error kind, independent of the message — corresponds to the
/// `success, corrupt, io, lock, oom, exists, einval, noexist, readonly`
/// taxonomy in §6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    Corrupt,
    Io,
    Lock,
    Oom,
    Exists,
    Einval,
    NoExist,
    Readonly,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Success => "Success",
            ErrorKind::Corrupt => "Corrupt database",
            ErrorKind::Io => "IO Error",
            ErrorKind::Lock => "Locking error",
            ErrorKind::Oom => "Out of memory",
            ErrorKind::Exists => "Record exists",
            ErrorKind::Einval => "Invalid parameter",
            ErrorKind::NoExist => "Record does not exist",
            ErrorKind::Readonly => "write not permitted",
        };
        f.write_str(s)
    }
}
