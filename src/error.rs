use std::io;
use std::result;

use thiserror::Error;

use crate::types::Pgno;

/// Custom result type for storage operations
pub type Result<T> = result::Result<T, Error>;

/// Storage engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Key exceeds the page-size derived limit
    #[error("key of {size} bytes exceeds the maximum of {max}")]
    KeyTooLarge { size: usize, max: usize },
    /// Value exceeds the limit for this database
    #[error("value of {size} bytes exceeds the maximum of {max}")]
    ValueTooLarge { size: usize, max: usize },
    /// A page failed structural validation
    #[error("page {pgno} is corrupted: {reason}")]
    PageCorrupted { pgno: Pgno, reason: &'static str },
    /// Database file is corrupted
    #[error("database file is corrupted")]
    Corrupted,
    /// Database version mismatch
    #[error("database version mismatch")]
    VersionMismatch,
    /// File is not a valid database file
    #[error("file is not a valid database file")]
    Invalid,
    /// Geometry upper bound reached
    #[error("environment map size limit reached")]
    MapFull,
    /// Maximum number of named databases reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Reader table has no free slot
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// The writer lock is held by another transaction
    #[error("write transaction lock is busy")]
    Busy,
    /// Operation and database are incompatible
    #[error("operation and database are incompatible")]
    Incompatible,
    /// Unknown or stale database handle
    #[error("the specified database handle is invalid")]
    BadDbi,
    /// Transaction must abort, has a child, or is invalid
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Environment is read-only
    #[error("environment is read-only")]
    EnvReadOnly,
    /// Invalid environment configuration
    #[error("invalid environment configuration: {0}")]
    InvalidConfig(&'static str),
    /// Internal invariant violated
    #[error("internal problem: {0}")]
    Problem(&'static str),
    /// I/O failure of the store or lock file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupted(pgno: Pgno, reason: &'static str) -> Error {
        Error::PageCorrupted { pgno, reason }
    }

    /// Whether the error leaves a write transaction unusable.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::KeyExist
                | Error::NotFound
                | Error::KeyTooLarge { .. }
                | Error::ValueTooLarge { .. }
                | Error::Incompatible
                | Error::BadDbi
                | Error::DbsFull
        )
    }
}
