//! Crate-wide error taxonomy.

use std::io;

use thiserror::Error;

/// Result type for BerryDB operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by BerryDB operations.
///
/// There is no retry at this layer; callers decide how to react. A write
/// failure during page eviction is the one error that is not surfaced
/// directly: the affected store is closed, and the failure becomes visible
/// as [`Error::StoreClosed`] on the next operation against that store.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying filesystem returned an error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The desired key or file was not found.
    #[error("not found")]
    NotFound,

    /// An object with the given key or path already exists.
    #[error("already exists")]
    AlreadyExists,

    /// The file is locked by another user.
    #[error("already locked by another user")]
    AlreadyLocked,

    /// The page pool has no free buffer and no evictable page.
    #[error("page pool is full")]
    PoolFull,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// The transaction has reached a terminal state.
    #[error("transaction is closed")]
    TransactionClosed,

    /// The caller passed an invalid argument or option combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying data was corrupted.
    #[error("data corruption: {0}")]
    Corrupted(String),
}
