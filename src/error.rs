// Error types for the cachetable core.
//
// Mirrors the split the rest of this codebase uses: a single `thiserror`
// enum plus a crate-wide `Result` alias. `TryAgain` from spec §7 is not a
// variant here -- it is a retry *signal*, not a failure, so it is modeled
// as `PinOutcome::TryAgain` in `cachetable` instead of threading through
// this enum.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cachefile is closing: {0}")]
    Closing(String),

    #[error("flush failed for cachefile {filenum}: {source}")]
    FlushFailed {
        filenum: u32,
        #[source]
        source: Box<CacheError>,
    },

    #[error("checkpoint user callback failed: {0}")]
    CheckpointFailed(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Abort on a broken internal invariant. Per spec §7, these indicate a
/// caller-contract bug with no safe recovery -- refcount gone negative,
/// clock-ring corruption, pending-list corruption. There is deliberately
/// no `CacheError` variant for this: it is not something a caller can
/// catch and retry.
#[track_caller]
pub fn fatal_invariant(what: &str) -> ! {
    panic!("cachetable invariant violated: {what}");
}
