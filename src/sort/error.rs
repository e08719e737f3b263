//! Sorter Error Types

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// External sorter errors.
///
/// Errors observed by the sorter are sticky: the first one is stored and
/// re-surfaced by every later call until `reset`. `Clone` is what makes the
/// re-surfacing cheap, which is why the I/O payload sits behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum SortError {
    /// I/O failure surfaced unchanged from the temp store; never retried
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A spill-file varint failed validation; fatal for this sorter
    #[error("sort spill file is corrupt: {0}")]
    Corrupt(&'static str),

    /// Out-of-order lifecycle calls or invalid parameters; a caller bug
    #[error("sorter misuse: {0}")]
    Misuse(&'static str),

    /// The comparator's declared key width does not match the sorter's
    #[error("sort key mismatch: sorter configured for {sorter} fields, comparator declares {comparator}")]
    SchemaMismatch { sorter: usize, comparator: usize },

    /// The memory budget refused an allocation
    #[error("sort memory budget exhausted")]
    ResourceExhausted,

    /// A background flush or populate thread panicked
    #[error("background sort worker failed")]
    WorkerPanic,
}

impl From<io::Error> for SortError {
    fn from(e: io::Error) -> Self {
        SortError::Io(Arc::new(e))
    }
}

/// Result type for sorter operations
pub type SortResult<T> = Result<T, SortError>;
