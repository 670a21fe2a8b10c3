//! Error types for slotkv operations.
//!
//! Every fallible operation in the crate returns [`StoreResult`]. The
//! block layer never asserts or aborts; I/O failures carry the image
//! path so callers can tell which store misbehaved when several images
//! are open in one process.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for slotkv operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Unified error type for the block layer and the KV layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O on the underlying disk image failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path of the disk image.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A file name does not fit the slot-entry format.
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Which format rule it breaks.
        reason: &'static str,
    },

    /// A write would cross into the adjacent slot's block region.
    #[error(
        "write of {len} bytes would overflow the slot ({fsize} of {capacity} bytes in use)"
    )]
    SlotCapacityExceeded {
        /// Length of the rejected write.
        len: usize,
        /// File size before the write.
        fsize: u64,
        /// Total bytes the slot can hold.
        capacity: u64,
    },

    /// A log record component does not fit the `[klen, vlen]` header.
    #[error("record {component} of {len} bytes exceeds the {max}-byte limit")]
    OversizedRecord {
        /// `"key"` or `"value"`.
        component: &'static str,
        /// Size of the oversized component.
        len: usize,
        /// Maximum the header field can express.
        max: usize,
    },

    /// Keys must be non-empty; a zero-length key is unrepresentable in
    /// the record format (`klen > 0` for all well-formed records).
    #[error("empty keys are not representable in the log format")]
    EmptyKey,

    /// Both slots are used by foreign names, leaving no room for the
    /// store's log file.
    #[error("both file slots are in use; no slot left for the log")]
    SlotTableFull,

    /// The on-disk file pair diverged from the log state machine.
    #[error("log file state out of sync while {0}")]
    LogState(&'static str),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
