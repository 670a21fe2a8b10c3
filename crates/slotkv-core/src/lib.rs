//! slotkv core — embedded key-value store on a fixed-size disk image.
//!
//! A single 1 GiB host file is treated as a raw block device. The
//! block layer carves it into at most two named, contiguously
//! allocated files; the KV layer keeps its working set in RAM and its
//! durability in a redo log stored in one of those files.
//!
//! # Architecture
//!
//! - **Read path**: served from the RAM hash map, never touches disk
//! - **Write path**: log record appended first, then the map updated
//! - **Recovery**: the log is replayed at open; a torn tail or a
//!   half-finished compaction is repaired before the store is handed
//!   to the caller
//! - **Compaction**: on clean close (and on torn-log recovery) the
//!   live map is snapshotted into the staging file and swapped in by
//!   rename, bounding the log by the working set
//!
//! The store assumes one logical agent; hosts that share it across
//! threads serialize access themselves.

pub mod blockfile;
pub mod device;
pub mod error;
pub mod format;
pub mod log;
pub mod store;

// Re-export key types for convenience
pub use blockfile::{BlockFile, FileHandle, SeekFrom};
pub use error::{StoreError, StoreResult};
pub use store::KvStore;
