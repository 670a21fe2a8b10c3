//! The key-value engine.
//!
//! [`KvStore`] keeps the whole working set in a RAM hash map and a
//! redo log of every mutation in the block file named "current".
//! Opening a store replays that log; closing one (or detecting a torn
//! log) rewrites it as a snapshot of the live map, staged in the file
//! named "new" and swapped in by rename.
//!
//! The store is single-agent: mutating calls take `&mut self` and the
//! host serializes access if it shares a store between threads.

use std::path::Path;

use hashbrown::HashMap;

use crate::blockfile::{BlockFile, FileHandle};
use crate::error::{StoreError, StoreResult};
use crate::log;

/// Name of the active log file.
const CURRENT: &str = "current";
/// Name of the compaction staging file.
const STAGED: &str = "new";

/// Log-structured key-value store on one disk image.
pub struct KvStore {
    blocks: BlockFile,
    map: HashMap<Vec<u8>, Vec<u8>>,
    active: FileHandle,
    /// Bytes appended to the active log since it was adopted.
    log_bytes: u64,
    closed: bool,
}

impl KvStore {
    /// Open the store backed by the image at `path`, creating the
    /// image when absent. `format` discards any existing contents.
    ///
    /// Recovery runs here: an interrupted compaction is reconciled
    /// (adopting "new" when "current" is gone, discarding it
    /// otherwise), the log is replayed into memory, and a torn tail
    /// triggers an immediate compaction that keeps every fully
    /// recovered record.
    pub fn open(path: impl AsRef<Path>, format: bool) -> StoreResult<Self> {
        let mut blocks = BlockFile::init(path, format)?;

        let mut active = match blocks.open(CURRENT) {
            Some(handle) => {
                // Leftover staging file from an interrupted compaction
                // that had not yet removed "current"; the log in
                // "current" is authoritative.
                blocks.remove(STAGED)?;
                handle
            }
            None if blocks.open(STAGED).is_some() => {
                // Crash after remove("current"), before the rename.
                if !blocks.rename(STAGED, CURRENT)? {
                    return Err(StoreError::LogState("adopting the staged log"));
                }
                blocks
                    .open(CURRENT)
                    .ok_or(StoreError::LogState("reopening the adopted log"))?
            }
            None => blocks
                .create(CURRENT)?
                .ok_or(StoreError::SlotTableFull)?,
        };

        let mut map = HashMap::new();
        let summary = log::replay(&mut blocks, &mut active, &mut map)?;
        tracing::info!(
            records = summary.records,
            bytes = summary.bytes,
            keys = map.len(),
            "replayed log"
        );

        let mut store = Self {
            blocks,
            map,
            active,
            log_bytes: summary.bytes,
            closed: false,
        };
        if summary.torn {
            tracing::warn!(
                recovered = store.map.len(),
                "torn log tail detected, compacting"
            );
            store.compact()?;
        }
        Ok(store)
    }

    /// Look up `key`. Pure in-memory; `None` when absent.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    /// Insert or update `key`.
    ///
    /// The record is appended to the log before the map changes, so a
    /// failed append leaves the observable state untouched. An empty
    /// value is accepted, but the record format reserves `vlen == 0`
    /// for tombstones: a key whose value is empty does not survive a
    /// restart.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.log_bytes += log::append_record(&mut self.blocks, &self.active, key, value)?;
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Remove `key`. Absent keys return `false` without touching the
    /// disk; present keys get a tombstone record before the erase.
    pub fn remove(&mut self, key: &[u8]) -> StoreResult<bool> {
        if !self.map.contains_key(key) {
            return Ok(false);
        }
        self.log_bytes += log::append_record(&mut self.blocks, &self.active, key, &[])?;
        self.map.remove(key);
        Ok(true)
    }

    /// The live keys, in unspecified order.
    pub fn list(&self) -> Vec<Vec<u8>> {
        self.map.keys().cloned().collect()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no keys are live.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bytes appended to the active log since it was last adopted.
    /// Diagnostic only.
    pub fn log_bytes(&self) -> u64 {
        self.log_bytes
    }

    /// Shut the store down, compacting the log into a fresh snapshot.
    ///
    /// Unlike dropping the store, this surfaces compaction errors to
    /// the caller.
    pub fn close(mut self) -> StoreResult<()> {
        self.closed = true;
        self.compact()
    }

    /// Rewrite the log as a snapshot of the live map: stage into
    /// "new", drop "current", rename, adopt. A crash anywhere in the
    /// sequence is repaired by the probe in [`KvStore::open`].
    fn compact(&mut self) -> StoreResult<()> {
        let staged = self
            .blocks
            .create(STAGED)?
            .ok_or(StoreError::SlotTableFull)?;
        let bytes = log::write_snapshot(&mut self.blocks, &staged, &self.map)?;
        self.blocks.remove(CURRENT)?;
        if !self.blocks.rename(STAGED, CURRENT)? {
            return Err(StoreError::LogState("swapping in the compacted log"));
        }
        self.active = staged;
        self.log_bytes = bytes;
        tracing::info!(keys = self.map.len(), bytes, "compacted log");
        Ok(())
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.compact() {
            tracing::error!(%error, "compaction during drop failed");
        }
    }
}
