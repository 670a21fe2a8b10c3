//! Two-slot file directory over the raw disk image.
//!
//! A [`BlockFile`] owns the image, the cached superblock and the
//! staging buffers, and exposes a tiny directory of at most two named
//! files plus positional byte I/O on them. Writes always append at the
//! file's current size; each handle carries only a read cursor.
//!
//! Allocation is static: slot 0 occupies the blocks between the
//! superblock and the device midpoint, slot 1 the upper half. Files
//! never move, and a write that would spill past the slot's region is
//! rejected before anything is touched.

use std::path::Path;

use crate::device::{AlignedBuf, DiskImage};
use crate::error::{StoreError, StoreResult};
use crate::format::{
    slot_limit_block, slot_start_block, SlotEntry, Superblock, BSIZE, MAGIC, NAME_CAP,
};

/// Blocks in the data staging buffer (512 KiB).
const SCRATCH_BLOCKS: usize = 1024;

/// Origin of a [`BlockFile::seek`].
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    /// From the start of the file.
    Start(u64),
    /// Relative to the current read cursor.
    Current(i64),
}

/// Transient handle to one file slot.
///
/// Handles are plain values: dropping one releases it, and it stays
/// valid across renames of its slot. It carries the read cursor; the
/// write position is always the end of the file.
#[derive(Debug, Clone)]
pub struct FileHandle {
    slot: usize,
    cursor: u64,
}

impl FileHandle {
    /// Index of the slot this handle is bound to.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current read cursor in bytes from the start of the file.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// The block-file layer: disk image + cached superblock + scratch.
pub struct BlockFile {
    disk: DiskImage,
    sb: Superblock,
    /// One-block staging area for superblock writes.
    sb_buf: AlignedBuf,
    /// Sole staging area for data-block transfers.
    scratch: AlignedBuf,
}

impl BlockFile {
    /// Open or create the disk image at `path`.
    ///
    /// A missing image is created at the fixed capacity. When the
    /// stored magic does not match, or `format` is set, a fresh
    /// superblock with both slots unused is written in place.
    pub fn init(path: impl AsRef<Path>, format: bool) -> StoreResult<Self> {
        let disk = DiskImage::open(path.as_ref())?;
        let mut sb_buf = AlignedBuf::zeroed(BSIZE);
        disk.read_blocks(0, sb_buf.as_mut_slice())?;
        let sb = Superblock::decode(sb_buf.as_slice());

        let mut blocks = Self {
            disk,
            sb,
            sb_buf,
            scratch: AlignedBuf::zeroed(SCRATCH_BLOCKS * BSIZE),
        };
        if blocks.sb.magic != MAGIC || format {
            tracing::debug!(
                path = %blocks.disk.path().display(),
                "stamping fresh superblock"
            );
            blocks.sb = Superblock::fresh();
            blocks.persist_superblock()?;
        }
        Ok(blocks)
    }

    /// Create `name`, or return a new handle to it when it already
    /// exists. `Ok(None)` when both slots are taken; the superblock is
    /// left untouched in that case.
    pub fn create(&mut self, name: &str) -> StoreResult<Option<FileHandle>> {
        validate_name(name)?;
        if let Some(slot) = self.lookup(name) {
            return Ok(Some(FileHandle { slot, cursor: 0 }));
        }
        let Some(slot) = self.sb.entries.iter().position(|e| e.used == 0) else {
            return Ok(None);
        };
        let entry = &mut self.sb.entries[slot];
        entry.set_name(name);
        entry.used = 1;
        entry.block_start = slot_start_block(slot);
        entry.fsize = 0;
        self.persist_superblock()?;
        Ok(Some(FileHandle { slot, cursor: 0 }))
    }

    /// Handle to the used slot named `name`, if any. No disk I/O.
    pub fn open(&self, name: &str) -> Option<FileHandle> {
        self.lookup(name).map(|slot| FileHandle { slot, cursor: 0 })
    }

    /// Append `buf` at the end of the file.
    ///
    /// The final partial block is read-modified-written through the
    /// scratch buffer and whole-block quanta go to disk. The superblock
    /// is persisted before returning, so a successful return means the
    /// new size is durable metadata.
    pub fn write(&mut self, handle: &FileHandle, buf: &[u8]) -> StoreResult<usize> {
        let entry = self.sb.entries[handle.slot];
        let limit = slot_limit_block(handle.slot);
        let end_block = (entry.block_start as u64)
            + (entry.fsize + buf.len() as u64).div_ceil(BSIZE as u64);
        if end_block > limit {
            return Err(StoreError::SlotCapacityExceeded {
                len: buf.len(),
                fsize: entry.fsize,
                capacity: (limit - entry.block_start as u64) * BSIZE as u64,
            });
        }

        let mut fsize = entry.fsize;
        let mut done = 0usize;
        while done < buf.len() {
            let in_block = (fsize % BSIZE as u64) as usize;
            let first = entry.block_start as u64 + fsize / BSIZE as u64;
            if in_block != 0 {
                // Partial head block: keep the bytes already there.
                self.disk
                    .read_blocks(first, &mut self.scratch.as_mut_slice()[..BSIZE])?;
            }
            let n = (self.scratch.len() - in_block).min(buf.len() - done);
            self.scratch.as_mut_slice()[in_block..in_block + n]
                .copy_from_slice(&buf[done..done + n]);
            let span = (in_block + n).div_ceil(BSIZE) * BSIZE;
            self.disk
                .write_blocks(first, &self.scratch.as_slice()[..span])?;
            fsize += n as u64;
            done += n;
        }

        self.sb.entries[handle.slot].fsize = fsize;
        self.persist_superblock()?;
        Ok(buf.len())
    }

    /// Read up to `out.len()` bytes at the handle's cursor, advancing
    /// it. Returns the number of bytes read; 0 at end of file.
    pub fn read(&mut self, handle: &mut FileHandle, out: &mut [u8]) -> StoreResult<usize> {
        let entry = self.sb.entries[handle.slot];
        let fsize = entry.fsize;
        let mut done = 0usize;
        while done < out.len() && handle.cursor < fsize {
            let in_block = (handle.cursor % BSIZE as u64) as usize;
            let first = entry.block_start as u64 + handle.cursor / BSIZE as u64;
            let n = (self.scratch.len() - in_block)
                .min(out.len() - done)
                .min((fsize - handle.cursor) as usize);
            let span = (in_block + n).div_ceil(BSIZE) * BSIZE;
            self.disk
                .read_blocks(first, &mut self.scratch.as_mut_slice()[..span])?;
            out[done..done + n].copy_from_slice(&self.scratch.as_slice()[in_block..in_block + n]);
            done += n;
            handle.cursor += n as u64;
        }
        Ok(done)
    }

    /// Move the read cursor, clamped into `[0, fsize]`. Returns the
    /// new cursor.
    pub fn seek(&self, handle: &mut FileHandle, from: SeekFrom) -> u64 {
        let fsize = self.sb.entries[handle.slot].fsize;
        handle.cursor = match from {
            SeekFrom::Start(offset) => offset.min(fsize),
            SeekFrom::Current(delta) => {
                (handle.cursor as i64 + delta).clamp(0, fsize as i64) as u64
            }
        };
        handle.cursor
    }

    /// True when the cursor sits at the end of the file.
    pub fn eof(&self, handle: &FileHandle) -> bool {
        handle.cursor == self.sb.entries[handle.slot].fsize
    }

    /// Current size of the file in bytes.
    pub fn fsize(&self, handle: &FileHandle) -> u64 {
        self.sb.entries[handle.slot].fsize
    }

    /// Zero the slot named `name`. `false` when absent.
    pub fn remove(&mut self, name: &str) -> StoreResult<bool> {
        let Some(slot) = self.lookup(name) else {
            return Ok(false);
        };
        self.sb.entries[slot] = SlotEntry::vacant();
        self.persist_superblock()?;
        Ok(true)
    }

    /// Rename `old` to `new`. `false` (and no change) when `old` is
    /// absent or `new` already exists. Data blocks are untouched.
    pub fn rename(&mut self, old: &str, new: &str) -> StoreResult<bool> {
        validate_name(new)?;
        let Some(slot) = self.lookup(old) else {
            return Ok(false);
        };
        if self.lookup(new).is_some() {
            return Ok(false);
        }
        self.sb.entries[slot].set_name(new);
        self.persist_superblock()?;
        Ok(true)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.sb.entries.iter().position(|e| e.is_named(name))
    }

    fn persist_superblock(&mut self) -> StoreResult<()> {
        self.sb.encode_into(self.sb_buf.as_mut_slice());
        self.disk.write_blocks(0, self.sb_buf.as_slice())
    }
}

fn validate_name(name: &str) -> StoreResult<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() >= NAME_CAP {
        "does not fit the name field with its terminator"
    } else if name.as_bytes().contains(&0) {
        "must not contain NUL"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
