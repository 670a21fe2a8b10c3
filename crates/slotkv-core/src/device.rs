//! Raw disk-image access.
//!
//! The image is a regular host file treated as a fixed-capacity block
//! device. On Linux it is opened with `O_DIRECT` when the filesystem
//! supports it, so every transfer must be a whole number of blocks
//! staged through buffers aligned to [`BUFFER_ALIGN`]. All higher
//! layers go through [`DiskImage::read_blocks`] / [`write_blocks`]
//! and never touch the file directly.
//!
//! [`write_blocks`]: DiskImage::write_blocks

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;

use crate::error::{StoreError, StoreResult};
use crate::format::{BSIZE, DISK_SIZE};

/// Alignment of every I/O staging buffer. Direct I/O on Linux requires
/// sector alignment; 4096 covers 4K-sector devices as well.
pub const BUFFER_ALIGN: usize = 4096;

/// Heap buffer aligned for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes at [`BUFFER_ALIGN`]. `len` must be
    /// a non-zero multiple of the block size.
    pub fn zeroed(len: usize) -> Self {
        debug_assert!(len > 0 && len % BSIZE == 0);
        let layout = Layout::from_size_align(len, BUFFER_ALIGN).unwrap();
        // SAFETY: layout has non-zero size, checked above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes for the
        // lifetime of self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}

/// Owns the open disk image and its path (kept for error context).
pub struct DiskImage {
    file: File,
    path: PathBuf,
}

impl DiskImage {
    /// Open the image at `path`, creating it at exactly [`DISK_SIZE`]
    /// zero-filled bytes when absent. An existing shorter file is
    /// extended back to the fixed capacity.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            allocate_image(path).map_err(|e| StoreError::io(path, e))?;
        }
        let file = open_rw(path).map_err(|e| StoreError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(path, e))?
            .len();
        if len < DISK_SIZE {
            file.set_len(DISK_SIZE)
                .map_err(|e| StoreError::io(path, e))?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read whole blocks starting at `first_block`. `buf.len()` must be
    /// a multiple of the block size.
    pub fn read_blocks(&self, first_block: u64, buf: &mut [u8]) -> StoreResult<()> {
        debug_assert_eq!(buf.len() % BSIZE, 0);
        read_at(&self.file, buf, first_block * BSIZE as u64)
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Write whole blocks starting at `first_block`. `buf.len()` must
    /// be a multiple of the block size.
    pub fn write_blocks(&self, first_block: u64, buf: &[u8]) -> StoreResult<()> {
        debug_assert_eq!(buf.len() % BSIZE, 0);
        write_at(&self.file, buf, first_block * BSIZE as u64)
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

/// Create the image with exclusive-create semantics and reserve the
/// full capacity. `set_len` leaves the contents reading as zero.
fn allocate_image(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(DISK_SIZE)
}

#[cfg(target_os = "linux")]
fn open_rw(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    // O_NOATIME fails unless the caller owns the file, and some
    // filesystems (tmpfs among them) reject O_DIRECT outright, so each
    // candidate is probed with one aligned read before being kept.
    for flags in [libc::O_DIRECT | libc::O_NOATIME, libc::O_DIRECT] {
        if let Ok(file) = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
        {
            if direct_probe(&file) {
                return Ok(file);
            }
        }
    }
    OpenOptions::new().read(true).write(true).open(path)
}

#[cfg(target_os = "linux")]
fn direct_probe(file: &File) -> bool {
    use std::os::unix::fs::FileExt;
    let mut block = AlignedBuf::zeroed(BSIZE);
    file.read_exact_at(block.as_mut_slice(), 0).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(not(unix))]
fn write_at(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}
