//! Log-record codec and replay.
//!
//! A record is an 8-byte `[klen, vlen]` header followed by the key and
//! value bytes; `vlen == 0` marks a tombstone. Records are serialized
//! into one buffer and appended with a single block-file write, so a
//! record either lands with its size accounted in the superblock or
//! not at all.
//!
//! Replay walks the active log until end of file. A short read on the
//! header or either payload — or a header that cannot belong to a
//! well-formed record — marks the log as torn and ends the walk; the
//! caller decides what to do with the records recovered so far.

use hashbrown::HashMap;

use crate::blockfile::{BlockFile, FileHandle};
use crate::error::{StoreError, StoreResult};
use crate::format::{
    decode_record_header, encode_record_header, MAX_RECORD_COMPONENT, RECORD_HEADER_SIZE,
};

/// What a replay pass found.
#[derive(Debug)]
pub(crate) struct ReplaySummary {
    /// Complete records applied to the map.
    pub records: usize,
    /// Bytes of log consumed by those records.
    pub bytes: u64,
    /// True when the log ended mid-record.
    pub torn: bool,
}

/// Serialize one record, validating sizes before any allocation.
pub(crate) fn encode_record(key: &[u8], value: &[u8]) -> StoreResult<Vec<u8>> {
    if key.is_empty() {
        return Err(StoreError::EmptyKey);
    }
    if key.len() > MAX_RECORD_COMPONENT {
        return Err(StoreError::OversizedRecord {
            component: "key",
            len: key.len(),
            max: MAX_RECORD_COMPONENT,
        });
    }
    if value.len() > MAX_RECORD_COMPONENT {
        return Err(StoreError::OversizedRecord {
            component: "value",
            len: value.len(),
            max: MAX_RECORD_COMPONENT,
        });
    }

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
    buf.extend_from_slice(&encode_record_header(key.len(), value.len()));
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(buf)
}

/// Append one record to `file`. Returns the record's size in bytes.
pub(crate) fn append_record(
    blocks: &mut BlockFile,
    file: &FileHandle,
    key: &[u8],
    value: &[u8],
) -> StoreResult<u64> {
    let buf = encode_record(key, value)?;
    blocks.write(file, &buf)?;
    Ok(buf.len() as u64)
}

/// Write every live entry of `map` as one non-tombstone record.
/// Returns the total bytes written.
pub(crate) fn write_snapshot(
    blocks: &mut BlockFile,
    file: &FileHandle,
    map: &HashMap<Vec<u8>, Vec<u8>>,
) -> StoreResult<u64> {
    let mut total = 0u64;
    for (key, value) in map {
        total += append_record(blocks, file, key, value)?;
    }
    Ok(total)
}

/// Replay `file` into `map` from the current cursor until end of file
/// or a torn tail.
pub(crate) fn replay(
    blocks: &mut BlockFile,
    file: &mut FileHandle,
    map: &mut HashMap<Vec<u8>, Vec<u8>>,
) -> StoreResult<ReplaySummary> {
    let mut summary = ReplaySummary {
        records: 0,
        bytes: 0,
        torn: false,
    };

    while !blocks.eof(file) {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        if blocks.read(file, &mut header)? != RECORD_HEADER_SIZE {
            summary.torn = true;
            break;
        }
        let (klen, vlen) = decode_record_header(&header);
        if klen <= 0 || vlen < 0 {
            summary.torn = true;
            break;
        }
        let (klen, vlen) = (klen as usize, vlen as usize);

        // The payload must fit in what is left of the file; checking
        // first keeps a torn header from driving a giant allocation.
        let remaining = blocks.fsize(file) - file.cursor();
        if (klen + vlen) as u64 > remaining {
            summary.torn = true;
            break;
        }

        let mut key = vec![0u8; klen];
        if blocks.read(file, &mut key)? != klen {
            summary.torn = true;
            break;
        }
        if vlen > 0 {
            let mut value = vec![0u8; vlen];
            if blocks.read(file, &mut value)? != vlen {
                summary.torn = true;
                break;
            }
            map.insert(key, value);
        } else {
            map.remove(&key);
        }

        summary.records += 1;
        summary.bytes += (RECORD_HEADER_SIZE + klen + vlen) as u64;
    }

    Ok(summary)
}
