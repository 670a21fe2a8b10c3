//! Integration tests: persistence, crash recovery, and the log-pair
//! state machine across store restarts.
//!
//! Crashes are simulated two ways: `mem::forget` skips the drop-time
//! compaction (the image is left exactly as the last append wrote it),
//! and a raw superblock edit shrinks the log's recorded size to fake a
//! record torn mid-write.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use slotkv_core::format::{BSIZE, ENTRY_SIZE, NAME_CAP, SLOT_COUNT};
use slotkv_core::{BlockFile, KvStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn image_path(dir: &TempDir) -> PathBuf {
    dir.path().join("img")
}

fn read_superblock(path: &Path) -> Vec<u8> {
    let mut file = OpenOptions::new().read(true).open(path).unwrap();
    let mut block = vec![0u8; BSIZE];
    file.read_exact(&mut block).unwrap();
    block
}

fn entry_offset(slot: usize) -> usize {
    16 + slot * ENTRY_SIZE
}

fn slot_named(block: &[u8], name: &str) -> Option<usize> {
    (0..SLOT_COUNT).find(|&slot| {
        let off = entry_offset(slot);
        let used = u32::from_le_bytes(block[off + NAME_CAP..off + NAME_CAP + 4].try_into().unwrap());
        let stored = &block[off..off + name.len()];
        used != 0 && stored == name.as_bytes() && block[off + name.len()] == 0
    })
}

/// Shrink the recorded size of the named file by `by` bytes, as a
/// crash that tore the last record would have left it.
fn shrink_named_fsize(path: &Path, name: &str, by: u64) {
    let mut block = read_superblock(path);
    let slot = slot_named(&block, name).expect("named file not present in superblock");
    let off = entry_offset(slot) + NAME_CAP + 12;
    let fsize = u64::from_le_bytes(block[off..off + 8].try_into().unwrap());
    block[off..off + 8].copy_from_slice(&(fsize - by).to_le_bytes());

    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&block).unwrap();
}

// ---------------------------------------------------------------------------
// Persistence across restarts
// ---------------------------------------------------------------------------

#[test]
fn persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"22").unwrap();
    }
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b"), Some(b"22".to_vec()));
    assert_eq!(store.len(), 2);
}

#[test]
fn remove_persists() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"22").unwrap();
        store.close().unwrap();
    }
    {
        let mut store = KvStore::open(&path, false).unwrap();
        assert!(store.remove(b"a").unwrap());
        store.close().unwrap();
    }
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"a"), None);
    assert_eq!(store.len(), 1);
    assert_eq!(store.list(), vec![b"b".to_vec()]);
}

#[test]
fn overwrite_keeps_latest_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        store.close().unwrap();
    }
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"k"), Some(b"v2".to_vec()));
    assert_eq!(store.len(), 1);
}

#[test]
fn reopen_without_mutations_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"stable", b"value").unwrap();
        store.close().unwrap();
    }
    for _ in 0..3 {
        let store = KvStore::open(&path, false).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"stable"), Some(b"value".to_vec()));
        store.close().unwrap();
    }
}

#[test]
fn format_discards_existing_contents() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"a", b"1").unwrap();
        store.close().unwrap();
    }
    let store = KvStore::open(&path, true).unwrap();
    assert_eq!(store.len(), 0);
    assert_eq!(store.get(b"a"), None);
}

// ---------------------------------------------------------------------------
// Image layout
// ---------------------------------------------------------------------------

#[test]
fn fresh_image_has_unused_slots_and_first_put_lands_in_slot_zero() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);

    {
        let blocks = BlockFile::init(&path, false).unwrap();
        assert!(blocks.open("current").is_none());
        assert!(blocks.open("new").is_none());
    }
    let block = read_superblock(&path);
    for slot in 0..SLOT_COUNT {
        let off = entry_offset(slot) + NAME_CAP;
        assert_eq!(&block[off..off + 4], &[0, 0, 0, 0]);
    }

    let mut store = KvStore::open(&path, false).unwrap();
    store.put(b"first", b"record").unwrap();
    mem::forget(store); // crash before the drop-time compaction moves the log

    let block = read_superblock(&path);
    assert_eq!(slot_named(&block, "current"), Some(0));
    let blocks = BlockFile::init(&path, false).unwrap();
    assert_eq!(blocks.open("current").unwrap().slot(), 0);
}

// ---------------------------------------------------------------------------
// Torn tails
// ---------------------------------------------------------------------------

#[test]
fn torn_tail_inside_only_record_recovers_empty() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);

    let mut store = KvStore::open(&path, false).unwrap();
    store.put(b"x", b"X").unwrap();
    mem::forget(store);

    shrink_named_fsize(&path, "current", 3);

    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"x"), None);
    assert_eq!(store.len(), 0);
    store.close().unwrap();

    // the re-emitted log replays to the same (empty) map on its own
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.len(), 0);
}

#[test]
fn torn_tail_keeps_fully_written_records() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);

    let mut store = KvStore::open(&path, false).unwrap();
    store.put(b"a", b"1").unwrap();
    store.put(b"x", b"X").unwrap();
    mem::forget(store);

    shrink_named_fsize(&path, "current", 3);

    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(store.get(b"x"), None);
    assert_eq!(store.len(), 1);
    store.close().unwrap();

    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(store.len(), 1);
}

// ---------------------------------------------------------------------------
// Log-pair state machine
// ---------------------------------------------------------------------------

#[test]
fn staged_log_is_adopted_when_current_is_missing() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"22").unwrap();
        store.close().unwrap();
    }
    {
        // Crash window between remove("current") and the rename.
        let mut blocks = BlockFile::init(&path, false).unwrap();
        assert!(blocks.rename("current", "new").unwrap());
    }
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b"), Some(b"22".to_vec()));
    assert_eq!(store.len(), 2);

    let block = read_superblock(&path);
    assert!(slot_named(&block, "new").is_none());
    assert!(slot_named(&block, "current").is_some());
}

#[test]
fn leftover_staging_file_is_discarded_when_current_exists() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    {
        let mut store = KvStore::open(&path, false).unwrap();
        store.put(b"kept", b"yes").unwrap();
        store.close().unwrap();
    }
    {
        // Crash window before remove("current"): both files exist and
        // the staging copy holds stale data.
        let mut blocks = BlockFile::init(&path, false).unwrap();
        let staged = blocks.create("new").unwrap().unwrap();
        blocks.write(&staged, b"\x05\x00\x00\x00\x05\x00\x00\x00stalestale").unwrap();
    }
    let store = KvStore::open(&path, false).unwrap();
    assert_eq!(store.get(b"kept"), Some(b"yes".to_vec()));
    assert_eq!(store.len(), 1);

    let block = read_superblock(&path);
    assert!(slot_named(&block, "new").is_none());
}

// ---------------------------------------------------------------------------
// Randomized model check
// ---------------------------------------------------------------------------

#[test]
fn random_ops_match_model_across_restarts() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);

    let mut rng = StdRng::seed_from_u64(0x5107);
    let mut model: std::collections::HashMap<Vec<u8>, Vec<u8>> = Default::default();
    let mut store = KvStore::open(&path, false).unwrap();

    for _round in 0..3 {
        for _ in 0..200 {
            let key = format!("key{:02}", rng.gen_range(0..40u32)).into_bytes();
            if rng.gen_bool(0.3) {
                let expected = model.remove(&key).is_some();
                assert_eq!(store.remove(&key).unwrap(), expected);
            } else {
                let len = rng.gen_range(1..64usize);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                store.put(&key, &value).unwrap();
                model.insert(key, value);
            }
        }

        assert_eq!(store.len(), model.len());
        for (key, value) in &model {
            assert_eq!(store.get(key), Some(value.clone()));
        }
        let mut keys = store.list();
        keys.sort();
        let mut expected: Vec<_> = model.keys().cloned().collect();
        expected.sort();
        assert_eq!(keys, expected);

        store.close().unwrap();
        store = KvStore::open(&path, false).unwrap();
        assert_eq!(store.len(), model.len());
        for (key, value) in &model {
            assert_eq!(store.get(key), Some(value.clone()));
        }
    }
}
