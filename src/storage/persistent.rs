//! Persistent key/value store backed by an append-only operation log.
//!
//! Records are addressed by the composite key `client_id + key` and carry
//! the owning client id for bulk cleanup. The file holds a magic/version
//! header followed by length-prefixed, checksummed operations; the live
//! record map is rebuilt by replay on open and the file is compacted when
//! the operation count grows well past the live set.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the storage file.
const STORAGE_MAGIC: &[u8; 4] = b"STG\0";

/// Current storage format version.
const STORAGE_VERSION: u8 = 1;

/// Header size: magic + version.
const HEADER_SIZE: u64 = 5;

/// Sync every N writes.
const DEFAULT_SYNC_INTERVAL: u64 = 100;

/// Never compact below this many logged operations.
const COMPACT_MIN_OPS: u64 = 1024;

/// A single logged operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum StorageOp {
    Set {
        client_id: String,
        key: String,
        value: Vec<u8>,
    },
    Del {
        client_id: String,
        key: String,
    },
    RemoveClient {
        client_id: String,
    },
}

/// A live record.
#[derive(Clone, Debug)]
struct StoredRecord {
    value: Vec<u8>,
    client_id: String,
}

struct StorageInner {
    records: HashMap<String, StoredRecord>,
    writer: BufWriter<File>,
    /// Operations in the file, live or superseded.
    op_count: u64,
    writes_since_sync: u64,
}

/// Durable key/value store scoped per client.
pub struct PersistentStore {
    path: PathBuf,
    sync_interval: u64,
    inner: Mutex<StorageInner>,
}

impl PersistentStore {
    /// Open or create a storage file, replaying any existing operations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, DEFAULT_SYNC_INTERVAL)
    }

    /// Open with a custom sync interval (0 means sync every write).
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (records, op_count) = if path.exists() {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(STORAGE_MAGIC)?;
            file.write_all(&[STORAGE_VERSION])?;
            file.sync_all()?;
            (HashMap::new(), 0)
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            sync_interval: sync_interval.max(1),
            inner: Mutex::new(StorageInner {
                records,
                writer: BufWriter::new(file),
                op_count,
                writes_since_sync: 0,
            }),
        })
    }

    /// Replay the operation log into a live record map.
    ///
    /// A corrupt tail stops replay; the file is truncated back to the last
    /// valid operation so appends continue from a clean boundary.
    fn replay(path: &Path) -> Result<(HashMap<String, StoredRecord>, u64)> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != STORAGE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid storage magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != STORAGE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported storage version: {}",
                version[0]
            )));
        }

        let mut records = HashMap::new();
        let mut op_count = 0u64;
        let mut valid_end = HEADER_SIZE;

        loop {
            match Self::read_op(&mut reader) {
                Ok(op) => {
                    Self::apply(&mut records, op);
                    op_count += 1;
                    valid_end = reader.stream_position()?;
                }
                Err(StoreError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "truncating storage file at corrupt tail");
                    break;
                }
            }
        }

        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() > valid_end {
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        debug!(ops = op_count, records = records.len(), "storage replayed");
        Ok((records, op_count))
    }

    fn apply(records: &mut HashMap<String, StoredRecord>, op: StorageOp) {
        match op {
            StorageOp::Set {
                client_id,
                key,
                value,
            } => {
                records.insert(
                    composite_key(&client_id, &key),
                    StoredRecord { value, client_id },
                );
            }
            StorageOp::Del { client_id, key } => {
                records.remove(&composite_key(&client_id, &key));
            }
            StorageOp::RemoveClient { client_id } => {
                records.retain(|_, record| record.client_id != client_id);
            }
        }
    }

    // --- Operations ---

    /// Look up a value. Never invents a default.
    pub fn get(&self, client_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .get(&composite_key(client_id, key))
            .map(|record| record.value.clone()))
    }

    /// Upsert: replace-if-exists, insert-if-absent.
    pub fn set(&self, client_id: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.records.insert(
            composite_key(client_id, key),
            StoredRecord {
                value: value.clone(),
                client_id: client_id.to_string(),
            },
        );
        self.log_op(
            &mut inner,
            StorageOp::Set {
                client_id: client_id.to_string(),
                key: key.to_string(),
                value,
            },
        )
    }

    /// Existence check without transferring the value.
    pub fn has(&self, client_id: &str, key: &str) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner.records.contains_key(&composite_key(client_id, key)))
    }

    /// Remove one record. Absence is not an error.
    pub fn del(&self, client_id: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .records
            .remove(&composite_key(client_id, key))
            .is_some()
        {
            self.log_op(
                &mut inner,
                StorageOp::Del {
                    client_id: client_id.to_string(),
                    key: key.to_string(),
                },
            )?;
        }
        Ok(())
    }

    /// Remove every record owned by a client. Returns how many.
    pub fn remove_client(&self, client_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner
            .records
            .retain(|_, record| record.client_id != client_id);
        let removed = before - inner.records.len();

        if removed > 0 {
            self.log_op(
                &mut inner,
                StorageOp::RemoveClient {
                    client_id: client_id.to_string(),
                },
            )?;
        }
        Ok(removed)
    }

    /// Live record count.
    pub fn record_count(&self) -> u64 {
        self.inner.lock().records.len() as u64
    }

    /// Force all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    // --- Internals ---

    fn log_op(&self, inner: &mut StorageInner, op: StorageOp) -> Result<()> {
        Self::write_op(&mut inner.writer, &op)?;
        inner.op_count += 1;

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= self.sync_interval {
            inner.writer.flush()?;
            inner.writer.get_ref().sync_all()?;
            inner.writes_since_sync = 0;
        }

        // Compact once superseded operations dominate the file.
        if inner.op_count > COMPACT_MIN_OPS && inner.op_count > 2 * inner.records.len() as u64 {
            self.compact(inner)?;
        }
        Ok(())
    }

    /// Rewrite the file with one `Set` per live record.
    fn compact(&self, inner: &mut StorageInner) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(STORAGE_MAGIC)?;
            file.write_all(&[STORAGE_VERSION])?;

            let mut writer = BufWriter::new(file);
            for (key, record) in inner.records.iter() {
                let logical_key = key
                    .strip_prefix(record.client_id.as_str())
                    .unwrap_or(key)
                    .to_string();
                Self::write_op(
                    &mut writer,
                    &StorageOp::Set {
                        client_id: record.client_id.clone(),
                        key: logical_key,
                        value: record.value.clone(),
                    },
                )?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        inner.writer.flush()?;
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.writer = BufWriter::new(file);
        let compacted_from = inner.op_count;
        inner.op_count = inner.records.len() as u64;
        inner.writes_since_sync = 0;

        debug!(
            from = compacted_from,
            to = inner.op_count,
            "storage compacted"
        );
        Ok(())
    }

    fn write_op(writer: &mut BufWriter<File>, op: &StorageOp) -> Result<()> {
        let encoded = rmp_serde::to_vec(op).map_err(|e| StoreError::Encode(e.to_string()))?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_op(reader: &mut BufReader<File>) -> Result<StorageOp> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 100 * 1024 * 1024 {
            return Err(StoreError::InvalidFormat("storage op too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        rmp_serde::from_slice(&encoded).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Composite key: plain concatenation of client id and logical key.
fn composite_key(client_id: &str, key: &str) -> String {
    format!("{}{}", client_id, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("storage")).unwrap();

        store.set("client-1", "color", b"blue".to_vec()).unwrap();
        assert_eq!(
            store.get("client-1", "color").unwrap(),
            Some(b"blue".to_vec())
        );
        assert_eq!(store.get("client-1", "missing").unwrap(), None);
    }

    #[test]
    fn test_set_is_upsert() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("storage")).unwrap();

        store.set("c", "k", b"one".to_vec()).unwrap();
        store.set("c", "k", b"two".to_vec()).unwrap();
        assert_eq!(store.get("c", "k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_has_and_del() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("storage")).unwrap();

        assert!(!store.has("c", "k").unwrap());
        store.set("c", "k", b"v".to_vec()).unwrap();
        assert!(store.has("c", "k").unwrap());

        store.del("c", "k").unwrap();
        assert!(!store.has("c", "k").unwrap());

        // Absence is not an error.
        store.del("c", "k").unwrap();
    }

    #[test]
    fn test_remove_client_leaves_others() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("storage")).unwrap();

        store.set("alice", "a", b"1".to_vec()).unwrap();
        store.set("alice", "b", b"2".to_vec()).unwrap();
        store.set("bob", "a", b"3".to_vec()).unwrap();

        assert_eq!(store.remove_client("alice").unwrap(), 2);
        assert!(!store.has("alice", "a").unwrap());
        assert_eq!(store.get("bob", "a").unwrap(), Some(b"3".to_vec()));

        assert_eq!(store.remove_client("alice").unwrap(), 0);
    }

    #[test]
    fn test_replay_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage");

        {
            let store = PersistentStore::open(&path).unwrap();
            store.set("c", "kept", b"v".to_vec()).unwrap();
            store.set("c", "deleted", b"v".to_vec()).unwrap();
            store.del("c", "deleted").unwrap();
            store.sync().unwrap();
        }

        let store = PersistentStore::open(&path).unwrap();
        assert_eq!(store.get("c", "kept").unwrap(), Some(b"v".to_vec()));
        assert!(!store.has("c", "deleted").unwrap());
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_corrupt_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage");

        {
            let store = PersistentStore::open(&path).unwrap();
            store.set("c", "k", b"v".to_vec()).unwrap();
            store.sync().unwrap();
        }

        // Append garbage past the last valid operation.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF; 16]).unwrap();
        }

        let store = PersistentStore::open(&path).unwrap();
        assert_eq!(store.get("c", "k").unwrap(), Some(b"v".to_vec()));

        // The store stays writable after truncation.
        store.set("c", "k2", b"v2".to_vec()).unwrap();
        store.sync().unwrap();
        drop(store);

        let store = PersistentStore::open(&path).unwrap();
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_compaction_shrinks_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage");
        let store = PersistentStore::open(&path).unwrap();

        // Many overwrites of one key force superseded ops past the threshold.
        for i in 0..3000u32 {
            store.set("c", "k", i.to_le_bytes().to_vec()).unwrap();
        }
        store.sync().unwrap();
        assert_eq!(store.record_count(), 1);

        // Baseline: the same op count with all-distinct keys never compacts.
        let baseline_path = dir.path().join("baseline");
        let baseline = PersistentStore::open(&baseline_path).unwrap();
        for i in 0..3000u32 {
            baseline
                .set("c", &format!("k{}", i), i.to_le_bytes().to_vec())
                .unwrap();
        }
        baseline.sync().unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let baseline_size = std::fs::metadata(&baseline_path).unwrap().len();
        assert!(
            size < baseline_size / 2,
            "file not compacted: {} vs {} bytes",
            size,
            baseline_size
        );

        drop(store);
        let store = PersistentStore::open(&path).unwrap();
        assert_eq!(
            store.get("c", "k").unwrap(),
            Some(2999u32.to_le_bytes().to_vec())
        );
    }
}
