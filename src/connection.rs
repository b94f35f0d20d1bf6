//! Shared physical connections and their reference-counting registry.
//!
//! A connection is a locked on-disk directory holding the storage file,
//! with the capped log living in-process on top of it. All bus instances
//! opened against the same path through one registry share a single
//! connection; it is opened on first acquisition and shut down when the
//! last reference is released.

use crate::error::{Result, StoreError};
use crate::log::CappedLog;
use crate::storage::PersistentStore;
use crate::store::Config;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Magic bytes for the connection manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"TLS\0";

/// Current manifest version.
const MANIFEST_VERSION: u8 = 1;

/// One physical connection: exclusive directory lock, named capped log
/// channels, and persistent storage.
pub struct Connection {
    path: PathBuf,
    lock_file: File,
    logs: Mutex<HashMap<String, Arc<CappedLog>>>,
    storage: Arc<PersistentStore>,
}

impl Connection {
    fn open(config: &Config, canonical_path: PathBuf) -> Result<Self> {
        Self::init_manifest(&canonical_path)?;
        let lock_file = Self::acquire_lock(&canonical_path)?;

        let storage_name = format!("{}{}", config.collection_prefix, config.storage_collection);
        let storage = Arc::new(PersistentStore::open(canonical_path.join(storage_name))?);

        debug!(path = %canonical_path.display(), "connection opened");
        Ok(Self {
            path: canonical_path,
            lock_file,
            logs: Mutex::new(HashMap::new()),
            storage,
        })
    }

    /// The canonical path this connection is keyed on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get or create a named log channel. All instances asking for the
    /// same name share one physical log; the caps of the first creator
    /// apply.
    pub fn log_channel(
        &self,
        name: &str,
        max_bytes: u64,
        max_entries: u64,
        cursor_buffer: usize,
    ) -> Arc<CappedLog> {
        let mut logs = self.logs.lock();
        Arc::clone(logs.entry(name.to_string()).or_insert_with(|| {
            debug!(channel = name, "log channel created");
            Arc::new(CappedLog::new(max_bytes, max_entries, cursor_buffer))
        }))
    }

    /// The shared persistent store.
    pub fn storage(&self) -> &Arc<PersistentStore> {
        &self.storage
    }

    /// Disconnect every cursor and sync storage. Open cursors become
    /// invalid; the connection does not reconnect.
    fn shutdown(&self) {
        let logs: Vec<_> = self.logs.lock().drain().collect();
        for (_, log) in logs {
            log.shutdown();
        }
        if let Err(e) = self.storage.sync() {
            warn!(error = %e, "storage sync failed during shutdown");
        }
        // Free the lock now; a lingering handle must not block reopening.
        let _ = self.lock_file.unlock();
        debug!(path = %self.path.display(), "connection closed");
    }

    fn init_manifest(path: &Path) -> Result<()> {
        use std::io::{Read, Write};

        let manifest_path = path.join("MANIFEST");
        if manifest_path.exists() {
            let mut file = File::open(manifest_path)?;
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if &magic != MANIFEST_MAGIC {
                return Err(StoreError::InvalidFormat("Invalid manifest magic".into()));
            }
            let mut version = [0u8; 1];
            file.read_exact(&mut version)?;
            if version[0] != MANIFEST_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported manifest version: {}",
                    version[0]
                )));
            }
        } else {
            let mut file = File::create(manifest_path)?;
            file.write_all(MANIFEST_MAGIC)?;
            file.write_all(&[MANIFEST_VERSION])?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

struct ConnectionEntry {
    connection: Arc<Connection>,
    refs: usize,
}

/// Reference-counting registry of physical connections.
///
/// Explicit and injectable: tests construct an isolated registry per run;
/// the process-wide default serves the common case.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<PathBuf, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default registry.
    pub fn global() -> Arc<ConnectionRegistry> {
        static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConnectionRegistry::new())))
    }

    /// Acquire a connection for the configured path, opening it on first
    /// acquisition and bumping the live count otherwise.
    pub fn acquire(&self, config: &Config) -> Result<Arc<Connection>> {
        fs::create_dir_all(&config.path)?;
        let canonical = config.path.canonicalize()?;

        let mut connections = self.connections.lock();
        if let Some(entry) = connections.get_mut(&canonical) {
            entry.refs += 1;
            debug!(path = %canonical.display(), refs = entry.refs, "connection shared");
            return Ok(Arc::clone(&entry.connection));
        }

        let connection = Arc::new(Connection::open(config, canonical.clone())?);
        connections.insert(
            canonical,
            ConnectionEntry {
                connection: Arc::clone(&connection),
                refs: 1,
            },
        );
        Ok(connection)
    }

    /// Release one reference; the connection shuts down when the count
    /// reaches zero. Releasing an unknown path is a no-op.
    pub fn release(&self, path: &Path) {
        let mut connections = self.connections.lock();
        match connections.get_mut(path) {
            Some(entry) if entry.refs > 1 => {
                entry.refs -= 1;
                debug!(path = %path.display(), refs = entry.refs, "connection released");
            }
            Some(_) => {
                let entry = connections.remove(path).expect("entry present");
                // Shut down while still holding the registry lock: an
                // acquire racing this release must not observe the file
                // lock still held after finding no entry.
                entry.connection.shutdown();
            }
            None => {
                warn!(path = %path.display(), "releasing unknown connection");
            }
        }
    }

    /// Open connections in this registry.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            path: dir.path().join("data"),
            ..Default::default()
        }
    }

    #[test]
    fn test_acquire_shares_connection() {
        let dir = TempDir::new().unwrap();
        let registry = ConnectionRegistry::new();
        let config = config(&dir);

        let a = registry.acquire(&config).unwrap();
        let b = registry.acquire(&config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_release_closes_at_zero() {
        let dir = TempDir::new().unwrap();
        let registry = ConnectionRegistry::new();
        let config = config(&dir);

        let a = registry.acquire(&config).unwrap();
        let _b = registry.acquire(&config).unwrap();

        registry.release(a.path());
        assert_eq!(registry.connection_count(), 1);

        let log = a.log_channel("stream", 100_000, 500, 64);
        registry.release(a.path());
        assert_eq!(registry.connection_count(), 0);

        // The shared log is now shut down.
        assert!(log
            .append("c", crate::types::NodeId::generate(), vec![])
            .is_err());
    }

    #[test]
    fn test_log_channels_shared_by_name() {
        let dir = TempDir::new().unwrap();
        let registry = ConnectionRegistry::new();
        let conn = registry.acquire(&config(&dir)).unwrap();

        let a = conn.log_channel("stream", 100_000, 500, 64);
        let b = conn.log_channel("stream", 100_000, 500, 64);
        let other = conn.log_channel("other", 100_000, 500, 64);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.release(Path::new("/nonexistent"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_second_registry_sees_lock() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let first = ConnectionRegistry::new();
        let _held = first.acquire(&config).unwrap();

        let second = ConnectionRegistry::new();
        assert!(matches!(
            second.acquire(&config),
            Err(StoreError::Locked)
        ));
    }

    #[test]
    fn test_concurrent_release_and_acquire() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let config = config(&dir);

        for _ in 0..50 {
            let held = registry.acquire(&config).unwrap();
            let path = held.path().to_path_buf();

            let opener_registry = Arc::clone(&registry);
            let opener_config = config.clone();
            let opener = std::thread::spawn(move || opener_registry.acquire(&opener_config));

            registry.release(&path);

            // Whether the opener shared the old connection or reopened a
            // fresh one, it must never see a spurious lock failure.
            let reopened = opener.join().unwrap().unwrap();
            registry.release(reopened.path());
            assert_eq!(registry.connection_count(), 0);
        }
    }

    #[test]
    fn test_reacquire_after_close() {
        let dir = TempDir::new().unwrap();
        let registry = ConnectionRegistry::new();
        let config = config(&dir);

        let a = registry.acquire(&config).unwrap();
        let path = a.path().to_path_buf();
        registry.release(&path);

        let b = registry.acquire(&config).unwrap();
        assert!(b
            .log_channel("stream", 100_000, 500, 64)
            .append("c", crate::types::NodeId::generate(), vec![])
            .is_ok());
    }
}
