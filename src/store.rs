//! The bus instance facade tying all components together.

use crate::codec::{codec_for, Codec};
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{Result, StoreError};
use crate::log::CappedLog;
use crate::storage::PersistentStore;
use crate::subscriptions::SubscriptionManager;
use crate::types::{Encoding, NodeId, Position, StoreStats};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Store configuration.
///
/// Collection names are `collection_prefix + suffix`, matching the
/// persisted layout other deployments of the same path will expect.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connection target directory. Defaults to `./tailstore-data`,
    /// overridden by the `TAILSTORE_PATH` environment variable.
    pub path: PathBuf,

    /// Namespace prefix for collection names.
    pub collection_prefix: String,

    /// Log channel name suffix.
    pub stream_collection: String,

    /// Storage file name suffix.
    pub storage_collection: String,

    /// Capped log byte cap.
    pub max_bytes: u64,

    /// Capped log entry cap.
    pub max_entries: u64,

    /// Buffered entries per cursor before a slow subscriber is dropped.
    pub cursor_buffer: usize,

    /// Override the generated instance identifier.
    pub node_id: Option<NodeId>,

    /// Payload encoding.
    pub encoding: Encoding,
}

impl Default for Config {
    fn default() -> Self {
        let path = std::env::var("TAILSTORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./tailstore-data"));
        Self {
            path,
            collection_prefix: "socket.io.".to_string(),
            stream_collection: "stream".to_string(),
            storage_collection: "storage".to_string(),
            max_bytes: 100_000,
            max_entries: 500,
            cursor_buffer: 1000,
            node_id: None,
            encoding: Encoding::default(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 || self.max_entries == 0 {
            return Err(StoreError::InvalidConfig(
                "log caps must be non-zero".into(),
            ));
        }
        if self.cursor_buffer == 0 {
            return Err(StoreError::InvalidConfig(
                "cursor buffer must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// Lifecycle states. `open` returns a ready instance; destroy is terminal.
const STATE_READY: u8 = 0;
const STATE_DESTROYING: u8 = 1;
const STATE_DESTROYED: u8 = 2;

struct StoreInner {
    node: NodeId,
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    log: Arc<CappedLog>,
    codec: Arc<dyn Codec>,
    subscriptions: SubscriptionManager,
    clients: Mutex<HashMap<String, Client>>,
    state: AtomicU8,
}

impl StoreInner {
    fn ensure_ready(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_READY {
            Ok(())
        } else {
            Err(StoreError::Destroyed)
        }
    }

    fn storage(&self) -> &Arc<PersistentStore> {
        self.connection.storage()
    }

    /// Destroy a client immediately: tear down this instance's
    /// subscriptions, then remove the client's records and cached handle.
    fn destroy_client_now(&self, client_id: &str) -> Result<usize> {
        self.ensure_ready()?;
        self.subscriptions.unsubscribe_all();
        let removed = self.storage().remove_client(client_id)?;
        self.clients.lock().remove(client_id);
        debug!(client = client_id, removed, "client destroyed");
        Ok(removed)
    }

    fn destroy(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_READY,
                STATE_DESTROYING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| StoreError::Destroyed)?;

        self.subscriptions.unsubscribe_all();
        self.clients.lock().clear();
        self.registry.release(self.connection.path());

        self.state.store(STATE_DESTROYED, Ordering::SeqCst);
        debug!(node = %self.node, "store destroyed");
        Ok(())
    }
}

/// A bus instance: publish/subscribe over the shared capped log plus
/// per-client persistent key/value storage.
///
/// Constructing a store acquires the shared connection through the
/// registry; destroying it releases the reference, and the connection
/// closes when the last instance on its path is destroyed.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open a store against the process-wide connection registry.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_inner(config, ConnectionRegistry::global(), None)
    }

    /// Open a store against an explicit registry (isolated in tests).
    pub fn open_with(config: Config, registry: Arc<ConnectionRegistry>) -> Result<Self> {
        Self::open_inner(config, registry, None)
    }

    /// Open a store with a custom codec against an explicit registry.
    pub fn open_with_codec(
        config: Config,
        registry: Arc<ConnectionRegistry>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        Self::open_inner(config, registry, Some(codec))
    }

    fn open_inner(
        config: Config,
        registry: Arc<ConnectionRegistry>,
        codec: Option<Arc<dyn Codec>>,
    ) -> Result<Self> {
        config.validate()?;

        let node = config.node_id.unwrap_or_else(NodeId::generate);
        let codec = codec.unwrap_or_else(|| codec_for(config.encoding));

        let connection = registry.acquire(&config)?;
        let stream_name = format!("{}{}", config.collection_prefix, config.stream_collection);
        let log = connection.log_channel(
            &stream_name,
            config.max_bytes,
            config.max_entries,
            config.cursor_buffer,
        );

        let subscriptions = SubscriptionManager::new(Arc::clone(&log), Arc::clone(&codec), node);

        debug!(node = %node, stream = %stream_name, "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                node,
                registry,
                connection,
                log,
                codec,
                subscriptions,
                clients: Mutex::new(HashMap::new()),
                state: AtomicU8::new(STATE_READY),
            }),
        })
    }

    /// This instance's identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    // --- Pub/Sub ---

    /// Publish an argument sequence on a channel.
    ///
    /// Fire-and-forget: the returned position acknowledges the append,
    /// not any delivery. Subscribers on this instance never see their own
    /// publications.
    pub fn publish(&self, channel: &str, args: &[Value]) -> Result<Position> {
        self.inner.ensure_ready()?;
        let payload = self.inner.codec.encode(args)?;
        self.inner.log.append(channel, self.inner.node, payload)
    }

    /// Subscribe a consumer to a channel.
    ///
    /// Registration returns immediately; the consumer runs on a
    /// dispatcher thread, in receipt order. A prior subscription under
    /// the same name is superseded.
    pub fn subscribe<F>(&self, channel: &str, consumer: F) -> Result<()>
    where
        F: Fn(&[Value]) + Send + 'static,
    {
        self.inner.ensure_ready()?;
        self.inner.subscriptions.subscribe(channel, consumer)
    }

    /// Remove one subscription. Unknown names are a no-op.
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner.subscriptions.unsubscribe(channel);
        Ok(())
    }

    /// Remove every subscription on this instance.
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner.subscriptions.unsubscribe_all();
        Ok(())
    }

    // --- Clients ---

    /// Get the handle for a client, cached per id.
    pub fn client(&self, client_id: &str) -> Client {
        let mut clients = self.inner.clients.lock();
        clients
            .entry(client_id.to_string())
            .or_insert_with(|| Client {
                id: client_id.to_string(),
                inner: Arc::clone(&self.inner),
            })
            .clone()
    }

    /// Destroy a client's records, now or after a delay.
    ///
    /// With a delay, a single deferred timer per call performs the
    /// destroy later; calling again does not cancel a pending timer.
    pub fn destroy_client(&self, client_id: &str, expiration: Option<Duration>) -> Result<()> {
        self.inner.ensure_ready()?;
        match expiration {
            Some(delay) => {
                let inner = Arc::clone(&self.inner);
                let client_id = client_id.to_string();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    if let Err(e) = inner.destroy_client_now(&client_id) {
                        warn!(client = %client_id, error = %e, "deferred client destroy failed");
                    }
                });
                Ok(())
            }
            None => self.inner.destroy_client_now(client_id).map(|_| ()),
        }
    }

    // --- Lifecycle ---

    /// Store statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        self.inner.ensure_ready()?;
        Ok(StoreStats {
            log_entries: self.inner.log.entry_count(),
            log_bytes: self.inner.log.byte_size(),
            record_count: self.inner.storage().record_count(),
            subscription_count: self.inner.subscriptions.count() as u64,
        })
    }

    /// Destroy the store: tear down all subscriptions, drop client
    /// handles, and release the shared connection. Terminal; any further
    /// operation (including a second destroy) fails fast.
    pub fn destroy(&self) -> Result<()> {
        self.inner.destroy()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort destroy so the connection count stays correct.
        let _ = self.inner.destroy();
    }
}

/// Per-client handle over the persistent key/value store.
///
/// Values are encoded with the store's codec and addressed by the
/// composite key `client_id + key`.
#[derive(Clone)]
pub struct Client {
    id: String,
    inner: Arc<StoreInner>,
}

impl Client {
    /// Client identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up a stored value. Absent keys yield `None`, never a default.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.ensure_ready()?;
        match self.inner.storage().get(&self.id, key)? {
            Some(bytes) => Ok(Some(self.inner.codec.decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upsert a value: replace-if-exists, insert-if-absent.
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.inner.ensure_ready()?;
        let bytes = self.inner.codec.encode_value(value)?;
        self.inner.storage().set(&self.id, key, bytes)
    }

    /// Existence check without transferring the value.
    pub fn has(&self, key: &str) -> Result<bool> {
        self.inner.ensure_ready()?;
        self.inner.storage().has(&self.id, key)
    }

    /// Remove one record. Absence is not an error.
    pub fn del(&self, key: &str) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner.storage().del(&self.id, key)
    }

    /// Destroy this client's records, now or after a delay.
    pub fn destroy(&self, expiration: Option<Duration>) -> Result<()> {
        self.inner.ensure_ready()?;
        match expiration {
            Some(delay) => {
                let inner = Arc::clone(&self.inner);
                let client_id = self.id.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    if let Err(e) = inner.destroy_client_now(&client_id) {
                        warn!(client = %client_id, error = %e, "deferred client destroy failed");
                    }
                });
                Ok(())
            }
            None => self.inner.destroy_client_now(&self.id).map(|_| ()),
        }
    }
}
