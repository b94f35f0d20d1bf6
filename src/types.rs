//! Core types for the session backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Position in the capped log.
///
/// Strictly increasing per log; positions of evicted entries are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position(pub u64);

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl Position {
    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }
}

/// Identifier for one bus instance.
///
/// Generated at construction unless injected through the configuration.
/// Used only for self-suppression, never for security. Two instances
/// sharing an explicit node id will suppress each other's messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.simple().to_string();
        write!(f, "NodeId({}...)", &hex[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding for published messages and stored values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Json,
    MessagePack,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::MessagePack
    }
}

/// A single entry in the capped log.
///
/// Written once, never mutated, silently evicted oldest-first when the
/// log exceeds its byte or entry cap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (assigned on append).
    pub position: Position,

    /// Logical channel name.
    pub channel: String,

    /// Which instance published this entry.
    pub node: NodeId,

    /// Encoded argument sequence.
    pub payload: Vec<u8>,

    /// When the entry was appended.
    pub timestamp: Timestamp,
}

impl LogEntry {
    /// Approximate in-memory size, counted against the log's byte cap.
    pub fn size(&self) -> u64 {
        (self.channel.len() + self.payload.len() + 16 + 8 + 8) as u64
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Entries currently buffered in the capped log.
    pub log_entries: u64,
    /// Bytes currently buffered in the capped log.
    pub log_bytes: u64,
    /// Records in the persistent key/value store.
    pub record_count: u64,
    /// Live subscriptions on this instance.
    pub subscription_count: u64,
}
