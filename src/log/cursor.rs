//! Tailing cursors over the capped log.

use crate::log::channel::{CappedLog, LogInner};
use crate::types::{LogEntry, NodeId};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a cursor within one log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CursorId(pub u64);

/// Filter applied at cursor-open time.
///
/// Entries must match the channel name exactly; `exclude_node` implements
/// self-suppression by comparing identifier values, so two instances
/// sharing a node id suppress each other.
#[derive(Clone, Debug)]
pub struct CursorFilter {
    pub channel: String,
    pub exclude_node: Option<NodeId>,
}

impl CursorFilter {
    /// Match every entry on a channel.
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: name.into(),
            exclude_node: None,
        }
    }

    /// Match entries on a channel not published by `node`.
    pub fn channel_excluding(name: impl Into<String>, node: NodeId) -> Self {
        Self {
            channel: name.into(),
            exclude_node: Some(node),
        }
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        if entry.channel != self.channel {
            return false;
        }
        if let Some(excluded) = self.exclude_node {
            if entry.node == excluded {
                return false;
            }
        }
        true
    }
}

/// A live, tailing read handle over the capped log.
///
/// Keeps delivering matching entries until closed; `recv` blocks while
/// the log is quiet rather than terminating. Dropping the handle
/// deregisters the cursor.
pub struct TailCursor {
    pub(crate) id: CursorId,
    pub(crate) receiver: Receiver<Arc<LogEntry>>,
    pub(crate) inner: Arc<Mutex<LogInner>>,
}

impl TailCursor {
    /// Cursor identifier.
    pub fn id(&self) -> CursorId {
        self.id
    }

    /// Receive the next matching entry (blocking).
    ///
    /// Errors once the cursor is closed, dropped for falling behind, or
    /// the owning connection shuts down.
    pub fn recv(&self) -> Result<Arc<LogEntry>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an entry (non-blocking).
    pub fn try_recv(&self) -> Result<Arc<LogEntry>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Arc<LogEntry>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Close the cursor explicitly.
    pub fn close(self) {
        // Drop does the deregistration.
    }
}

impl Drop for TailCursor {
    fn drop(&mut self) {
        CappedLog::deregister(&self.inner, self.id);
    }
}
