//! The capped log itself: a bounded ring buffer of immutable entries
//! with live fan-out to registered cursors.
//!
//! Append and fan-out happen under one lock, so every cursor observes
//! entries in append order and replay-then-live registration cannot lose
//! or duplicate an entry.

use crate::error::{Result, StoreError};
use crate::log::cursor::{CursorFilter, CursorId, TailCursor};
use crate::types::{LogEntry, NodeId, Position, Timestamp};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registered cursor state.
struct CursorSlot {
    filter: CursorFilter,
    sender: Sender<Arc<LogEntry>>,
}

impl CursorSlot {
    /// Try to deliver an entry. Returns false if the cursor fell behind
    /// or its receiver is gone (cursor will be dropped).
    fn try_send(&self, entry: Arc<LogEntry>) -> bool {
        self.sender.try_send(entry).is_ok()
    }
}

pub(crate) struct LogInner {
    ring: VecDeque<Arc<LogEntry>>,
    bytes: u64,
    next_position: Position,
    cursors: HashMap<CursorId, CursorSlot>,
    next_cursor_id: u64,
    closed: bool,
}

/// A capped, append-only log with tailing cursors.
///
/// Bounded by both bytes and entry count; oldest entries are silently
/// evicted when either cap is exceeded. The newest entry always survives.
pub struct CappedLog {
    max_bytes: u64,
    max_entries: u64,
    cursor_buffer: usize,
    inner: Arc<Mutex<LogInner>>,
}

impl CappedLog {
    /// Create a capped log with the given caps and per-cursor buffer.
    pub fn new(max_bytes: u64, max_entries: u64, cursor_buffer: usize) -> Self {
        Self {
            max_bytes,
            max_entries,
            cursor_buffer,
            inner: Arc::new(Mutex::new(LogInner {
                ring: VecDeque::new(),
                bytes: 0,
                next_position: Position(0),
                cursors: HashMap::new(),
                next_cursor_id: 1,
                closed: false,
            })),
        }
    }

    /// Append an entry and wake matching cursors.
    ///
    /// Fire-and-forget: no delivery acknowledgment is returned. A cursor
    /// whose buffer is full is dropped rather than blocking the writer.
    pub fn append(&self, channel: &str, node: NodeId, payload: Vec<u8>) -> Result<Position> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::ConnectionClosed);
        }

        let position = inner.next_position;
        inner.next_position = position.next();

        let entry = Arc::new(LogEntry {
            position,
            channel: channel.to_string(),
            node,
            payload,
            timestamp: Timestamp::now(),
        });

        inner.bytes += entry.size();
        inner.ring.push_back(Arc::clone(&entry));

        // Evict oldest while over either cap; the newest entry always stays.
        while inner.ring.len() > 1
            && (inner.ring.len() as u64 > self.max_entries || inner.bytes > self.max_bytes)
        {
            if let Some(evicted) = inner.ring.pop_front() {
                inner.bytes -= evicted.size();
            }
        }

        // Fan out to matching cursors, dropping any that fell behind.
        let mut to_remove = Vec::new();
        for (id, slot) in inner.cursors.iter() {
            if slot.filter.matches(&entry) && !slot.try_send(Arc::clone(&entry)) {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            warn!(cursor = id.0, "dropping slow cursor");
            inner.cursors.remove(&id);
        }

        Ok(position)
    }

    /// Open a live cursor.
    ///
    /// `from = None` starts at "now" (no history); `Some(p)` first replays
    /// buffered entries at or after `p` that match the filter, then streams
    /// live. Replay and registration happen under one lock.
    pub fn cursor(&self, filter: CursorFilter, from: Option<Position>) -> Result<TailCursor> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::ConnectionClosed);
        }

        let id = CursorId(inner.next_cursor_id);
        inner.next_cursor_id += 1;

        let (sender, receiver) = bounded(self.cursor_buffer);

        if let Some(start) = from {
            for entry in inner.ring.iter() {
                if entry.position >= start && filter.matches(entry) {
                    if sender.try_send(Arc::clone(entry)).is_err() {
                        warn!(cursor = id.0, "cursor buffer overflowed during replay");
                        break;
                    }
                }
            }
        }

        debug!(cursor = id.0, channel = %filter.channel, "cursor opened");
        inner.cursors.insert(id, CursorSlot { filter, sender });

        Ok(TailCursor {
            id,
            receiver,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Deregister a cursor. Unknown ids are a no-op.
    pub fn close_cursor(&self, id: CursorId) {
        Self::deregister(&self.inner, id);
    }

    pub(crate) fn deregister(inner: &Mutex<LogInner>, id: CursorId) {
        let mut inner = inner.lock();
        if inner.cursors.remove(&id).is_some() {
            debug!(cursor = id.0, "cursor closed");
        }
    }

    /// Shut the log down: disconnect every cursor and reject further
    /// appends. Called when the owning connection closes.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.cursors.len();
        inner.cursors.clear();
        inner.ring.clear();
        inner.bytes = 0;
        debug!(cursors = dropped, "capped log shut down");
    }

    /// Entries currently buffered.
    pub fn entry_count(&self) -> u64 {
        self.inner.lock().ring.len() as u64
    }

    /// Bytes currently buffered.
    pub fn byte_size(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Live cursors.
    pub fn cursor_count(&self) -> usize {
        self.inner.lock().cursors.len()
    }
}
