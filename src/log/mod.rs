//! Capped log: a bounded, append-only ring with tailing cursors.

pub mod channel;
pub mod cursor;

pub use channel::CappedLog;
pub use cursor::{CursorFilter, CursorId, TailCursor};
