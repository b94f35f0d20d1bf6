//! # tailstore
//!
//! A pluggable session backend for real-time messaging: a cross-instance
//! publish/subscribe bus plus a durable per-client key/value store, both
//! hanging off one shared connection.
//!
//! ## Core Concepts
//!
//! - **Capped log**: a bounded, insertion-ordered ring of immutable
//!   entries, discarding oldest-first when full
//! - **Tailing cursors**: live read handles that wait for new entries
//!   instead of terminating when the log is quiet
//! - **Self-suppression**: every entry carries its publisher's node id,
//!   and subscribers filter out their own publications
//! - **Connection sharing**: all instances on one path share a single
//!   reference-counted physical connection
//!
//! ## Example
//!
//! ```ignore
//! use tailstore::{Config, Store};
//! use serde_json::json;
//!
//! let store = Store::open(Config {
//!     path: "./my-sessions".into(),
//!     ..Default::default()
//! })?;
//!
//! store.subscribe("greet", |args| {
//!     println!("greeted: {:?}", args);
//! })?;
//!
//! store.publish("greet", &[json!("hello"), json!(42)])?;
//!
//! let client = store.client("socket-1");
//! client.set("color", &json!("blue"))?;
//!
//! store.destroy()?;
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod log;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use codec::{codec_for, Codec, JsonCodec, MessagePackCodec};
pub use connection::{Connection, ConnectionRegistry};
pub use error::{Result, StoreError};
pub use log::{CappedLog, CursorFilter, CursorId, TailCursor};
pub use storage::PersistentStore;
pub use store::{Client, Config, Store};
pub use subscriptions::{Consumer, SubscriptionManager};
pub use types::*;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
