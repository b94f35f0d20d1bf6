//! Durable per-client key/value storage.

pub mod persistent;

pub use persistent::PersistentStore;
