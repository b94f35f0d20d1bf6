//! Per-instance subscription registry.
//!
//! One registry per bus instance maps logical channel names to active
//! cursors on the shared capped log. Each subscription owns a dispatcher
//! thread that decodes arriving entries and invokes the consumer in
//! receipt order.
//!
//! # Example
//!
//! ```ignore
//! manager.subscribe("greet", |args| {
//!     println!("greeted with {:?}", args);
//! })?;
//!
//! // ... later
//! manager.unsubscribe("greet")?;
//! ```

mod manager;

pub use manager::{Consumer, SubscriptionManager};
