//! Subscription manager: channel name → active cursor + dispatcher.

use crate::codec::Codec;
use crate::error::Result;
use crate::log::{CappedLog, CursorFilter, TailCursor};
use crate::types::NodeId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A consumer receives the decoded positional argument sequence of each
/// message published on its channel.
pub type Consumer = Box<dyn Fn(&[Value]) + Send + 'static>;

/// One active subscription: the cursor feeding it and the dispatcher
/// thread draining the cursor.
struct Subscription {
    cursor_id: crate::log::CursorId,
    dispatcher: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Close the cursor and wait for the dispatcher to finish. A delivery
    /// already dequeued by the dispatcher completes before this returns.
    ///
    /// A consumer may unsubscribe its own channel from inside the
    /// dispatcher; joining would then deadlock on the calling thread, so
    /// the join is skipped and the thread exits on its own once the
    /// cursor is gone.
    fn close(mut self, log: &CappedLog) {
        log.close_cursor(self.cursor_id);
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

/// Manages the subscriptions of one bus instance.
///
/// At most one subscription per channel name; re-subscribing supersedes
/// the previous one. All cursors are filtered to exclude entries carrying
/// this instance's own node id.
pub struct SubscriptionManager {
    log: Arc<CappedLog>,
    codec: Arc<dyn Codec>,
    node: NodeId,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionManager {
    pub fn new(log: Arc<CappedLog>, codec: Arc<dyn Codec>, node: NodeId) -> Self {
        Self {
            log,
            codec,
            node,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe a consumer to a channel.
    ///
    /// Registration returns as soon as the cursor is open; it never waits
    /// for a message. An existing subscription under the same name is
    /// closed first — never two live cursors for one name on one instance.
    pub fn subscribe<F>(&self, channel: &str, consumer: F) -> Result<()>
    where
        F: Fn(&[Value]) + Send + 'static,
    {
        // Supersede first: never two live cursors for one name.
        let previous = self.subscriptions.lock().remove(channel);
        if let Some(previous) = previous {
            debug!(channel, "superseding existing subscription");
            previous.close(&self.log);
        }

        let cursor = self
            .log
            .cursor(CursorFilter::channel_excluding(channel, self.node), None)?;
        let cursor_id = cursor.id();

        let dispatcher = self.spawn_dispatcher(channel.to_string(), cursor, Box::new(consumer));
        let displaced = self.subscriptions.lock().insert(
            channel.to_string(),
            Subscription {
                cursor_id,
                dispatcher: Some(dispatcher),
            },
        );
        // A concurrent subscribe can slip in between; the loser closes.
        if let Some(displaced) = displaced {
            displaced.close(&self.log);
        }

        debug!(channel, "subscribed");
        Ok(())
    }

    fn spawn_dispatcher(
        &self,
        channel: String,
        cursor: TailCursor,
        consumer: Consumer,
    ) -> JoinHandle<()> {
        let codec = Arc::clone(&self.codec);
        std::thread::spawn(move || {
            while let Ok(entry) = cursor.recv() {
                match codec.decode(&entry.payload) {
                    Ok(args) => consumer(&args),
                    Err(e) => {
                        // A bad payload is skipped, never raised into the consumer.
                        warn!(channel = %channel, error = %e, "skipping undecodable payload");
                    }
                }
            }
        })
    }

    /// Remove one subscription. Unknown names are a no-op.
    pub fn unsubscribe(&self, channel: &str) {
        let removed = self.subscriptions.lock().remove(channel);
        if let Some(subscription) = removed {
            subscription.close(&self.log);
            debug!(channel, "unsubscribed");
        }
    }

    /// Remove every subscription. Afterwards no cursor from this instance
    /// remains open.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<_> = self.subscriptions.lock().drain().collect();
        for (channel, subscription) in drained {
            subscription.close(&self.log);
            debug!(channel = %channel, "unsubscribed");
        }
    }

    /// Live subscription count.
    pub fn count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
