//! Delivered messages and subscription handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rill_protocol::{Table, Vector};

use crate::queue::MessageQueue;

/// What a delivered message carries
///
/// One tagged variant per delivery shape; the front-ends are plain
/// functions over the same queue rather than a virtual hierarchy.
#[derive(Debug, Clone)]
pub enum MessagePayload {
    /// One row: an any-vector of cells in column order. Shared across the
    /// topics of the frame it was split from.
    Row(Arc<Vector>),

    /// A whole frame as a table (`msg_as_table` subscriptions)
    Table(Table),

    /// The raw any-vector of an event subscription, decoded downstream
    Event(Arc<Vector>),

    /// One deserialized blob row with its symbol tag
    Deserialized { symbol: String, row: Vector },
}

/// One message on a subscription queue
#[derive(Debug, Clone)]
pub struct Message {
    /// Publisher-assigned row offset; the offset of the frame's last row
    /// for table and event payloads
    pub offset: i64,
    pub payload: MessagePayload,
}

impl Message {
    pub(crate) fn row(offset: i64, row: Arc<Vector>) -> Self {
        Self {
            offset,
            payload: MessagePayload::Row(row),
        }
    }

    pub(crate) fn table(offset: i64, table: Table) -> Self {
        Self {
            offset,
            payload: MessagePayload::Table(table),
        }
    }

    /// Row count this message contributes to a coalescing window
    pub fn row_count(&self) -> usize {
        match &self.payload {
            MessagePayload::Table(t) => t.rows(),
            _ => 1,
        }
    }
}

/// Handle to a live subscription
///
/// Wraps the subscription's queue and stop flag. The polling front-end
/// hands this to the caller directly; the threaded front-ends return it for
/// queue-depth introspection and identification.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    queue: Arc<MessageQueue>,
    stopped: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: String, queue: Arc<MessageQueue>, stopped: Arc<AtomicBool>) -> Self {
        Self { id, queue, stopped }
    }

    /// Subscription identity, `host:port/table/action`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying bounded queue
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Messages currently buffered
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Whether the subscription has been torn down
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stopped_flag(&self) -> &Arc<AtomicBool> {
        &self.stopped
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("queue_depth", &self.queue.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
