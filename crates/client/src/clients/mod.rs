//! Delivery front-ends
//!
//! Four clients over the same engine, differing only in how the
//! subscription queue is drained:
//!
//! - [`PollingClient`] hands the queue to the caller
//! - [`ThreadedClient`] drains on one thread per subscription
//! - [`ThreadPooledClient`] drains on N threads sharing one queue
//! - [`EventClient`] drains on one thread and decodes event tuples
//!
//! Every drain loop terminates on the stop flag or the queue sentinel and
//! re-closes the queue on the way out so sibling drain threads cascade.

mod event;
mod polling;
mod pooled;
mod threaded;

pub use event::EventClient;
pub use polling::PollingClient;
pub use pooled::ThreadPooledClient;
pub use threaded::ThreadedClient;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::config::{ClientConfig, SubscribeOptions, DEFAULT_ACTION_NAME};
use crate::core::StreamingCore;
use crate::message::{Message, MessagePayload, SubscriptionHandle};
use crate::metrics::ClientMetricsSnapshot;
use crate::queue::{MessageQueue, Pop};
use crate::session::Connector;
use crate::Result;

// =============================================================================
// Shared client plumbing
// =============================================================================

/// The engine handle every front-end wraps. Dropping it tears the whole
/// client down (idempotent with an explicit `exit`).
pub(crate) struct SharedClient {
    core: Arc<StreamingCore>,
}

impl SharedClient {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self {
            core: StreamingCore::new(config, connector)?,
        })
    }

    pub fn core(&self) -> &Arc<StreamingCore> {
        &self.core
    }

    pub fn subscribe(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.core.subscribe_internal(host, port, table, options)
    }

    pub fn unsubscribe(&self, host: &str, port: u16, table: &str, action: &str) -> Result<()> {
        let action = if action.is_empty() {
            DEFAULT_ACTION_NAME
        } else {
            action
        };
        self.core.unsubscribe_internal(host, port, table, action)
    }

    pub fn exit(&self) {
        self.core.exit();
    }

    pub fn is_exit(&self) -> bool {
        self.core.is_exit()
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Spawn a drain thread and register it with the subscription so
    /// teardown joins it.
    pub fn spawn_drain(
        &self,
        handle: &SubscriptionHandle,
        name: &str,
        body: impl FnOnce() + Send + 'static,
    ) {
        match std::thread::Builder::new().name(name.into()).spawn(body) {
            Ok(join) => self.core.registry.add_drain_thread(handle.queue(), join),
            Err(e) => error!(err = %e, "failed to spawn drain thread"),
        }
    }
}

impl Drop for SharedClient {
    fn drop(&mut self) {
        self.core.exit();
    }
}

/// Batch window for the threaded front-end: `max(1, throttle * 1000)` ms,
/// or zero (tight-loop pop) when `batch_size` is zero.
pub(crate) fn throttle_window(batch_size: usize, throttle: f64) -> Duration {
    if batch_size == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(((throttle * 1000.0) as u64).max(1))
    }
}

// =============================================================================
// Drain loops
// =============================================================================

/// Per-message drain shared by the threaded and pooled front-ends
pub(crate) fn message_drain(
    core: Arc<StreamingCore>,
    queue: Arc<MessageQueue>,
    stopped: Arc<AtomicBool>,
    msg_as_table: bool,
    mut handler: impl FnMut(&Message),
) {
    while !core.is_exit() && !stopped.load(Ordering::Acquire) {
        match queue.pop_blocking() {
            Pop::Some(mut msg) => {
                if stopped.load(Ordering::Acquire) {
                    break;
                }
                if msg_as_table {
                    merge_queued_tables(&queue, &mut msg);
                }
                handler(&msg);
            }
            Pop::Closed => break,
            Pop::Timeout => continue,
        }
    }
    queue.close();
}

/// Fold any tables already buffered into the message just popped
fn merge_queued_tables(queue: &MessageQueue, msg: &mut Message) {
    let MessagePayload::Table(table) = &mut msg.payload else {
        return;
    };
    let mut more = Vec::new();
    if let Pop::Some(_) = queue.pop_batch(&mut more, Duration::ZERO) {
        for extra in more {
            if let MessagePayload::Table(t) = extra.payload {
                table.append_rows(&t);
            }
        }
    }
}

/// Row-mode batch drain: up to `batch_size` messages per callback within
/// the throttle window
pub(crate) fn batch_drain(
    core: Arc<StreamingCore>,
    queue: Arc<MessageQueue>,
    stopped: Arc<AtomicBool>,
    throttle: Duration,
    mut handler: impl FnMut(&[Message]),
) {
    let mut msgs: Vec<Message> = Vec::new();
    while !core.is_exit() && !stopped.load(Ordering::Acquire) {
        msgs.clear();
        match queue.pop_batch(&mut msgs, throttle) {
            Pop::Some(_) => {
                if stopped.load(Ordering::Acquire) {
                    break;
                }
                if !msgs.is_empty() {
                    handler(&msgs);
                }
            }
            Pop::Timeout => continue,
            Pop::Closed => break,
        }
    }
    queue.close();
}

/// Table-mode drain: coalesce tables column-wise within the throttle
/// window, stopping at `target_rows`; rows beyond the target spill into
/// the next callback.
pub(crate) fn table_drain(
    core: Arc<StreamingCore>,
    queue: Arc<MessageQueue>,
    stopped: Arc<AtomicBool>,
    throttle: Duration,
    target_rows: usize,
    mut handler: impl FnMut(&[Message]),
) {
    let mut pending: Option<Message> = None;
    let mut closing = false;

    while !closing && !core.is_exit() && !stopped.load(Ordering::Acquire) {
        let mut first = match pending.take() {
            Some(msg) => msg,
            None => match queue.pop(throttle) {
                Pop::Some(msg) => msg,
                Pop::Timeout => continue,
                Pop::Closed => break,
            },
        };
        if stopped.load(Ordering::Acquire) {
            break;
        }

        let mut deliver = true;
        let window_start = Instant::now();
        loop {
            if !matches!(first.payload, MessagePayload::Table(_)) {
                warn!("table-mode drain popped a non-table message");
                break;
            }
            if target_rows > 0 && first.row_count() >= target_rows {
                if first.row_count() > target_rows {
                    pending = Some(split_table_message(&mut first, target_rows));
                }
                break;
            }
            let remaining = throttle.saturating_sub(window_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match queue.pop(remaining) {
                Pop::Some(extra) => {
                    if stopped.load(Ordering::Acquire) {
                        closing = true;
                        deliver = false;
                        break;
                    }
                    if let (MessagePayload::Table(dst), MessagePayload::Table(src)) =
                        (&mut first.payload, &extra.payload)
                    {
                        dst.append_rows(src);
                    }
                }
                Pop::Timeout => break,
                Pop::Closed => {
                    // deliver what was already coalesced, then exit
                    closing = true;
                    break;
                }
            }
        }

        if deliver {
            handler(std::slice::from_ref(&first));
        }
    }
    queue.close();
}

/// Split everything past `target_rows` off into a follow-up message
fn split_table_message(msg: &mut Message, target_rows: usize) -> Message {
    let MessagePayload::Table(table) = &mut msg.payload else {
        unreachable!("caller checked the payload is a table");
    };
    let rest = table.split_off_rows(target_rows);
    Message::table(msg.offset + target_rows as i64, rest)
}
