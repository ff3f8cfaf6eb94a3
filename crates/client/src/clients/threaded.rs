//! Threaded front-end

use std::sync::Arc;

use crate::clients::{batch_drain, message_drain, table_drain, throttle_window, SharedClient};
use crate::config::{ClientConfig, SubscribeOptions};
use crate::message::{Message, SubscriptionHandle};
use crate::metrics::ClientMetricsSnapshot;
use crate::session::Connector;
use crate::Result;

/// Subscription client with one drain thread per subscription.
///
/// Two delivery styles: [`subscribe`](Self::subscribe) invokes the handler
/// once per message; [`subscribe_batch`](Self::subscribe_batch) gathers up
/// to `batch_size` messages inside a `throttle`-second window per call. In
/// table mode the batch variant coalesces whole tables column-wise instead.
pub struct ThreadedClient {
    inner: SharedClient,
}

impl ThreadedClient {
    pub fn new(listening_port: i32, connector: Arc<dyn Connector>) -> Result<Self> {
        let config = ClientConfig {
            listening_port,
            ..ClientConfig::default()
        };
        Self::with_config(config, connector)
    }

    pub fn with_config(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self {
            inner: SharedClient::new(config, connector)?,
        })
    }

    /// Subscribe with a per-message handler
    pub fn subscribe(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: SubscribeOptions,
        mut handler: impl FnMut(&Message) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        // Per-message delivery needs no queue batching
        let options = options.with_batch_size(1);
        let handle = self.inner.subscribe(host, port, table, &options)?;

        let core = Arc::clone(self.inner.core());
        let queue = Arc::clone(handle.queue());
        let stopped = Arc::clone(handle.stopped_flag());
        let msg_as_table = options.msg_as_table;
        self.inner.spawn_drain(&handle, "rill-drain", move || {
            message_drain(core, queue, stopped, msg_as_table, move |msg| handler(msg));
        });
        Ok(handle)
    }

    /// Subscribe with a batch handler
    pub fn subscribe_batch(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: SubscribeOptions,
        mut handler: impl FnMut(&[Message]) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        let handle = self.inner.subscribe(host, port, table, &options)?;
        let throttle = throttle_window(options.batch_size, options.throttle);

        let core = Arc::clone(self.inner.core());
        let queue = Arc::clone(handle.queue());
        let stopped = Arc::clone(handle.stopped_flag());
        if options.msg_as_table {
            let target_rows = options.batch_size;
            self.inner.spawn_drain(&handle, "rill-drain", move || {
                table_drain(core, queue, stopped, throttle, target_rows, move |msgs| {
                    handler(msgs)
                });
            });
        } else {
            self.inner.spawn_drain(&handle, "rill-drain", move || {
                batch_drain(core, queue, stopped, throttle, move |msgs| handler(msgs));
            });
        }
        Ok(handle)
    }

    pub fn unsubscribe(&self, host: &str, port: u16, table: &str, action: &str) -> Result<()> {
        self.inner.unsubscribe(host, port, table, action)
    }

    /// Messages buffered for a subscription
    pub fn queue_depth(&self, handle: &SubscriptionHandle) -> usize {
        handle.queue_depth()
    }

    /// Tear the client down; idempotent
    pub fn exit(&self) {
        self.inner.exit();
    }

    pub fn is_exit(&self) -> bool {
        self.inner.is_exit()
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.inner.metrics()
    }
}
