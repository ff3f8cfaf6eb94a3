//! Thread-pool front-end

use std::sync::Arc;

use crate::clients::{message_drain, SharedClient};
use crate::config::{ClientConfig, SubscribeOptions};
use crate::message::{Message, SubscriptionHandle};
use crate::metrics::ClientMetricsSnapshot;
use crate::session::Connector;
use crate::Result;

/// Subscription client that drains each subscription with N threads
/// sharing its queue.
///
/// Callback order across threads is not defined; use [`ThreadedClient`]
/// when per-topic ordering at the callback matters.
///
/// [`ThreadedClient`]: crate::ThreadedClient
pub struct ThreadPooledClient {
    inner: SharedClient,
    thread_count: usize,
}

impl ThreadPooledClient {
    pub fn new(
        listening_port: i32,
        thread_count: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let config = ClientConfig {
            listening_port,
            ..ClientConfig::default()
        };
        Self::with_config(config, thread_count, connector)
    }

    pub fn with_config(
        config: ClientConfig,
        thread_count: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Ok(Self {
            inner: SharedClient::new(config, connector)?,
            thread_count: thread_count.max(1),
        })
    }

    /// Drain threads created per subscription
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Subscribe; the handler runs on every drain thread
    pub fn subscribe(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: SubscribeOptions,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let options = options.with_batch_size(1);
        let handle = self.inner.subscribe(host, port, table, &options)?;

        let handler: Arc<dyn Fn(&Message) + Send + Sync> = Arc::new(handler);
        for _ in 0..self.thread_count {
            let core = Arc::clone(self.inner.core());
            let queue = Arc::clone(handle.queue());
            let stopped = Arc::clone(handle.stopped_flag());
            let handler = Arc::clone(&handler);
            let msg_as_table = options.msg_as_table;
            self.inner.spawn_drain(&handle, "rill-pool-drain", move || {
                message_drain(core, queue, stopped, msg_as_table, move |msg| handler(msg));
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
