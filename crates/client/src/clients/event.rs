//! Event front-end

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rill_protocol::Value;
use tracing::warn;

use crate::clients::SharedClient;
use crate::config::{ClientConfig, SubscribeOptions};
use crate::deserializer::{EventResolver, EventSchema};
use crate::message::{MessagePayload, SubscriptionHandle};
use crate::metrics::ClientMetricsSnapshot;
use crate::queue::Pop;
use crate::session::Connector;
use crate::{ClientError, Result};

/// Subscription client for event streams.
///
/// Subscribes with raw any-vector delivery and decodes each frame into
/// `(event_type, attributes)` tuples against the schemas registered at
/// construction. Decode failures are logged and skipped; they never drop
/// the connection. Event streams are only published over reverse
/// connections, so this client has no listen mode.
pub struct EventClient {
    inner: SharedClient,
    resolver: Arc<EventResolver>,
}

impl EventClient {
    pub fn new(
        schemas: impl IntoIterator<Item = EventSchema>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Self::with_config(ClientConfig::reverse(), schemas, connector)
    }

    pub fn with_config(
        config: ClientConfig,
        schemas: impl IntoIterator<Item = EventSchema>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        if config.listening_port != 0 {
            return Err(ClientError::config(
                "event subscriptions only ride reverse connections",
            ));
        }
        Ok(Self {
            inner: SharedClient::new(config, connector)?,
            resolver: Arc::new(EventResolver::new(schemas)),
        })
    }

    /// Subscribe with a handler invoked once per decoded event
    pub fn subscribe(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: SubscribeOptions,
        mut handler: impl FnMut(&str, &[Value]) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        if options.msg_as_table || options.deserializer.is_some() {
            return Err(ClientError::config(
                "event subscriptions take neither msg_as_table nor a deserializer",
            ));
        }
        let options = options.with_event(true).with_batch_size(1);
        let handle = self.inner.subscribe(host, port, table, &options)?;

        let core = Arc::clone(self.inner.core());
        let queue = Arc::clone(handle.queue());
        let stopped = Arc::clone(handle.stopped_flag());
        let resolver = Arc::clone(&self.resolver);
        self.inner.spawn_drain(&handle, "rill-event-drain", move || {
            while !core.is_exit() && !stopped.load(Ordering::Acquire) {
                match queue.pop_blocking() {
                    Pop::Some(msg) => {
                        if stopped.load(Ordering::Acquire) {
                            break;
                        }
                        let MessagePayload::Event(data) = &msg.payload else {
                            warn!("event stream delivered a non-event payload");
                            continue;
                        };
                        match resolver.decode(data) {
                            Ok(events) => {
                                for (event_type, attributes) in &events {
                                    handler(event_type, attributes);
                                }
                            }
                            Err(err) => {
                                warn!(err = %err, "event decode failed, skipping frame");
                            }
                        }
                    }
                    Pop::Closed => break,
                    Pop::Timeout => continue,
                }
            }
            queue.close();
        });
        Ok(handle)
    }

    pub fn unsubscribe(&self, host: &str, port: u16, table: &str, action: &str) -> Result<()> {
        self.inner.unsubscribe(host, port, table, action)
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
