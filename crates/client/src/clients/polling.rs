//! Polling front-end

use std::sync::Arc;

use crate::clients::SharedClient;
use crate::config::{ClientConfig, SubscribeOptions};
use crate::message::SubscriptionHandle;
use crate::metrics::ClientMetricsSnapshot;
use crate::session::Connector;
use crate::Result;

/// Subscription client that exposes the raw message queue.
///
/// The caller drains the queue at its own pace through the returned
/// [`SubscriptionHandle`]; no drain threads are created.
pub struct PollingClient {
    inner: SharedClient,
}

impl PollingClient {
    /// Create a client. `listening_port` of 0 selects reverse mode; a
    /// positive port binds a listener for publisher-initiated connections.
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

    /// Subscribe and return the queue handle
    pub fn subscribe(
        &self,
        host: &str,
        port: u16,
        table: &str,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        self.inner.subscribe(host, port, table, &options)
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
