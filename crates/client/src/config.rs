//! Client configuration
//!
//! Construction-time knobs live in [`ClientConfig`]; per-subscription knobs
//! in [`SubscribeOptions`]. Both deserialize from TOML with serde defaults
//! and offer `with_*` builders for programmatic use.

use std::sync::Arc;
use std::time::Duration;

use rill_protocol::Value;
use serde::Deserialize;

use crate::deserializer::StreamDeserializer;

/// Default action name for subscriptions that do not pick one
pub const DEFAULT_ACTION_NAME: &str = "rillStreamingApi";

/// Default per-subscription queue capacity (messages)
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

/// TCP keep-alive policy applied to every subscription socket
///
/// Linux sets all three timing knobs; other platforms set what the OS
/// exposes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Whether keep-alive probing is enabled
    pub enabled: bool,

    /// Idle time before the first probe
    #[serde(with = "humantime_serde")]
    pub idle: Duration,

    /// Interval between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Unanswered probes before the connection is declared dead
    pub probes: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            probes: 3,
        }
    }
}

/// Client-wide configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport mode selector: 0 puts the client in reverse mode (the
    /// subscriber dials the publisher), a positive port binds a listener
    /// for publisher-initiated connections. Negative values are rejected.
    pub listening_port: i32,

    /// Keep-alive policy for subscription sockets
    pub keep_alive: KeepAliveConfig,

    /// Connect timeout for control and data connections
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listening_port: 0,
            keep_alive: KeepAliveConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Config for listen mode on the given port
    pub fn listening(port: u16) -> Self {
        Self {
            listening_port: i32::from(port),
            ..Self::default()
        }
    }

    /// Config for reverse mode
    pub fn reverse() -> Self {
        Self::default()
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Per-subscription options
///
/// `subscribe` takes the target host, port, and table; everything else has
/// a default here.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Label distinguishing independent subscriptions to the same table;
    /// empty means [`DEFAULT_ACTION_NAME`]
    pub action: String,

    /// First requested row; -1 lets the server choose
    pub offset: i64,

    /// Re-subscribe automatically after failures
    pub resub: bool,

    /// Opaque filter forwarded to the server
    pub filter: Option<Value>,

    /// Deliver whole frames as tables instead of per-row messages
    pub msg_as_table: bool,

    /// Tolerate an existing subscription with the same identity
    pub allow_exists: bool,

    /// Rows per callback for batch delivery; also the coalescing target in
    /// table mode
    pub batch_size: usize,

    /// Batch window in seconds for the threaded front-end
    pub throttle: f64,

    pub user: String,
    pub password: String,

    /// Splits blob rows into typed rows with symbol tags
    pub deserializer: Option<Arc<dyn StreamDeserializer>>,

    /// User-supplied failover peers, each `host:port`
    pub backup_sites: Vec<String>,

    /// Deliver raw any-vectors for event decoding
    pub is_event: bool,

    /// Wait between reconnect attempts for this subscription
    pub resub_timeout: Option<Duration>,

    /// After a successful failover, drop the failed site from rotation
    pub sub_once: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self {
            action: String::new(),
            offset: -1,
            resub: true,
            filter: None,
            msg_as_table: false,
            allow_exists: false,
            batch_size: 1,
            throttle: 1.0,
            user: String::new(),
            password: String::new(),
            deserializer: None,
            backup_sites: Vec::new(),
            is_event: false,
            resub_timeout: None,
            sub_once: false,
        }
    }

    /// Effective action name
    pub(crate) fn action_name(&self) -> &str {
        if self.action.is_empty() {
            DEFAULT_ACTION_NAME
        } else {
            &self.action
        }
    }

    /// Effective reconnect pacing
    pub(crate) fn resub_timeout(&self) -> Duration {
        self.resub_timeout.unwrap_or(Duration::from_millis(100))
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_resub(mut self, resub: bool) -> Self {
        self.resub = resub;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_msg_as_table(mut self, msg_as_table: bool) -> Self {
        self.msg_as_table = msg_as_table;
        self
    }

    #[must_use]
    pub fn with_allow_exists(mut self, allow_exists: bool) -> Self {
        self.allow_exists = allow_exists;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: f64) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_deserializer(mut self, deserializer: Arc<dyn StreamDeserializer>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    #[must_use]
    pub fn with_backup_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backup_sites = sites.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_event(mut self, is_event: bool) -> Self {
        self.is_event = is_event;
        self
    }

    #[must_use]
    pub fn with_resub_timeout(mut self, timeout: Duration) -> Self {
        self.resub_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_sub_once(mut self, sub_once: bool) -> Self {
        self.sub_once = sub_once;
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("action", &self.action)
            .field("offset", &self.offset)
            .field("resub", &self.resub)
            .field("msg_as_table", &self.msg_as_table)
            .field("allow_exists", &self.allow_exists)
            .field("batch_size", &self.batch_size)
            .field("throttle", &self.throttle)
            .field("backup_sites", &self.backup_sites)
            .field("is_event", &self.is_event)
            .field("sub_once", &self.sub_once)
            .field("has_deserializer", &self.deserializer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_defaults_match_policy() {
        let ka = KeepAliveConfig::default();
        assert!(ka.enabled);
        assert_eq!(ka.idle, Duration::from_secs(30));
        assert_eq!(ka.interval, Duration::from_secs(5));
        assert_eq!(ka.probes, 3);
    }

    #[test]
    fn default_action_used_when_empty() {
        let opts = SubscribeOptions::new();
        assert_eq!(opts.action_name(), DEFAULT_ACTION_NAME);
        assert_eq!(opts.with_action("custom").action_name(), "custom");
    }
}
