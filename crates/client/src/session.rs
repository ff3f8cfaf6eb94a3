//! Control-plane session seam
//!
//! Database session establishment, authentication, and RPC marshalling are
//! external collaborators. This module pins down the contract the
//! subscription engine needs from them: a [`Connector`] dials a node and
//! yields a [`Session`], and a session exposes exactly the control RPCs the
//! engine invokes. In reverse mode the long-lived data stream is the same
//! socket the publish RPC rode on, so a session can be consumed into its
//! underlying `TcpStream`.

use std::net::TcpStream;
use std::str::FromStr;

use rill_protocol::Value;

use crate::error::SessionError;

// =============================================================================
// Site
// =============================================================================

/// A publisher address, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
    pub host: String,
    pub port: u16,
}

impl Site {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Site {
    type Err = String;

    /// Parse `host:port` with `1 <= port <= 65535`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            format!("the site `{s}` is malformed, expected host:port, e.g. 192.168.1.1:8848")
        })?;
        let port: u32 = port
            .parse()
            .map_err(|_| format!("the site `{s}` has a non-numeric port"))?;
        if host.is_empty() || port == 0 || port > 65535 {
            return Err(format!(
                "the site `{s}` is malformed, port must be in 1..=65535"
            ));
        }
        Ok(Self::new(host, port as u16))
    }
}

// =============================================================================
// Control RPC payloads
// =============================================================================

/// Arguments to the `publishTable` control RPC
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Subscriber address the publisher should connect back to (listen mode)
    pub local_ip: String,
    pub local_port: u16,
    pub table: String,
    pub action: String,
    /// Next expected row; -1 lets the server choose
    pub offset: i64,
    /// Opaque filter value forwarded to the server
    pub filter: Option<Value>,
    pub allow_exists: bool,
}

/// Reply from `publishTable`
#[derive(Debug, Clone, Default)]
pub struct PublishReply {
    /// High-availability peers announced by the publisher
    pub ha_sites: Vec<Site>,
}

/// Execution options forwarded with async pool scripts
#[derive(Debug, Clone, Copy)]
pub struct TaskOptions {
    pub priority: i32,
    pub parallelism: i32,
    pub fetch_size: i32,
    pub clear_memory: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: 4,
            parallelism: 64,
            fetch_size: 0,
            clear_memory: false,
        }
    }
}

// =============================================================================
// Session traits
// =============================================================================

/// One control connection to a publisher node.
///
/// Sessions are short-lived on the control plane (subscribe, unsubscribe,
/// version probe) and long-lived when carrying reverse-mode data or async
/// pool scripts. Implementations marshal the RPCs however the server
/// dialect requires; the engine only sees these methods.
pub trait Session: Send {
    /// Authenticate the session
    fn login(&mut self, user: &str, password: &str, remember: bool) -> Result<(), SessionError>;

    /// Server version string, `"<major>.<minor>.<patch> ..."`
    fn version(&mut self) -> Result<String, SessionError>;

    /// Learn the server-assigned topic and ordered column names for a table
    fn get_subscription_topic(
        &mut self,
        table: &str,
        action: &str,
    ) -> Result<(String, Vec<String>), SessionError>;

    /// Ask the publisher to start streaming
    fn publish_table(&mut self, request: &PublishRequest) -> Result<PublishReply, SessionError>;

    /// Ask the publisher to stop streaming to this subscriber
    fn stop_publish_table(
        &mut self,
        local_ip: &str,
        local_port: u16,
        table: &str,
        action: &str,
    ) -> Result<(), SessionError>;

    /// Execute a free-form script (async pool)
    fn run_script(&mut self, script: &str, options: &TaskOptions) -> Result<Value, SessionError>;

    /// Execute a function call with arguments (async pool)
    fn run_function(
        &mut self,
        function: &str,
        args: &[Value],
        options: &TaskOptions,
    ) -> Result<Value, SessionError>;

    /// Release the underlying stream for reverse-mode data delivery.
    ///
    /// Returns `None` for session kinds that do not ride a raw TCP stream.
    fn into_data_stream(self: Box<Self>) -> Option<TcpStream>;
}

/// Dials publisher nodes and produces sessions
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Session>, SessionError>;
}
