//! Socket plumbing
//!
//! Keep-alive configuration and dialing helpers, shared by the daemon and
//! exposed for [`Session`](crate::Session) implementations that manage
//! their own connections.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tracing::warn;

use crate::config::KeepAliveConfig;

/// Process-wide socket-stack init hook.
///
/// Idempotent one-shot. The platforms this crate targets need no explicit
/// startup, but every socket goes through here so a platform that does can
/// hook in at a single point.
pub(crate) fn net_init() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| ());
}

/// Apply the keep-alive policy to a subscription socket.
///
/// Linux sets idle time, probe interval, and probe count; other platforms
/// set what `socket2` exposes there.
pub fn configure_keepalive(stream: &TcpStream, config: &KeepAliveConfig) -> io::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let keepalive = TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval);
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(config.probes);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Dial `host:port` with a connect timeout, resolving through the system
/// resolver. Tries each resolved address in order.
pub fn dial(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    net_init();
    let addrs = (host, port).to_socket_addrs()?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(%addr, err = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{host}:{port} did not resolve"))
    }))
}
