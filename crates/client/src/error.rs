//! Client and session error types

use thiserror::Error;

use crate::session::Site;

/// Errors surfaced by the subscription API
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid configuration (port, backup site, mode/version mismatch).
    /// Fatal at the API boundary.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure talking to a publisher
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Control RPC failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(#[from] rill_protocol::ProtocolError),

    /// Subscribing to a topic that already exists without `allow_exists`
    #[error("subscription {0} already exists")]
    AlreadySubscribed(String),

    /// The client is shutting down
    #[error("client is exiting")]
    Exiting,
}

impl ClientError {
    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Errors surfaced by control-RPC sessions
#[derive(Debug, Error)]
pub enum SessionError {
    /// Failed to reach or talk to the server
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The contacted node is a follower; the payload names the leader
    #[error("not leader, redirect to {leader}")]
    NotLeader { leader: Site },

    /// Server rejected the call
    #[error("server error: {0}")]
    Server(String),

    /// The session was closed
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Build a server error, upgrading legacy `<NotLeader>host:port` text
    /// to the structured redirect variant.
    ///
    /// The text parse is a compatibility shim for servers that can only
    /// report redirects inside an error string.
    pub fn from_server_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match parse_not_leader(&msg) {
            Some(leader) => Self::NotLeader { leader },
            None => Self::Server(msg),
        }
    }

    /// The redirect target, if this error is a leader redirection.
    ///
    /// Checks the structured variant first, then falls back to scanning
    /// error text produced by older servers.
    pub fn redirect(&self) -> Option<Site> {
        match self {
            Self::NotLeader { leader } => Some(leader.clone()),
            Self::Server(msg) => parse_not_leader(msg),
            _ => None,
        }
    }
}

/// Extract `host:port` from a `<NotLeader>` error payload
fn parse_not_leader(msg: &str) -> Option<Site> {
    let rest = msg.split("<NotLeader>").nth(1)?;
    rest.trim().parse::<Site>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_shim_parses_host_port() {
        let err = SessionError::from_server_message("<NotLeader>10.1.2.3:8848");
        let leader = err.redirect().unwrap();
        assert_eq!(leader.host, "10.1.2.3");
        assert_eq!(leader.port, 8848);
    }

    #[test]
    fn not_leader_shim_rejects_garbage() {
        assert!(SessionError::from_server_message("<NotLeader>nonsense")
            .redirect()
            .is_none());
        assert!(SessionError::from_server_message("plain failure")
            .redirect()
            .is_none());
        assert!(SessionError::from_server_message("<NotLeader>h:99999")
            .redirect()
            .is_none());
    }

    #[test]
    fn typed_redirect_wins() {
        let err = SessionError::NotLeader {
            leader: Site::new("h2", 9002),
        };
        assert_eq!(err.redirect().unwrap(), Site::new("h2", 9002));
    }
}
