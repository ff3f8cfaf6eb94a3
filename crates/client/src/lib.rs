//! Rill Client - Streaming-table subscription engine
//!
//! This crate keeps subscriptions to append-only streaming tables alive
//! across network faults and leader failovers, delivering rows to user
//! callbacks with per-topic offset continuity: no row lost, none duplicated
//! after a reconnect (within the publisher's retained window).
//!
//! # Architecture
//!
//! ```text
//! bytes -> frame decoder -> parser worker -> topic queue -> drain thread -> callback
//! ```
//!
//! - **Transport** runs in one of two modes. *Listen mode* binds a TCP port
//!   and accepts publisher-initiated connections. *Reverse mode* dials the
//!   publisher and hands the resulting stream to the same daemon.
//! - **Parser workers** (one thread per stream) decode frames and fan rows
//!   out to the bounded per-subscription queues, applying backpressure all
//!   the way to the socket rather than dropping rows.
//! - The **reconnect controller** retries failed topics on the current
//!   site, rotates through user backup sites and server-announced HA peers,
//!   and follows leader redirects.
//! - **Delivery front-ends** share one drain contract over the queue:
//!   [`PollingClient`], [`ThreadedClient`], [`ThreadPooledClient`],
//!   [`EventClient`].
//!
//! Control RPCs (login, topic negotiation, publish/stop-publish) ride on
//! short-lived sessions produced by a [`Connector`]; RPC marshalling lives
//! outside this crate, behind the [`Session`] trait.
//!
//! An independent [`AsyncTaskPool`](pool::AsyncTaskPool) shares the session
//! seam: worker threads pull tasks from a queue and publish per-task
//! terminal status without dying on task failures.
//!
//! # Observability
//!
//! The crate emits `tracing` events and never installs a global subscriber;
//! binaries and tests own that at the process boundary.

mod clients;
mod config;
mod core;
mod deserializer;
mod error;
mod message;
mod metrics;
mod parser;
mod queue;
mod reconnect;
mod registry;
mod session;

pub mod net;
pub mod pool;

pub use clients::{EventClient, PollingClient, ThreadPooledClient, ThreadedClient};
pub use config::{ClientConfig, KeepAliveConfig, SubscribeOptions, DEFAULT_ACTION_NAME};
pub use deserializer::{DeserializeError, EventResolver, EventSchema, StreamDeserializer};
pub use error::{ClientError, SessionError};
pub use message::{Message, MessagePayload, SubscriptionHandle};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
pub use queue::{MessageQueue, Pop};
pub use session::{Connector, PublishReply, PublishRequest, Session, Site, TaskOptions};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
