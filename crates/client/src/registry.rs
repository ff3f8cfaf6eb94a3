//! Topic registry
//!
//! Concurrent bookkeeping for live subscriptions. Four maps, each behind
//! its own lock so critical sections stay short:
//!
//! - `topic -> entry` (the subscription itself, plus its drain threads)
//! - `site -> {topic}` (which topics a publisher stream feeds)
//! - `table -> refcount` (action-stripped; gates parser teardown)
//! - `subscription id -> topic` (API identity to server-assigned topic)
//!
//! Mutation happens through closure-style helpers so the parser worker and
//! reconnect controller can update entries atomically.

use std::collections::{HashMap, HashSet};
use std::net::Shutdown;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rill_protocol::Value;
use tracing::{error, warn};

use crate::deserializer::StreamDeserializer;
use crate::queue::MessageQueue;
use crate::session::Site;

// =============================================================================
// Topic helpers
// =============================================================================

/// `host:port/table/action` -> `host:port/table`
pub(crate) fn strip_action(topic: &str) -> &str {
    topic.rfind('/').map_or(topic, |i| &topic[..i])
}

/// `host:port/table/action` -> `host:port`
pub(crate) fn site_of(topic: &str) -> &str {
    topic.find('/').map_or(topic, |i| &topic[..i])
}

/// Subscription identity for an API-level (host, port, table, action) tuple
pub(crate) fn make_id(host: &str, port: u16, table: &str, action: &str) -> String {
    format!("{host}:{port}/{table}/{action}")
}

// =============================================================================
// SubscribeInfo
// =============================================================================

/// Everything the engine knows about one subscription
#[derive(Clone)]
pub(crate) struct SubscribeInfo {
    /// API identity, `host:port/table/action`
    pub id: String,
    /// Currently selected publisher address
    pub host: String,
    pub port: u16,
    pub table: String,
    pub action: String,
    /// Next expected row; -1 lets the server choose
    pub offset: i64,
    pub resub: bool,
    pub filter: Option<Value>,
    pub msg_as_table: bool,
    pub allow_exists: bool,
    /// Column names learned at subscribe time
    pub attributes: Vec<String>,
    /// HA peers announced by the server on publish
    pub ha_sites: Vec<Site>,
    /// Primary plus user backup sites; empty when no backups were given
    pub available_sites: Vec<Site>,
    /// Rotation cursor into `available_sites`
    pub current_site_idx: Option<usize>,
    /// Site of the last successful subscribe, recorded on first retry
    pub last_site_idx: Option<usize>,
    pub user: String,
    pub password: String,
    pub deserializer: Option<Arc<dyn StreamDeserializer>>,
    pub is_event: bool,
    pub resub_timeout: Duration,
    pub sub_once: bool,
    pub batch_size: usize,
    pub queue: Arc<MessageQueue>,
    pub stopped: Arc<AtomicBool>,
    /// Clone of the data socket; used only to shut it down from teardown
    pub socket: Option<Arc<TcpStream>>,
}

impl SubscribeInfo {
    /// Address rotation bookkeeping after a successful backup-site
    /// failover.
    ///
    /// With `sub_once` set and the working site differing from the original
    /// one, the originally failed site leaves the rotation so later
    /// failovers do not revisit it.
    pub fn update_by_reconnect(&mut self, reconnected_idx: usize) {
        if !self.sub_once {
            return;
        }
        let Some(last) = self.last_site_idx else {
            return;
        };
        if last == reconnected_idx {
            return;
        }
        let mut idx = reconnected_idx;
        if last < idx {
            idx -= 1;
        }
        self.available_sites.remove(last);
        self.current_site_idx = Some(idx);
        self.last_site_idx = Some(idx);
    }

    /// The currently selected backup-rotation site, if rotation is active
    pub fn current_site(&self) -> Option<&Site> {
        self.current_site_idx
            .and_then(|i| self.available_sites.get(i))
    }
}

impl std::fmt::Debug for SubscribeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeInfo")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("offset", &self.offset)
            .field("resub", &self.resub)
            .field("available_sites", &self.available_sites)
            .field("current_site_idx", &self.current_site_idx)
            .finish()
    }
}

// =============================================================================
// TopicEntry
// =============================================================================

/// A registry entry: the subscription plus its drain threads
pub(crate) struct TopicEntry {
    pub info: SubscribeInfo,
    pub threads: Vec<JoinHandle<()>>,
}

impl TopicEntry {
    fn new(info: SubscribeInfo) -> Self {
        Self {
            info,
            threads: Vec::new(),
        }
    }

    /// Tear the subscription down: close the socket, raise the stop flag,
    /// push the queue sentinel, join drain threads.
    pub fn exit(mut self) {
        if let Some(socket) = &self.info.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.info.stopped.store(true, Ordering::Release);
        self.info.queue.close();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(id = %self.info.id, "drain thread panicked during teardown");
            }
        }
    }
}

// =============================================================================
// TopicRegistry
// =============================================================================

/// Process-wide registry of live subscriptions
#[derive(Default)]
pub(crate) struct TopicRegistry {
    topics: Mutex<HashMap<String, TopicEntry>>,
    site_topics: Mutex<HashMap<String, HashSet<String>>>,
    table_refs: Mutex<HashMap<String, i64>>,
    ids: Mutex<HashMap<String, String>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription under its (server-assigned) topic
    pub fn insert_meta(&self, topic: &str, info: SubscribeInfo) {
        self.insert_entry(topic, TopicEntry::new(info));
    }

    fn insert_entry(&self, topic: &str, entry: TopicEntry) {
        // A re-subscribe over an existing topic supersedes it entirely
        if self.contains(topic) {
            warn!(topic, "replacing existing registry entry");
            self.remove(topic, true);
        }
        self.ids
            .lock()
            .insert(entry.info.id.clone(), topic.to_owned());
        self.site_topics
            .lock()
            .entry(site_of(topic).to_owned())
            .or_default()
            .insert(topic.to_owned());
        *self
            .table_refs
            .lock()
            .entry(strip_action(topic).to_owned())
            .or_insert(0) += 1;
        self.topics.lock().insert(topic.to_owned(), entry);
    }

    /// Remove a subscription.
    ///
    /// With `exit` the entry is torn down (socket, stop flag, sentinel,
    /// thread joins) and `None` is returned; without it the entry is handed
    /// back so the caller can re-register it under a new topic.
    pub fn remove(&self, topic: &str, exit: bool) -> Option<TopicEntry> {
        let entry = self.topics.lock().remove(topic)?;
        self.ids.lock().remove(&entry.info.id);
        if let Some(set) = self.site_topics.lock().get_mut(site_of(topic)) {
            set.remove(topic);
        }
        if let Some(count) = self.table_refs.lock().get_mut(strip_action(topic)) {
            *count -= 1;
        }
        if exit {
            entry.exit();
            None
        } else {
            Some(entry)
        }
    }

    /// Move a subscription to a new topic, preserving drain threads.
    ///
    /// Used when a re-subscribe comes back with a different server-assigned
    /// topic name; the queue, stop flag, and offset ride along in `info`.
    pub fn rename(&self, old_topic: &str, new_topic: &str, info: SubscribeInfo) {
        let threads = self
            .remove(old_topic, false)
            .map(|e| e.threads)
            .unwrap_or_default();
        self.insert_entry(new_topic, TopicEntry { info, threads });
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Snapshot a subscription's state
    pub fn find(&self, topic: &str) -> Option<SubscribeInfo> {
        self.topics.lock().get(topic).map(|e| e.info.clone())
    }

    /// Atomically mutate a subscription, if present
    pub fn update_info(&self, topic: &str, f: impl FnOnce(&mut SubscribeInfo)) -> bool {
        match self.topics.lock().get_mut(topic) {
            Some(entry) => {
                f(&mut entry.info);
                true
            }
            None => false,
        }
    }

    /// Bump the next-expected-row offset after delivering a frame
    pub fn update_offset(&self, topic: &str, next_offset: i64) {
        self.update_info(topic, |info| info.offset = next_offset);
    }

    /// Server-assigned topic for an API identity
    pub fn topic_for_id(&self, id: &str) -> Option<String> {
        self.ids.lock().get(id).cloned()
    }

    /// Live-subscription refcount for an action-stripped table key
    pub fn table_refs(&self, table_key: &str) -> i64 {
        self.table_refs.lock().get(table_key).copied().unwrap_or(0)
    }

    /// Topics currently fed by a publisher site
    pub fn topics_on_site(&self, site: &str) -> Vec<String> {
        self.site_topics
            .lock()
            .get(site)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Attach a drain thread to the subscription owning `queue`
    pub fn add_drain_thread(&self, queue: &Arc<MessageQueue>, handle: JoinHandle<()>) {
        let mut topics = self.topics.lock();
        for entry in topics.values_mut() {
            if Arc::ptr_eq(&entry.info.queue, queue) {
                entry.threads.push(handle);
                return;
            }
        }
        drop(topics);
        error!("no registered topic owns this message queue");
        // Nothing will join it; detach rather than leak a handle
        drop(handle);
    }

    /// Number of registered topics
    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    /// Tear down every subscription (client exit)
    pub fn exit_all(&self) {
        let entries: Vec<TopicEntry> = {
            let mut topics = self.topics.lock();
            let keys: Vec<String> = topics.keys().cloned().collect();
            keys.iter().filter_map(|k| topics.remove(k)).collect()
        };
        self.ids.lock().clear();
        self.site_topics.lock().clear();
        self.table_refs.lock().clear();
        for entry in entries {
            entry.exit();
        }
    }
}

// =============================================================================
// HA routes
// =============================================================================

/// Follower/leader address translations learned from NotLeader redirects
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HaRoute {
    pub follower: Site,
    pub table: String,
    pub action: String,
    pub leader: Site,
}

/// The set of known follower -> leader translations
#[derive(Default)]
pub(crate) struct HaRouteTable {
    routes: Mutex<Vec<HaRoute>>,
}

impl HaRouteTable {
    pub fn record(&self, follower: Site, table: &str, action: &str, leader: Site) {
        self.routes.lock().push(HaRoute {
            follower,
            table: table.to_owned(),
            action: action.to_owned(),
            leader,
        });
    }

    /// Translate a follower address into its leader, removing the route
    pub fn take_leader(&self, follower: &Site, table: &str, action: &str) -> Option<Site> {
        let mut routes = self.routes.lock();
        let idx = routes
            .iter()
            .position(|r| r.follower == *follower && r.table == table && r.action == action)?;
        Some(routes.remove(idx).leader)
    }

    /// Drop the route for an unsubscribe issued against the leader itself
    pub fn remove_leader(&self, leader: &Site, table: &str, action: &str) -> bool {
        let mut routes = self.routes.lock();
        match routes
            .iter()
            .position(|r| r.leader == *leader && r.table == table && r.action == action)
        {
            Some(idx) => {
                routes.remove(idx);
                true
            }
            None => false,
        }
    }
}
