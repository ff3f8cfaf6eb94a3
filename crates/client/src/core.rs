//! Streaming client core
//!
//! Owns everything shared across subscriptions: the topic registry, the
//! acceptor/dialer daemon, the reconnect controller, HA routes, and the
//! exit flag. The delivery front-ends wrap an `Arc<StreamingCore>` and
//! differ only in how they drain queues.

use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, SubscribeOptions, DEFAULT_QUEUE_CAPACITY};
use crate::error::{ClientError, SessionError};
use crate::message::SubscriptionHandle;
use crate::metrics::ClientMetrics;
use crate::net::{configure_keepalive, net_init};
use crate::parser;
use crate::queue::MessageQueue;
use crate::reconnect::{self, ReconnectState};
use crate::registry::{make_id, HaRouteTable, SubscribeInfo, TopicRegistry};
use crate::session::{Connector, PublishRequest, Session, Site};
use crate::Result;

/// How often the blocking accept loop re-checks the exit flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum leader redirects followed during one subscribe call
const MAX_REDIRECTS: u32 = 10;

struct ParserThread {
    /// Clone of the stream, kept to shut the reader down at exit
    stream: Option<TcpStream>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct CoreThreads {
    daemon: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

pub(crate) struct StreamingCore {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    /// Effective transport mode; the version gate may force reverse mode
    listen_port: AtomicI32,
    version_checked: Mutex<bool>,
    initialized: Mutex<bool>,
    exit: AtomicBool,
    local_ip: String,

    pub(crate) registry: TopicRegistry,
    pub(crate) ha_routes: HaRouteTable,
    pub(crate) reconnect: ReconnectState,
    pub(crate) metrics: ClientMetrics,

    /// Reverse-mode hand-off: data streams waiting for a parser thread.
    /// `None` unblocks the daemon at shutdown.
    publishers_tx: Sender<Option<TcpStream>>,
    publishers_rx: Receiver<Option<TcpStream>>,

    listener: Mutex<Option<TcpListener>>,
    threads: Mutex<CoreThreads>,
    parser_threads: Mutex<Vec<ParserThread>>,

    /// Serializes registry inserts against parser fan-out so a stream's
    /// first frames cannot outrun `insert_meta`.
    pub(crate) ready: Mutex<()>,
}

impl StreamingCore {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        if config.listening_port < 0 {
            return Err(ClientError::config(format!(
                "invalid listening port value {}",
                config.listening_port
            )));
        }
        net_init();
        let (publishers_tx, publishers_rx) = crossbeam_channel::unbounded();
        Ok(Arc::new(Self {
            listen_port: AtomicI32::new(config.listening_port),
            config,
            connector,
            version_checked: Mutex::new(false),
            initialized: Mutex::new(false),
            exit: AtomicBool::new(false),
            local_ip: "localhost".to_owned(),
            registry: TopicRegistry::new(),
            ha_routes: HaRouteTable::default(),
            reconnect: ReconnectState::new(),
            metrics: ClientMetrics::new(),
            publishers_tx,
            publishers_rx,
            listener: Mutex::new(None),
            threads: Mutex::new(CoreThreads::default()),
            parser_threads: Mutex::new(Vec::new()),
            ready: Mutex::new(()),
        }))
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_listen_mode(&self) -> bool {
        self.listen_port.load(Ordering::Acquire) > 0
    }

    fn effective_listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire).max(0) as u16
    }

    pub fn connect_session(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<Box<dyn Session>, SessionError> {
        self.connector.connect(host, port)
    }

    // =========================================================================
    // Version gate and startup
    // =========================================================================

    /// Probe the server version once per client and pin the transport mode.
    ///
    /// Servers at 3.x, 2.10.x, or 2.0.9+ only publish over reverse
    /// connections; older servers only publish to a listening subscriber.
    /// A mismatch with the configured port is fatal. When the primary is
    /// unreachable the probe walks the backup sites in order.
    fn check_server_version(&self, host: &str, port: u16, backups: &[Site]) -> Result<()> {
        let mut checked = self.version_checked.lock();
        if *checked {
            return Ok(());
        }

        let mut session = None;
        let mut last_err = None;
        for site in std::iter::once(&Site::new(host, port)).chain(backups.iter()) {
            match self.connect_session(&site.host, site.port) {
                Ok(s) => {
                    session = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(site = %site, err = %e, "version probe connect failed");
                    last_err = Some(e);
                }
            }
        }
        let mut session = match (session, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => unreachable!("probe list always has the primary"),
        };

        let version = session.version()?;
        let (major, minor, patch) = parse_version(&version)?;

        if major >= 3 || (major == 2 && minor == 10) || (major == 2 && minor == 0 && patch >= 9) {
            if self.listen_port.load(Ordering::Acquire) != 0 {
                warn!(
                    version = %version,
                    "server only supports reverse-connection subscription; \
                     the configured listening port will not take effect"
                );
            }
            self.listen_port.store(0, Ordering::Release);
        } else if self.listen_port.load(Ordering::Acquire) == 0 {
            return Err(ClientError::config(format!(
                "server {version} does not support reverse-connection subscription; \
                 configure a listening port"
            )));
        }

        *checked = true;
        Ok(())
    }

    /// Bind the listener (listen mode) and start the daemon and reconnect
    /// threads. Idempotent.
    fn ensure_init(self: &Arc<Self>) -> Result<()> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Ok(());
        }

        if self.is_listen_mode() {
            let port = self.effective_listen_port();
            let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
                ClientError::config(format!(
                    "failed to bind the subscription listener on port {port}: {e}"
                ))
            })?;
            // Non-blocking so the accept loop can observe the exit flag
            listener.set_nonblocking(true)?;
            *self.listener.lock() = Some(listener);
        }

        let mut threads = self.threads.lock();
        let core = Arc::clone(self);
        threads.reconnect = Some(
            std::thread::Builder::new()
                .name("rill-reconnect".into())
                .spawn(move || reconnect::run(core))?,
        );
        let core = Arc::clone(self);
        threads.daemon = Some(
            std::thread::Builder::new()
                .name("rill-daemon".into())
                .spawn(move || core.daemon_loop())?,
        );
        drop(threads);

        *initialized = true;
        Ok(())
    }

    // =========================================================================
    // Daemon
    // =========================================================================

    /// Accepts (listen mode) or receives (reverse mode) publisher streams
    /// and gives each one a parser thread.
    fn daemon_loop(self: Arc<Self>) {
        if self.is_listen_mode() {
            self.accept_loop();
        } else {
            self.dial_loop();
        }
        debug!("daemon stopping");
    }

    fn accept_loop(self: &Arc<Self>) {
        let listener = match self.listener.lock().as_ref().map(TcpListener::try_clone) {
            Some(Ok(l)) => l,
            Some(Err(e)) => {
                error!(err = %e, "could not clone the subscription listener");
                return;
            }
            None => return,
        };
        info!(port = self.effective_listen_port(), "subscription listener accepting");

        while !self.is_exit() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_exit() {
                        break;
                    }
                    debug!(%peer, "publisher connected");
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!(%peer, err = %e, "failed to restore blocking mode");
                        continue;
                    }
                    self.start_parser(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    if self.is_exit() {
                        break;
                    }
                    error!(err = %e, "accept failed, retrying in 1s");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    fn dial_loop(self: &Arc<Self>) {
        loop {
            match self.publishers_rx.recv() {
                Ok(Some(stream)) => {
                    if self.is_exit() {
                        break;
                    }
                    self.start_parser(stream);
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn start_parser(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = configure_keepalive(&stream, &self.config.keep_alive) {
            warn!(err = %e, "subscription socket failed to enable TCP keep-alive");
        }
        let record = stream.try_clone().ok();
        let core = Arc::clone(self);
        match std::thread::Builder::new()
            .name("rill-parser".into())
            .spawn(move || parser::parse_stream(core, stream))
        {
            Ok(handle) => self.parser_threads.lock().push(ParserThread {
                stream: record,
                handle,
            }),
            Err(e) => error!(err = %e, "failed to spawn parser thread"),
        }
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Negotiate topic and schema over `session`, then ask the publisher to
    /// start streaming.
    ///
    /// In listen mode the publish request rides the control session and the
    /// publisher dials back. In reverse mode a dedicated connection carries
    /// the publish request and then becomes the data stream, handed to the
    /// daemon. Returns the server-assigned topic.
    pub(crate) fn subscribe_with_session(
        &self,
        mut session: Box<dyn Session>,
        info: &mut SubscribeInfo,
    ) -> std::result::Result<String, SessionError> {
        if !info.user.is_empty() {
            session.login(&info.user, &info.password, true)?;
        }
        let (topic, columns) = session.get_subscription_topic(&info.table, &info.action)?;
        info.attributes = columns;

        let request = PublishRequest {
            local_ip: self.local_ip.clone(),
            local_port: self.effective_listen_port(),
            table: info.table.clone(),
            action: info.action.clone(),
            offset: info.offset,
            filter: info.filter.clone(),
            allow_exists: info.allow_exists,
        };

        if self.is_listen_mode() {
            let reply = session.publish_table(&request)?;
            info.ha_sites = reply.ha_sites;
            info.socket = None;
        } else {
            let mut data_session = self.connect_session(&info.host, info.port)?;
            if !info.user.is_empty() {
                data_session.login(&info.user, &info.password, true)?;
            }
            let reply = data_session.publish_table(&request)?;
            info.ha_sites = reply.ha_sites;
            let stream = data_session.into_data_stream().ok_or_else(|| {
                SessionError::Server("session cannot provide a reverse-mode data stream".into())
            })?;
            if let Err(e) = configure_keepalive(&stream, &self.config.keep_alive) {
                warn!(err = %e, "data stream failed to enable TCP keep-alive");
            }
            info.socket = stream.try_clone().ok().map(Arc::new);
            let _ = self.publishers_tx.send(Some(stream));
        }
        Ok(topic)
    }

    pub fn subscribe_internal(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        table: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        if self.is_exit() {
            return Err(ClientError::Exiting);
        }
        if table.is_empty() {
            return Err(ClientError::config("table name must not be empty"));
        }
        if options.msg_as_table && options.deserializer.is_some() {
            return Err(ClientError::config(
                "msg_as_table must be false when a deserializer is set",
            ));
        }
        let backups: Vec<Site> = options
            .backup_sites
            .iter()
            .map(|s| s.parse::<Site>().map_err(ClientError::Config))
            .collect::<Result<_>>()?;

        self.check_server_version(host, port, &backups)?;
        self.ensure_init()?;

        let action = options.action_name().to_owned();
        let requested_id = make_id(host, port, table, &action);
        if self.registry.topic_for_id(&requested_id).is_some() && !options.allow_exists {
            return Err(ClientError::AlreadySubscribed(requested_id));
        }

        // Table mode keeps the queue at single-message granularity so the
        // coalescing window in the drain thread sees every table promptly.
        let queue_batch = if options.msg_as_table {
            1
        } else {
            options.batch_size.max(1)
        };
        let queue = Arc::new(MessageQueue::new(
            DEFAULT_QUEUE_CAPACITY.max(queue_batch),
            queue_batch,
        ));

        let mut info = SubscribeInfo {
            id: requested_id,
            host: host.to_owned(),
            port,
            table: table.to_owned(),
            action,
            offset: options.offset,
            resub: options.resub,
            filter: options.filter.clone(),
            msg_as_table: options.msg_as_table,
            allow_exists: options.allow_exists,
            attributes: Vec::new(),
            ha_sites: Vec::new(),
            available_sites: Vec::new(),
            current_site_idx: None,
            last_site_idx: None,
            user: options.user.clone(),
            password: options.password.clone(),
            deserializer: options.deserializer.clone(),
            is_event: options.is_event,
            resub_timeout: options.resub_timeout(),
            sub_once: options.sub_once,
            batch_size: queue_batch,
            queue,
            stopped: Arc::new(AtomicBool::new(false)),
            socket: None,
        };
        if !backups.is_empty() {
            info.available_sites = std::iter::once(Site::new(host, port))
                .chain(backups.iter().cloned())
                .collect();
            info.current_site_idx = Some(0);
        }

        let mut redirects = 0;
        loop {
            if self.is_exit() {
                return Err(ClientError::Exiting);
            }
            let attempt = self
                .connect_session(&info.host, info.port)
                .and_then(|session| {
                    let _ready = self.ready.lock();
                    let topic = self.subscribe_with_session(session, &mut info)?;
                    // Identity follows the node that served the subscribe,
                    // so redirected subscriptions unsubscribe through the
                    // HA route table.
                    info.id = make_id(&info.host, info.port, &info.table, &info.action);
                    self.registry.insert_meta(&topic, info.clone());
                    Ok(topic)
                });

            match attempt {
                Ok(topic) => {
                    info!(topic = %topic, id = %info.id, "subscribed");
                    return Ok(SubscriptionHandle::new(
                        info.id.clone(),
                        Arc::clone(&info.queue),
                        Arc::clone(&info.stopped),
                    ));
                }
                Err(err) => {
                    if backups.is_empty() {
                        if let Some(leader) = err.redirect() {
                            redirects += 1;
                            if redirects <= MAX_REDIRECTS {
                                info!(%leader, "redirected to leader for subscription");
                                self.ha_routes.record(
                                    Site::new(host, port),
                                    table,
                                    &info.action,
                                    leader.clone(),
                                );
                                info.host = leader.host;
                                info.port = leader.port;
                                continue;
                            }
                        }
                    }
                    if !backups.is_empty() || options.resub {
                        warn!(id = %info.id, err = %err, "initial subscribe failed, queued for retry");
                        let handle = SubscriptionHandle::new(
                            info.id.clone(),
                            Arc::clone(&info.queue),
                            Arc::clone(&info.stopped),
                        );
                        // Placeholder registration under the identity keeps
                        // drain threads attachable until the server assigns
                        // the real topic.
                        self.registry.insert_meta(&info.id.clone(), info.clone());
                        self.reconnect.push_initial(info);
                        return Ok(handle);
                    }
                    return Err(err.into());
                }
            }
        }
    }

    // =========================================================================
    // Unsubscribe
    // =========================================================================

    pub fn unsubscribe_internal(
        &self,
        host: &str,
        port: u16,
        table: &str,
        action: &str,
    ) -> Result<()> {
        let id = make_id(host, port, table, action);
        let mut site = Site::new(host, port);
        let mut session: Option<Box<dyn Session>> = None;

        let topic = match self.registry.topic_for_id(&id) {
            Some(topic) => {
                match self.registry.find(&topic) {
                    Some(info) => {
                        if let Some(current) = info.current_site() {
                            site = current.clone();
                        }
                    }
                    None => {
                        warn!(topic = %topic, "subscription does not exist");
                        return Ok(());
                    }
                }
                topic
            }
            None => {
                // The identity may have been recorded against the leader:
                // translate follower -> leader, or drop the route when the
                // caller already names the leader.
                if let Some(leader) = self.ha_routes.take_leader(&site, table, action) {
                    site = leader;
                } else {
                    self.ha_routes.remove_leader(&site, table, action);
                }
                let mut s = self.connect_session(&site.host, site.port)?;
                let (topic, _columns) = s.get_subscription_topic(table, action)?;
                if !self.registry.contains(&topic) {
                    warn!(topic = %topic, "subscription does not exist");
                    return Ok(());
                }
                session = Some(s);
                topic
            }
        };

        self.registry.remove(&topic, true);
        info!(topic = %topic, "unsubscribed");

        if self.is_listen_mode() {
            let mut s = match session.take() {
                Some(s) => s,
                None => self.connect_session(&site.host, site.port)?,
            };
            s.stop_publish_table(&self.local_ip, self.effective_listen_port(), table, action)?;
        }
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Tear the client down. Idempotent; joins every thread the client
    /// created before returning.
    pub fn exit(&self) {
        if self.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(subscriptions = self.registry.len(), "client exiting");

        if !self.is_listen_mode() {
            let _ = self.publishers_tx.send(None);
        }

        // Unblock parser reads before joining anything
        for parser in self.parser_threads.lock().iter() {
            if let Some(stream) = &parser.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        // Close queues and join drain threads; this also unblocks parser
        // workers stuck on a full queue.
        self.registry.exit_all();

        let (daemon, reconnect) = {
            let mut threads = self.threads.lock();
            (threads.daemon.take(), threads.reconnect.take())
        };
        for handle in [daemon, reconnect].into_iter().flatten() {
            if handle.join().is_err() {
                error!("client thread panicked during shutdown");
            }
        }

        let parsers: Vec<ParserThread> = self.parser_threads.lock().drain(..).collect();
        for parser in parsers {
            if let Some(stream) = &parser.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
            if parser.handle.join().is_err() {
                error!("parser thread panicked during shutdown");
            }
        }
        *self.listener.lock() = None;
    }
}

impl Drop for StreamingCore {
    fn drop(&mut self) {
        // Exit is idempotent; clients normally call it explicitly
        self.exit();
    }
}

/// Parse `"<major>.<minor>.<patch> ..."` into its numeric parts
fn parse_version(version: &str) -> Result<(u32, u32, u32)> {
    let first = version.split_whitespace().next().unwrap_or_default();
    let mut parts = first.split('.');
    let mut next = || -> Result<u32> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ClientError::config(format!("unparseable server version `{version}`")))
    };
    Ok((next()?, next()?, next()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_with_suffix() {
        assert_eq!(parse_version("2.00.10 JIT").unwrap(), (2, 0, 10));
        assert_eq!(parse_version("3.1.4").unwrap(), (3, 1, 4));
        assert!(parse_version("nonsense").is_err());
        assert!(parse_version("2.0").is_err());
    }
}
