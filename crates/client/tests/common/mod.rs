//! In-process publisher cluster for end-to-end scenarios
//!
//! Control RPCs are answered locally by mock sessions; row data travels
//! over real TCP streams encoded with the production frame encoder, so the
//! tests exercise the daemon, parser workers, reconnect controller, and
//! drain threads exactly as a live deployment would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rill_client::{Connector, PublishReply, PublishRequest, Session, SessionError, Site, TaskOptions};
use rill_protocol::encode::{data_frame, encode_frame, schema_frame};
use rill_protocol::{DataType, Frame, Value, Vector};

/// A frame plus how long the publisher waits before writing it
pub struct FramePlan {
    pub delay: Duration,
    pub frame: Frame,
}

pub fn plan(delay_ms: u64, frame: Frame) -> FramePlan {
    FramePlan {
        delay: Duration::from_millis(delay_ms),
        frame,
    }
}

type Feeder = Box<dyn FnMut(&PublishRequest) -> Vec<FramePlan> + Send>;

/// One mock publisher node
pub struct NodeState {
    pub host: String,
    pub port: u16,
    version: String,
    columns: Vec<String>,
    reachable: AtomicBool,
    redirect: Mutex<Option<Site>>,
    ha_sites: Mutex<Vec<Site>>,
    connects: AtomicU64,
    publishes: Mutex<Vec<PublishRequest>>,
    stops: Mutex<Vec<(String, u16, String, String)>>,
    feeder: Mutex<Option<Feeder>>,
    streams: Mutex<Vec<TcpStream>>,
    failing_scripts: Mutex<Vec<String>>,
}

impl NodeState {
    /// Server-assigned topic for a table/action pair
    pub fn topic_for(&self, table: &str, action: &str) -> String {
        format!("{}:{}/{}/{}", self.host, self.port, table, action)
    }

    pub fn set_feeder(&self, feeder: impl FnMut(&PublishRequest) -> Vec<FramePlan> + Send + 'static) {
        *self.feeder.lock() = Some(Box::new(feeder));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn set_redirect(&self, leader: Option<Site>) {
        *self.redirect.lock() = leader;
    }

    pub fn set_ha_sites(&self, sites: Vec<Site>) {
        *self.ha_sites.lock() = sites;
    }

    pub fn fail_script(&self, script: &str) {
        self.failing_scripts.lock().push(script.to_owned());
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Acquire)
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.lock().len()
    }

    pub fn publish_requests(&self) -> Vec<PublishRequest> {
        self.publishes.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().len()
    }

    pub fn stops(&self) -> Vec<(String, u16, String, String)> {
        self.stops.lock().clone()
    }

    /// Fault injection: drop every live data stream this node feeds
    pub fn close_streams(&self) {
        for stream in self.streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Write extra frames onto the most recent live stream
    pub fn push_frames(&self, frames: Vec<Frame>) {
        let streams = self.streams.lock();
        if let Some(stream) = streams.last() {
            let mut stream = stream.try_clone().expect("clone publisher stream");
            for frame in frames {
                stream
                    .write_all(&encode_frame(&frame, true))
                    .expect("write frame");
            }
        }
    }

    fn feed(&self, request: &PublishRequest, server_stream: Option<TcpStream>) {
        let plans = match self.feeder.lock().as_mut() {
            Some(feeder) => feeder(request),
            None => vec![plan(
                0,
                schema_frame(
                    &[self.topic_for(&request.table, &request.action).as_str()],
                    &request.table,
                    &self.columns.iter().map(String::as_str).collect::<Vec<_>>(),
                ),
            )],
        };

        let stream = match server_stream {
            Some(stream) => stream,
            None => {
                // Listen mode: dial back into the subscriber
                match TcpStream::connect(("127.0.0.1", request.local_port)) {
                    Ok(stream) => stream,
                    Err(_) => return,
                }
            }
        };
        self.streams
            .lock()
            .push(stream.try_clone().expect("clone publisher stream"));

        std::thread::spawn(move || {
            let mut stream = stream;
            for FramePlan { delay, frame } in plans {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                if stream.write_all(&encode_frame(&frame, true)).is_err() {
                    return;
                }
            }
            // Keep the socket open; the node owns a clone for fault injection
            std::thread::sleep(Duration::from_secs(30));
        });
    }
}

struct MockSession {
    node: Arc<NodeState>,
    data_stream: Option<TcpStream>,
}

impl MockSession {
    fn check_redirect(&self) -> Result<(), SessionError> {
        match self.node.redirect.lock().clone() {
            Some(leader) => Err(SessionError::NotLeader { leader }),
            None => Ok(()),
        }
    }
}

impl Session for MockSession {
    fn login(&mut self, _user: &str, _password: &str, _remember: bool) -> Result<(), SessionError> {
        Ok(())
    }

    fn version(&mut self) -> Result<String, SessionError> {
        Ok(self.node.version.clone())
    }

    fn get_subscription_topic(
        &mut self,
        table: &str,
        action: &str,
    ) -> Result<(String, Vec<String>), SessionError> {
        self.check_redirect()?;
        Ok((self.node.topic_for(table, action), self.node.columns.clone()))
    }

    fn publish_table(&mut self, request: &PublishRequest) -> Result<PublishReply, SessionError> {
        self.check_redirect()?;
        self.node.publishes.lock().push(request.clone());

        if request.local_port > 0 {
            // Listen mode: the publisher dials the subscriber back
            self.node.feed(request, None);
        } else {
            // Reverse mode: this session's socket becomes the data stream
            let (client_side, server_side) = stream_pair();
            self.node.feed(request, Some(server_side));
            self.data_stream = Some(client_side);
        }
        Ok(PublishReply {
            ha_sites: self.node.ha_sites.lock().clone(),
        })
    }

    fn stop_publish_table(
        &mut self,
        local_ip: &str,
        local_port: u16,
        table: &str,
        action: &str,
    ) -> Result<(), SessionError> {
        self.node.stops.lock().push((
            local_ip.to_owned(),
            local_port,
            table.to_owned(),
            action.to_owned(),
        ));
        Ok(())
    }

    fn run_script(&mut self, script: &str, _options: &TaskOptions) -> Result<Value, SessionError> {
        if self.node.failing_scripts.lock().iter().any(|s| s == script) {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset mid-script",
            )));
        }
        Ok(Value::String(format!("ok:{script}")))
    }

    fn run_function(
        &mut self,
        function: &str,
        args: &[Value],
        _options: &TaskOptions,
    ) -> Result<Value, SessionError> {
        if self.node.failing_scripts.lock().iter().any(|s| s == function) {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset mid-call",
            )));
        }
        Ok(Value::Long(args.len() as i64))
    }

    fn into_data_stream(self: Box<Self>) -> Option<TcpStream> {
        self.data_stream
    }
}

/// Routes connect calls to mock nodes by address
pub struct MockConnector {
    nodes: HashMap<(String, u16), Arc<NodeState>>,
}

impl Connector for MockConnector {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Session>, SessionError> {
        let node = self
            .nodes
            .get(&(host.to_owned(), port))
            .ok_or_else(|| {
                SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("unknown node {host}:{port}"),
                ))
            })?;
        node.connects.fetch_add(1, Ordering::AcqRel);
        if !node.reachable.load(Ordering::Acquire) {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{host}:{port} refused"),
            )));
        }
        Ok(Box::new(MockSession {
            node: Arc::clone(node),
            data_stream: None,
        }))
    }
}

/// Builder for a set of mock publisher nodes
#[derive(Default)]
pub struct MockCluster {
    nodes: HashMap<(String, u16), Arc<NodeState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        host: &str,
        port: u16,
        version: &str,
        columns: &[&str],
    ) -> Arc<NodeState> {
        let node = Arc::new(NodeState {
            host: host.to_owned(),
            port,
            version: version.to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            reachable: AtomicBool::new(true),
            redirect: Mutex::new(None),
            ha_sites: Mutex::new(Vec::new()),
            connects: AtomicU64::new(0),
            publishes: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            feeder: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            failing_scripts: Mutex::new(Vec::new()),
        });
        self.nodes.insert((host.to_owned(), port), Arc::clone(&node));
        node
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            nodes: self.nodes.clone(),
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind pair listener");
    let addr = listener.local_addr().expect("pair addr");
    let client = TcpStream::connect(addr).expect("pair connect");
    let (server, _) = listener.accept().expect("pair accept");
    (client, server)
}

/// An OS-assigned port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("probe port");
    listener.local_addr().expect("probe addr").port()
}

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn long_col(values: &[i64]) -> Vector {
    Vector {
        data_type: DataType::Long,
        values: values.iter().map(|v| Value::Long(*v)).collect(),
    }
}

pub fn sym_col(values: &[&str]) -> Vector {
    Vector {
        data_type: DataType::Symbol,
        values: values.iter().map(|v| Value::Symbol((*v).to_owned())).collect(),
    }
}

/// A two-column data frame whose first column carries the row offsets
pub fn offsets_frame(topic: &str, last_offset: i64, offsets: &[i64]) -> Frame {
    let doubled: Vec<i64> = offsets.iter().map(|o| o * 10).collect();
    data_frame(&[topic], last_offset, vec![long_col(offsets), long_col(&doubled)])
}

/// Schema (handshake) frame for a topic
pub fn handshake(topic: &str, table: &str, columns: &[&str]) -> Frame {
    schema_frame(&[topic], table, columns)
}

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
