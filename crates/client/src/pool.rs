//! Async RPC worker pool
//!
//! Independent of the streaming path but sharing its session seam. N
//! worker threads each hold one persistent session and pull tasks from a
//! shared queue. Every submitted task reaches exactly one terminal status:
//! a task's I/O failure is terminal for the task, never for its worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rill_protocol::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::SessionError;
use crate::session::{Connector, Session, TaskOptions};

/// How long a worker blocks on the queue before re-checking shutdown
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by the pool API
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool rejected the task because it is shutting down
    #[error("pool is shutting down")]
    ShuttingDown,

    /// A task with this identity was already submitted
    #[error("duplicate task identity `{0}`")]
    DuplicateIdentity(String),

    /// The task carries no script to execute
    #[error("task `{0}` has an empty script")]
    EmptyScript(String),

    /// Worker session establishment failed
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// One unit of work for the pool
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique key the status is published under
    pub identity: String,
    /// Script text, or function name when `is_function` is set
    pub script: String,
    pub args: Vec<Value>,
    pub is_function: bool,
    pub options: TaskOptions,
}

impl Task {
    /// A free-form script task
    pub fn script(identity: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            script: script.into(),
            args: Vec::new(),
            is_function: false,
            options: TaskOptions::default(),
        }
    }

    /// A function-call task
    pub fn function(
        identity: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            identity: identity.into(),
            script: function.into(),
            args,
            is_function: true,
            options: TaskOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Finished,
    Errored,
}

/// Published status of a task; `Finished` and `Errored` are terminal
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub result: Option<Value>,
    pub message: Option<String>,
}

impl TaskStatus {
    fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TaskState::Pending
    }
}

/// Counts workers down to zero at shutdown
struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

/// Worker pool over persistent sessions
pub struct AsyncTaskPool {
    tx: Sender<Task>,
    status: Arc<Mutex<HashMap<String, TaskStatus>>>,
    shutdown: Arc<AtomicBool>,
    latch: Arc<CountDownLatch>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncTaskPool {
    /// Connect `size` worker sessions to `host:port` and start the pool.
    ///
    /// Fails if any worker session cannot be established up front.
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        size: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PoolError> {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let status = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let latch = Arc::new(CountDownLatch::new(size));

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let mut session = connector.connect(host, port)?;
            if !user.is_empty() {
                session.login(user, password, true)?;
            }
            let rx = rx.clone();
            let status = Arc::clone(&status);
            let shutdown = Arc::clone(&shutdown);
            let latch = Arc::clone(&latch);
            let handle = std::thread::Builder::new()
                .name(format!("rill-task-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, session, rx, status, shutdown, latch))
                .map_err(|e| PoolError::Session(SessionError::Io(e)))?;
            workers.push(handle);
        }

        Ok(Self {
            tx,
            status,
            shutdown,
            latch,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a task. Exactly one terminal status will eventually be
    /// published for its identity, unless this call rejects it.
    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        if task.script.is_empty() {
            return Err(PoolError::EmptyScript(task.identity));
        }
        {
            let mut status = self.status.lock();
            if status.contains_key(&task.identity) {
                return Err(PoolError::DuplicateIdentity(task.identity));
            }
            status.insert(task.identity.clone(), TaskStatus::pending());
        }
        self.tx.send(task).map_err(|_| PoolError::ShuttingDown)
    }

    /// Status of a task, if it was ever submitted
    pub fn status(&self, identity: &str) -> Option<TaskStatus> {
        self.status.lock().get(identity).cloned()
    }

    /// Remove and return a terminal status; `None` while still pending
    pub fn take_result(&self, identity: &str) -> Option<TaskStatus> {
        let mut status = self.status.lock();
        if status.get(identity).is_some_and(TaskStatus::is_terminal) {
            status.remove(identity)
        } else {
            None
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the pool: workers finish their current task, close their
    /// sessions, and are joined. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("task pool shutting down");
        self.latch.wait();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("task worker panicked during shutdown");
            }
        }
    }
}

impl Drop for AsyncTaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    mut session: Box<dyn Session>,
    rx: Receiver<Task>,
    status: Arc<Mutex<HashMap<String, TaskStatus>>>,
    shutdown: Arc<AtomicBool>,
    latch: Arc<CountDownLatch>,
) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            drop(session);
            latch.count_down();
            debug!(worker_id, "task worker closed");
            return;
        }
        let task = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                latch.count_down();
                return;
            }
        };

        let outcome = if task.is_function {
            session.run_function(&task.script, &task.args, &task.options)
        } else {
            session.run_script(&task.script, &task.options)
        };

        let mut status = status.lock();
        match outcome {
            Ok(result) => {
                status.insert(
                    task.identity,
                    TaskStatus {
                        state: TaskState::Finished,
                        result: Some(result),
                        message: None,
                    },
                );
            }
            Err(err) => {
                // Terminal for the task, not for the worker
                error!(worker_id, identity = %task.identity, err = %err, "task failed");
                status.insert(
                    task.identity,
                    TaskStatus {
                        state: TaskState::Errored,
                        result: Some(Value::Void),
                        message: Some(err.to_string()),
                    },
                );
            }
        }
    }
}
