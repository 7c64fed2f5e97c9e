//! # Connection driver
//!
//! A driver pumps messages from its input comms to its output comms on a dedicated worker thread,
//! tracking which producers (input models) and consumers (output models) are still attached.
//! Once every input model signed off, it emits one EOF downstream and shuts down.
//!
//! Specializations plug in through [`Relay`]. The relay's extra state lives in the same registry
//! behind the driver's single lock, so sign-off accounting and relay bookkeeping never diverge.
//! The lock is only held for short registry mutations and prompt sends, never across a receive.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    comm::{CommConfig, Communicator},
    error::{CommError, DriverError, ErrorKind},
    message::{CommMessage, Flag},
};

pub use self::builder::{ConnectionBuilder, DriverConfig};

mod builder;

/// Lifecycle of a driver. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Init,
    Open,
    Closing,
    Closed,
}

/// Which model registry an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Input,
    Output,
}

/// Lock-guarded mutable state of a driver.
#[derive(Debug)]
pub struct Registry<S> {
    input_models: HashSet<String>,
    output_models: HashSet<String>,
    state: RunState,
    eof_sent: bool,
    failure: Option<CommError>,

    /// Relay-specific state.
    pub ext: S,
}

/// Specialization hooks of a [`ConnectionDriver`].
///
/// Every hook receives the driver's [`Connection`]. Hooks that are handed a `&mut Registry` run
/// with the driver lock held; they must go through the registry rather than connection methods
/// that lock (`lock`, `state`, `request_stop`, `fail`).
pub trait Relay: Sized + Send + Sync + 'static {
    type State: Default + Send + 'static;

    /// Runs on the worker thread before the first receive.
    fn before_loop(&self, conn: &Connection<Self>) -> Result<(), CommError> {
        let _ = conn;
        Ok(())
    }

    /// Forwards one received message. `Ok(false)` reports that this single message wasn't
    /// delivered; the loop carries on. `Err` with a fatal kind stops the driver.
    fn send_message(&self, conn: &Connection<Self>, msg: CommMessage) -> Result<bool, CommError> {
        conn.forward(msg)
    }

    /// Removes a model from a registry. Returns whether that registry is now empty.
    fn remove_model(
        &self,
        conn: &Connection<Self>,
        reg: &mut Registry<Self::State>,
        side: Side,
        name: &str,
    ) -> Result<bool, CommError> {
        let _ = conn;
        Ok(reg.remove_model(side, name))
    }

    /// A received message failed validation. Return `true` to keep the loop running.
    fn on_rejected(&self, conn: &Connection<Self>, err: CommError) -> bool {
        tracing::warn!(driver = %conn.name(), error = %err, "dropping rejected message");
        true
    }

    /// Runs after every loop iteration, except the one that ended the loop abnormally.
    fn after_iteration(&self, conn: &Connection<Self>) {
        let _ = conn;
    }

    /// Runs once before the driver closes its comms.
    fn before_close(&self, conn: &Connection<Self>) {
        let _ = conn;
    }
}

/// Plain pass-through relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct Forward;

impl Relay for Forward {
    type State = ();
}

/// Shared core of a driver: comms, registry and counters. Accessible to relay hooks.
pub struct Connection<R: Relay> {
    name: String,
    icomms: Vec<Arc<dyn Communicator>>,
    ocomms: Vec<Arc<dyn Communicator>>,
    registry: Mutex<Registry<R::State>>,
    closed: Condvar,
    stop: AtomicBool,
    next_input: AtomicUsize,
    n_recv: AtomicU64,
    n_sent: AtomicU64,
    poll_timeout: Duration,
    relay: R,
}

/// Owns a [`Connection`] and the worker thread running it.
pub struct ConnectionDriver<R: Relay = Forward> {
    conn: Arc<Connection<R>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

assert::assert_impl_all!(ConnectionDriver<Forward>: Send, Sync);

// ========================================================== Registry ===|

impl<S> Registry<S> {
    fn new(input_models: HashSet<String>, output_models: HashSet<String>) -> Self
    where
        S: Default,
    {
        Self {
            input_models,
            output_models,
            state: RunState::Init,
            eof_sent: false,
            failure: None,
            ext: S::default(),
        }
    }

    pub fn models(&self, side: Side) -> &HashSet<String> {
        match side {
            Side::Input => &self.input_models,
            Side::Output => &self.output_models,
        }
    }

    /// Returns `true` if the model wasn't registered yet.
    pub fn add_model(&mut self, side: Side, name: &str) -> bool {
        self.models_mut(side).insert(name.to_string())
    }

    /// Idempotent; removing an unknown model is a no-op. Returns whether the registry is empty
    /// afterwards.
    pub fn remove_model(&mut self, side: Side, name: &str) -> bool {
        let models = self.models_mut(side);
        models.remove(name);
        models.is_empty()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == RunState::Open
    }

    /// Moves an open driver to `Closing`. For hooks that already hold the lock.
    pub fn begin_closing(&mut self) {
        if self.state == RunState::Open {
            self.state = RunState::Closing;
        }
    }

    fn models_mut(&mut self, side: Side) -> &mut HashSet<String> {
        match side {
            Side::Input => &mut self.input_models,
            Side::Output => &mut self.output_models,
        }
    }
}

// ========================================================== Connection ===|

impl<R: Relay> Connection<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn icomms(&self) -> &[Arc<dyn Communicator>] {
        &self.icomms
    }

    pub fn ocomms(&self) -> &[Arc<dyn Communicator>] {
        &self.ocomms
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Acquires the driver lock.
    pub fn lock(&self) -> MutexGuard<'_, Registry<R::State>> {
        self.registry.lock()
    }

    pub fn state(&self) -> RunState {
        self.registry.lock().state
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && self.state() == RunState::Open
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Asks the worker to leave its loop at the next iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.registry.lock().begin_closing();
    }

    pub fn n_received(&self) -> u64 {
        self.n_recv.load(Ordering::Acquire)
    }

    pub fn n_sent(&self) -> u64 {
        self.n_sent.load(Ordering::Acquire)
    }

    /// Sends a message on every output comm, splitting it into chunks when needed.
    ///
    /// A rejected message yields `Ok(false)`; a fatal transport error is returned.
    pub fn forward(&self, msg: CommMessage) -> Result<bool, CommError> {
        for comm in &self.ocomms {
            match comm.send_chunked(&msg) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Fatal => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        driver = %self.name,
                        comm = %comm.name(),
                        error = %e,
                        "message not sent"
                    );
                    return Ok(false);
                }
            }
        }

        self.n_sent.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Signs a model off. When the input registry becomes empty, emits one EOF downstream and
    /// moves the driver to `Closing`. Returns whether the registry is empty.
    pub fn remove_model(&self, side: Side, name: &str) -> Result<bool, CommError> {
        let mut reg = self.registry.lock();
        let is_empty = self.relay.remove_model(self, &mut reg, side, name)?;

        if is_empty && side == Side::Input {
            if reg.is_open() {
                tracing::debug!(driver = %self.name, "all input models signed off");
            }
            reg.begin_closing();
            self.emit_eof(&mut reg)?;
        }

        Ok(is_empty)
    }

    /// Sends EOF downstream unless it was already sent.
    pub fn emit_eof(&self, reg: &mut Registry<R::State>) -> Result<(), CommError> {
        if std::mem::replace(&mut reg.eof_sent, true) {
            return Ok(());
        }

        for comm in &self.ocomms {
            comm.send_eof(&self.name)?;
        }

        Ok(())
    }

    /// Records a failure and moves the driver to `Closing`. Only the first failure is kept.
    pub fn fail(&self, err: CommError) {
        tracing::error!(driver = %self.name, error = %err, "driver failed");

        let mut reg = self.registry.lock();
        reg.begin_closing();
        reg.failure.get_or_insert(err);
    }

    /// Receives from the input comms in turn, splitting the poll timeout between them.
    fn recv_message(&self) -> Result<CommMessage, CommError> {
        let n = self.icomms.len();
        let timeout = (self.poll_timeout / n as u32).max(Duration::from_millis(1));

        for _ in 0..n {
            let idx = self.next_input.fetch_add(1, Ordering::Relaxed) % n;
            match self.icomms[idx].recv_chunked(timeout) {
                Ok(msg) if msg.is_empty() => continue,
                Ok(msg) => return Ok(msg),
                Err(e) if e.is_temporary() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(CommMessage::empty())
    }

    /// One pass of the loop. Returns `false` when the loop must end abnormally.
    fn run_iteration(&self) -> bool {
        let msg = match self.recv_message() {
            Ok(msg) => msg,
            Err(e) if e.kind() == ErrorKind::TypeMismatch => {
                return self.relay.on_rejected(self, e);
            }
            // Comms closed under us by `terminate`.
            Err(_) if self.is_stop_requested() => CommMessage::empty(),
            Err(e) => {
                self.fail(e);
                CommMessage::failure()
            }
        };

        match msg.flag {
            Flag::Empty => true,
            Flag::Failure => false,
            Flag::Eof => {
                let model = msg.model().unwrap_or_default().to_string();
                tracing::debug!(driver = %self.name, %model, "received EOF");

                match self.remove_model(Side::Input, &model) {
                    Ok(_) => true,
                    Err(e) => {
                        self.fail(e);
                        false
                    }
                }
            }
            Flag::Success => {
                self.n_recv.fetch_add(1, Ordering::AcqRel);

                match self.relay.send_message(self, msg) {
                    Ok(true) => true,
                    Ok(false) => {
                        tracing::warn!(driver = %self.name, "failed to send message");
                        true
                    }
                    Err(e) if e.is_fatal() => {
                        self.fail(e);
                        false
                    }
                    Err(e) => {
                        tracing::warn!(driver = %self.name, error = %e, "failed to send message");
                        true
                    }
                }
            }
        }
    }

    /// Worker body.
    fn run(&self) {
        tracing::debug!(driver = %self.name, "loop started");

        match self.relay.before_loop(self) {
            Ok(()) => {
                while self.is_running() {
                    if !self.run_iteration() {
                        break;
                    }
                    self.relay.after_iteration(self);
                }
            }
            Err(e) => self.fail(e),
        }

        self.close_comms();
        tracing::debug!(driver = %self.name, "loop finished");
    }

    /// Closes every comm and marks the driver `Closed`.
    fn close_comms(&self) {
        self.relay.before_close(self);

        for comm in self.icomms.iter().chain(&self.ocomms) {
            comm.close();
        }

        let mut reg = self.registry.lock();
        reg.state = RunState::Closed;
        self.closed.notify_all();
    }
}

// ========================================================== ConnectionDriver ===|

impl ConnectionDriver<Forward> {
    pub fn builder(name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(name)
    }
}

impl<R: Relay> ConnectionDriver<R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: String,
        icomms: Vec<Arc<dyn Communicator>>,
        ocomms: Vec<Arc<dyn Communicator>>,
        input_models: HashSet<String>,
        output_models: HashSet<String>,
        poll_timeout: Duration,
        join_timeout: Duration,
        relay: R,
    ) -> Self {
        Self {
            conn: Arc::new(Connection {
                name,
                icomms,
                ocomms,
                registry: Mutex::new(Registry::new(input_models, output_models)),
                closed: Condvar::new(),
                stop: AtomicBool::new(false),
                next_input: AtomicUsize::new(0),
                n_recv: AtomicU64::new(0),
                n_sent: AtomicU64::new(0),
                poll_timeout,
                relay,
            }),
            worker: Mutex::new(None),
            join_timeout,
        }
    }

    pub fn connection(&self) -> &Connection<R> {
        &self.conn
    }

    pub fn name(&self) -> &str {
        self.conn.name()
    }

    pub fn state(&self) -> RunState {
        self.conn.state()
    }

    /// Opens any comm that isn't open yet and launches the worker thread. A driver starts at most
    /// once.
    pub fn start(&self) -> Result<(), DriverError> {
        {
            let mut reg = self.conn.lock();
            if reg.state != RunState::Init {
                return Err(DriverError::AlreadyStarted(self.name().into()));
            }

            for comm in self.conn.icomms.iter().chain(&self.conn.ocomms) {
                if !comm.is_open() {
                    comm.open()?;
                }
            }

            reg.state = RunState::Open;
        }

        let conn = self.conn.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("driver:{}", self.name()))
            .spawn(move || conn.run());

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                tracing::debug!(driver = %self.name(), "started");
                Ok(())
            }
            Err(e) => {
                self.conn.close_comms();
                Err(DriverError::Spawn(e))
            }
        }
    }

    /// Requests a cooperative stop. The worker exits within one poll timeout.
    pub fn terminate(&self) {
        self.conn.request_stop();
    }

    /// Blocks until the driver is closed or `timeout` elapses. Returns whether it closed. A driver
    /// that was never started has nothing to wait for.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut reg = self.conn.lock();
            if reg.state == RunState::Init {
                return true;
            }
            while reg.state != RunState::Closed {
                if self.conn.closed.wait_until(&mut reg, deadline).timed_out() {
                    return reg.state == RunState::Closed;
                }
            }
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(driver = %self.name(), "worker thread panicked");
            }
        }

        true
    }

    /// Closes the driver's comms. A running driver is stopped first.
    pub fn close_comm(&self) {
        if self.worker.lock().is_none() && self.state() == RunState::Init {
            self.conn.request_stop();
            self.conn.close_comms();
            return;
        }

        self.terminate();
        if !self.wait(self.join_timeout) {
            tracing::warn!(driver = %self.name(), "worker did not stop in time");
        }
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_comm_open(&self) -> bool {
        self.conn.icomms.iter().chain(&self.conn.ocomms).all(|c| c.is_open())
    }

    pub fn is_comm_closed(&self) -> bool {
        self.conn.icomms.iter().chain(&self.conn.ocomms).all(|c| c.is_closed())
    }

    pub fn n_received(&self) -> u64 {
        self.conn.n_received()
    }

    pub fn n_sent(&self) -> u64 {
        self.conn.n_sent()
    }

    pub fn models(&self, side: Side) -> Vec<String> {
        self.conn.lock().models(side).iter().cloned().collect()
    }

    pub fn add_model(&self, side: Side, name: &str) -> bool {
        self.conn.lock().add_model(side, name)
    }

    /// See [`Connection::remove_model`].
    pub fn remove_model(&self, side: Side, name: &str) -> Result<bool, CommError> {
        self.conn.remove_model(side, name)
    }

    /// Takes the error that stopped the driver, if any.
    pub fn take_failure(&self) -> Option<CommError> {
        self.conn.lock().failure.take()
    }

    /// Comm configurations producers use to send into this driver.
    pub fn producer_configs(&self) -> Vec<CommConfig> {
        self.conn.icomms.iter().map(|c| c.opposite_endpoint_config()).collect()
    }

    /// Comm configurations consumers use to receive from this driver.
    pub fn consumer_configs(&self) -> Vec<CommConfig> {
        self.conn.ocomms.iter().map(|c| c.opposite_endpoint_config()).collect()
    }
}

impl<R: Relay> Drop for ConnectionDriver<R> {
    fn drop(&mut self) {
        self.close_comm();
    }
}
