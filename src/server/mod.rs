//! The server engine.
//!
//! A single-threaded readiness loop over listening sockets and worker PPC
//! channels. Each [`Server::turn`] spawns requested or missing pre-fork
//! workers, waits up to one second for readiness, reaps exited children,
//! flushes logs when due, and handles ready descriptors in ascending order.
//!
//! Pre-fork listeners are never watched by the parent; their workers block
//! in `accept` on the shared socket.

mod host;
mod privileges;
pub mod signals;
mod watch;
mod worker;

pub use privileges::check_root;
pub use watch::{Interest, WatchSet};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{prepare_connection, Backend, ProcessModel, Registry};
use crate::log::LogSink;
use crate::ppc::{Dispatcher, Origin, PpcChannel, PpcClient};
use crate::supervisor::{self, ChildTable, Forked, SlotId};
use crate::types::{BackendId, Config, Error, Overflow, Result, ServerConfig};
use host::Host;
use worker::{LogRoute, Worker};

/// Upper bound on one readiness wait.
const POLL_TIMEOUT_MS: u16 = 1000;

/// Flush period when no log device sets one.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Poll step while waiting for children to exit at shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// How long SIGKILLed children get to be collected.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Parent end of a worker's PPC channel.
#[derive(Debug)]
struct WorkerChannel {
    pid: Pid,
    backend: BackendId,
    channel: PpcChannel,
    /// Turn in which the channel was opened. Readiness gathered before
    /// that turn's wait never applies to it.
    opened: u64,
}

/// The server engine.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    backends: Vec<Backend>,
    watch: WatchSet,
    listeners: BTreeMap<RawFd, usize>,
    channels: BTreeMap<RawFd, WorkerChannel>,
    children: ChildTable,
    pending: VecDeque<BackendId>,
    dispatcher: Dispatcher,
    log: Option<LogSink>,
    flush_interval: Duration,
    flush_at: Instant,
    turns: u64,
    started: bool,
}

impl Server {
    /// Build every configured backend. `foreground` forces the iterative
    /// model on all of them.
    pub fn create(config: &Config, registry: &Registry, foreground: bool) -> Result<Self> {
        config.validate()?;

        let default_model = match &config.server.model {
            Some(m) => m.parse()?,
            None => ProcessModel::default(),
        };

        let mut backends: Vec<Backend> = Vec::with_capacity(config.server.backends.len());
        for (index, (name, be_config)) in config.backend_sections().enumerate() {
            match registry.create(BackendId::new(index), name, be_config, default_model) {
                Ok(mut backend) => {
                    if foreground {
                        backend.set_model(ProcessModel::Iterative);
                    }
                    backends.push(backend);
                }
                Err(e) => {
                    for backend in &mut backends {
                        backend.free();
                    }
                    return Err(e);
                }
            }
        }

        let log = config.log.as_ref().map(LogSink::open).transpose()?;
        let flush_interval = log
            .iter()
            .chain(backends.iter().filter_map(Backend::log))
            .map(LogSink::flush_interval)
            .min()
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);

        tracing::debug!(backends = backends.len(), model = %default_model, foreground, "server created");

        Ok(Self {
            config: config.server.clone(),
            backends,
            watch: WatchSet::new(),
            listeners: BTreeMap::new(),
            channels: BTreeMap::new(),
            children: ChildTable::new(),
            pending: VecDeque::new(),
            dispatcher: Dispatcher::with_builtins(),
            log,
            flush_interval,
            flush_at: Instant::now() + flush_interval,
            turns: 0,
            started: false,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// Bound address of a backend, once started.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.backend(name).and_then(Backend::local_addr)
    }

    pub fn children(&self) -> &ChildTable {
        &self.children
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch
    }

    pub fn log(&self) -> Option<&LogSink> {
        self.log.as_ref()
    }

    /// Parent end of the PPC channel of worker `pid`.
    pub fn worker_channel(&self, pid: Pid) -> Option<RawFd> {
        self.channels
            .iter()
            .find(|(_, w)| w.pid == pid)
            .map(|(&fd, _)| fd)
    }

    /// Spawn requests not yet honoured.
    pub fn pending_spawns(&self) -> usize {
        self.pending.len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind listeners, chroot, drop privileges, check for root and install
    /// signal handlers.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        for index in 0..self.backends.len() {
            let backend = &mut self.backends[index];
            backend.listen()?;
            if backend.model() == ProcessModel::Prefork {
                continue;
            }
            if let Some(listener) = backend.listener() {
                listener.set_nonblocking(true)?;
                let fd = listener.as_raw_fd();
                self.listeners.insert(fd, index);
                self.watch.watch(fd, Interest::READ);
            }
        }

        privileges::apply(&self.config)?;

        signals::reset();
        signals::install()?;

        self.flush_at = Instant::now() + self.flush_interval;
        self.started = true;
        tracing::info!(backends = self.backends.len(), "server started");
        Ok(())
    }

    /// Start, then turn until stopped. Children are shut down on the way out.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        let result = loop {
            if self.stop_requested() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                break Err(e);
            }
        };
        self.shutdown_children();
        result
    }

    /// Ask the loop to stop after the current turn.
    pub fn stop(&self) {
        signals::request_stop();
    }

    pub fn stop_requested(&self) -> bool {
        signals::stop_requested()
    }

    /// Run `term` on every backend, close listeners and channels, flush logs.
    pub fn close(&mut self) {
        for (fd, _) in std::mem::take(&mut self.listeners) {
            self.watch.unwatch(fd, Interest::READ);
        }
        for (fd, _) in std::mem::take(&mut self.channels) {
            self.watch.unwatch(fd, Interest::READ);
        }
        for backend in &mut self.backends {
            backend.free();
        }
        self.flush_logs();
        tracing::info!("server closed");
    }

    /// SIGTERM every child, wait out the grace period, SIGKILL survivors.
    pub fn shutdown_children(&mut self) {
        self.reap();
        if self.children.is_empty() {
            return;
        }

        let sent = supervisor::signal_all(&self.children, Signal::SIGTERM);
        tracing::info!(children = sent, grace = ?self.config.shutdown_grace, "stopping children");

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.children.pids().is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
            self.reap();
        }

        if !self.children.pids().is_empty() {
            let killed = supervisor::signal_all(&self.children, Signal::SIGKILL);
            tracing::warn!(children = killed, "children killed after grace period");
            let deadline = Instant::now() + KILL_WAIT;
            while !self.children.pids().is_empty() && Instant::now() < deadline {
                thread::sleep(SHUTDOWN_POLL);
                self.reap();
            }
            let left = self.children.pids().len();
            if left > 0 {
                tracing::error!(children = left, "children not collected after SIGKILL");
            }
        }
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// One loop iteration.
    pub fn turn(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::state_transition("turn before start"));
        }

        self.spawn_pending();
        self.top_up();

        let ready = self.wait()?;
        self.turns += 1;

        if signals::take_reap() {
            self.reap();
        }

        if Instant::now() >= self.flush_at {
            self.flush_logs();
            self.flush_at = Instant::now() + self.flush_interval;
        }

        self.dispatch_ready(ready)
    }

    /// Handle read-ready descriptors in ascending order. A descriptor number
    /// closed and reused earlier in the same pass is left for the next turn.
    fn dispatch_ready(&mut self, ready: Vec<RawFd>) -> Result<()> {
        for fd in ready {
            if self.stop_requested() {
                break;
            }
            if let Some(&index) = self.listeners.get(&fd) {
                self.accept_on(index)?;
            } else if self
                .channels
                .get(&fd)
                .is_some_and(|w| w.opened < self.turns)
            {
                self.handle_ppc(fd);
            }
        }
        Ok(())
    }

    fn borrow_fd(&self, fd: RawFd) -> Option<BorrowedFd<'_>> {
        if let Some(&index) = self.listeners.get(&fd) {
            return self.backends[index].listener().map(|l| l.as_fd());
        }
        self.channels.get(&fd).map(|w| w.channel.as_fd())
    }

    /// Wait for readiness; returns read-ready fds in ascending order.
    fn wait(&mut self) -> Result<Vec<RawFd>> {
        let snapshot = self.watch.snapshot();
        loop {
            let mut fds = Vec::with_capacity(snapshot.len());
            let mut order = Vec::with_capacity(snapshot.len());
            for &(fd, interest) in &snapshot {
                if let Some(borrowed) = self.borrow_fd(fd) {
                    fds.push(PollFd::new(borrowed, interest.poll_flags()));
                    order.push(fd);
                }
            }

            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => return Ok(Vec::new()),
                Ok(_) => {
                    let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                    return Ok(order
                        .into_iter()
                        .zip(fds.iter())
                        .filter(|(_, pfd)| pfd.revents().is_some_and(|r| r.intersects(readable)))
                        .map(|(fd, _)| fd)
                        .collect());
                }
                Err(Errno::EINTR) => {
                    if self.stop_requested() || signals::reap_pending() {
                        return Ok(Vec::new());
                    }
                }
                Err(e) => return Err(Error::Sys(e)),
            }
        }
    }

    fn reap(&mut self) {
        for reaped in supervisor::reap(&mut self.children) {
            let stale: Vec<RawFd> = self
                .channels
                .iter()
                .filter(|(_, w)| w.pid == reaped.pid)
                .map(|(&fd, _)| fd)
                .collect();
            for fd in stale {
                self.close_channel(fd);
            }
            if let Some(backend) = reaped.backend {
                tracing::debug!(pid = %reaped.pid, backend = %backend, reason = %reaped.reason, "worker retired");
            }
        }
    }

    fn flush_logs(&mut self) {
        let sinks = self
            .log
            .iter_mut()
            .chain(self.backends.iter_mut().filter_map(Backend::log_mut));
        for sink in sinks {
            if let Err(e) = sink.flush() {
                tracing::warn!(error = %e, "log flush failed");
            }
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    fn accept_on(&mut self, index: usize) -> Result<()> {
        let Some(listener) = self.backends[index].listener() else {
            return Ok(());
        };
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(());
            }
            Err(e) => {
                return match e.raw_os_error().map(Errno::from_raw) {
                    Some(Errno::EBADF) | Some(Errno::EINVAL) => Err(Error::Io(e)),
                    _ => {
                        let err = Error::resource(format!("accept: {}", e));
                        tracing::warn!(backend = %self.backends[index].name(), error = %err, "accept failed");
                        Ok(())
                    }
                };
            }
        };
        if let Err(e) = prepare_connection(&stream) {
            tracing::warn!(%peer, error = %e, "connection dropped");
            return Ok(());
        }

        match self.backends[index].model() {
            ProcessModel::Iterative => self.serve_here(index, stream, peer),
            ProcessModel::Fork => self.serve_forked(index, stream, peer),
            ProcessModel::Prefork => {
                tracing::debug!(%peer, "connection on a prefork listener dropped");
            }
        }
        Ok(())
    }

    fn serve_here(&mut self, index: usize, stream: TcpStream, peer: SocketAddr) {
        let Server { backends, log, .. } = self;
        backends[index].serve(stream, peer, log.as_mut());
    }

    fn serve_forked(&mut self, index: usize, stream: TcpStream, peer: SocketAddr) {
        let backend = &self.backends[index];
        let (id, max, overflow) = (backend.id(), backend.config().max_children, backend.config().overflow);

        let slot = match self.children.reserve(id, max) {
            Ok(slot) => slot,
            Err(e) => {
                match overflow {
                    Overflow::Reject => {
                        tracing::warn!(backend = %backend.name(), %peer, error = %e, "connection rejected");
                    }
                    Overflow::Iterative => {
                        tracing::debug!(backend = %backend.name(), %peer, "serving in parent");
                        self.serve_here(index, stream, peer);
                    }
                }
                return;
            }
        };

        if let Err(e) = self.spawn(index, slot, Some((stream, peer))) {
            tracing::warn!(backend = %self.backends[index].name(), %peer, error = %e, "fork failed");
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    fn spawn_pending(&mut self) {
        while let Some(id) = self.pending.pop_front() {
            if self.stop_requested() {
                self.pending.clear();
                return;
            }
            let index = id.as_usize();
            let Some(backend) = self.backends.get(index) else {
                continue;
            };
            match self.children.reserve(id, backend.config().max_children) {
                Ok(slot) => {
                    if let Err(e) = self.spawn(index, slot, None) {
                        tracing::warn!(backend = %id, error = %e, "replacement spawn failed");
                    }
                }
                Err(e) => tracing::debug!(backend = %id, error = %e, "replacement dropped"),
            }
        }
    }

    /// Bring every pre-fork backend up to its pool target.
    fn top_up(&mut self) {
        if self.stop_requested() {
            return;
        }
        for index in 0..self.backends.len() {
            let backend = &self.backends[index];
            if backend.model() != ProcessModel::Prefork {
                continue;
            }
            let (id, target, max) = (
                backend.id(),
                backend.config().start_children,
                backend.config().max_children,
            );
            while self.children.count_for(id) < target {
                let slot = match self.children.reserve(id, max) {
                    Ok(slot) => slot,
                    Err(e) => {
                        tracing::warn!(backend = %id, error = %e, "pool top-up stopped");
                        break;
                    }
                };
                if let Err(e) = self.spawn(index, slot, None) {
                    tracing::warn!(backend = %id, error = %e, "pool spawn failed");
                    break;
                }
            }
        }
    }

    /// Fork a worker into a reserved slot. With a connection the worker
    /// serves only that one; without, it runs the pre-fork accept loop.
    fn spawn(
        &mut self,
        index: usize,
        slot: SlotId,
        conn: Option<(TcpStream, SocketAddr)>,
    ) -> Result<()> {
        match supervisor::fork_worker() {
            Ok(Forked::Parent { pid, channel }) => {
                self.children.commit(slot, pid)?;
                let backend = self.backends[index].id();
                self.track_channel(pid, backend, channel);
                tracing::debug!(%pid, backend = %self.backends[index].name(), "worker spawned");
                Ok(())
            }
            Ok(Forked::Child { client }) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let worker = self.become_worker(index, client);
                    match conn {
                        Some((stream, peer)) => worker.run_fork(stream, peer),
                        None => worker.run_prefork(),
                    }
                }));
                worker::finish(outcome)
            }
            Err(e) => {
                self.children.abandon(slot)?;
                Err(e)
            }
        }
    }

    /// Strip a freshly forked child down to its own backend.
    fn become_worker(&mut self, index: usize, client: PpcClient) -> Worker<'_> {
        signals::reset();
        self.started = false;
        self.pending.clear();
        self.listeners.clear();
        // Sibling channels belong to the parent.
        self.channels.clear();
        for (i, backend) in self.backends.iter_mut().enumerate() {
            if i != index {
                backend.close_listener();
            }
        }

        let route = self.log_route(index);
        Worker::new(&mut self.backends[index], client, route)
    }

    /// Direct sinks are written from the worker; buffered ones stay with
    /// the parent and are reached through PPC.
    fn log_route(&mut self, index: usize) -> LogRoute {
        let backend = &mut self.backends[index];
        let direct = match backend.log().or(self.log.as_ref()) {
            None => return LogRoute::Discard,
            Some(sink) => sink.is_direct(),
        };
        if !direct {
            return LogRoute::Remote;
        }
        match backend.take_log().or_else(|| self.log.take()) {
            Some(sink) => LogRoute::Direct(sink),
            None => LogRoute::Discard,
        }
    }

    // =========================================================================
    // PPC
    // =========================================================================

    /// Read and dispatch one command from a worker channel.
    fn handle_ppc(&mut self, fd: RawFd) {
        let Server {
            channels,
            backends,
            children,
            pending,
            log,
            dispatcher,
            ..
        } = self;
        let Some(worker) = channels.get_mut(&fd) else {
            return;
        };
        let origin = Origin {
            pid: worker.pid,
            backend: worker.backend,
        };

        let frame = match worker.channel.read_command() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::trace!(pid = %origin.pid, "ppc channel closed by worker");
                self.close_channel(fd);
                return;
            }
            Err(e) => {
                tracing::warn!(pid = %origin.pid, error = %e, "ppc channel error");
                self.close_channel(fd);
                return;
            }
        };

        let mut host = Host {
            backends,
            children,
            pending,
            log: log.as_mut(),
        };
        let result = dispatcher.dispatch(&mut host, origin, frame.opcode, &frame.payload);

        if let Err(e) = &result {
            if e.closes_channel() {
                tracing::warn!(pid = %origin.pid, error = %e, "closing ppc channel");
                self.close_channel(fd);
                return;
            }
            tracing::debug!(pid = %origin.pid, error = %e, "ppc command refused");
        }

        if let Err(e) = worker.channel.respond(&result) {
            tracing::warn!(pid = %origin.pid, error = %e, "ppc response failed");
            self.close_channel(fd);
        }
    }

    fn track_channel(&mut self, pid: Pid, backend: BackendId, channel: PpcChannel) -> RawFd {
        let fd = channel.as_raw_fd();
        self.watch.watch(fd, Interest::READ);
        self.channels.insert(
            fd,
            WorkerChannel {
                pid,
                backend,
                channel,
                opened: self.turns,
            },
        );
        fd
    }

    fn close_channel(&mut self, fd: RawFd) {
        self.watch.unwatch(fd, Interest::READ);
        self.channels.remove(&fd);
    }
}
