//! Worker side of a fork.
//!
//! A worker keeps only its own backend's listener and its private PPC
//! client, serves either one connection (fork model) or up to its quota
//! (pre-fork model), and leaves through `_exit`.

use nix::errno::Errno;
use std::io::ErrorKind;
use std::mem::ManuallyDrop;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::signals;
use crate::backend::{prepare_connection, Backend};
use crate::log::{Level, LogRecord, LogSink, LogWriter};
use crate::ppc::PpcClient;
use crate::supervisor;
use crate::types::{Error, Result};

/// Exit status of a worker whose body panicked.
const PANIC_STATUS: i32 = 70;

/// Where a worker's connection log lines go.
#[derive(Debug)]
pub(super) enum LogRoute {
    /// A sink any process may write to.
    Direct(LogSink),
    /// Through `LogAppend` to the parent's sink.
    Remote,
    /// No sink configured.
    Discard,
}

fn lock(client: &Mutex<PpcClient>) -> Result<MutexGuard<'_, PpcClient>> {
    client
        .lock()
        .map_err(|_| Error::protocol("ppc client lock poisoned"))
}

struct WorkerLog<'a> {
    route: &'a mut LogRoute,
    client: &'a Mutex<PpcClient>,
}

impl LogWriter for WorkerLog<'_> {
    fn write_line(&mut self, level: Level, line: &str) -> Result<()> {
        match self.route {
            LogRoute::Direct(sink) => sink.write(level, line),
            LogRoute::Remote => {
                let record = LogRecord::new(level, crate::log::truncate_line(line));
                lock(self.client)?.log_append(&record)
            }
            LogRoute::Discard => Ok(()),
        }
    }
}

// =============================================================================
// Slow-request watchdog
// =============================================================================

enum Tick {
    Start,
    Done,
}

/// Asks the parent for a replacement when one serve runs past its budget.
struct Watchdog {
    tx: Sender<Tick>,
    replaced: Arc<AtomicBool>,
}

impl Watchdog {
    fn spawn(budget: Duration, client: Arc<Mutex<PpcClient>>, backend: String) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let replaced = Arc::new(AtomicBool::new(false));
        let flag = replaced.clone();
        thread::Builder::new()
            .name("slow-request-watchdog".to_string())
            .spawn(move || watchdog_loop(rx, budget, client, flag, backend))?;
        Ok(Self { tx, replaced })
    }

    fn arm(&self) {
        let _ = self.tx.send(Tick::Start);
    }

    fn disarm(&self) {
        let _ = self.tx.send(Tick::Done);
    }

    fn replaced(&self) -> bool {
        self.replaced.load(Ordering::SeqCst)
    }
}

fn watchdog_loop(
    rx: Receiver<Tick>,
    budget: Duration,
    client: Arc<Mutex<PpcClient>>,
    replaced: Arc<AtomicBool>,
    backend: String,
) {
    while let Ok(tick) = rx.recv() {
        if matches!(tick, Tick::Done) {
            continue;
        }
        match rx.recv_timeout(budget) {
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => {
                if replaced.load(Ordering::SeqCst) {
                    continue;
                }
                match lock(&client).and_then(|mut c| c.fork_child()) {
                    Ok(()) => {
                        tracing::info!(backend = %backend, budget = ?budget, "slow request, replacement requested");
                        replaced.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::debug!(backend = %backend, error = %e, "replacement refused");
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// A forked worker bound to one backend.
pub(super) struct Worker<'a> {
    backend: &'a mut Backend,
    client: Arc<Mutex<PpcClient>>,
    route: LogRoute,
}

impl<'a> Worker<'a> {
    pub(super) fn new(backend: &'a mut Backend, client: PpcClient, route: LogRoute) -> Self {
        Self {
            backend,
            client: Arc::new(Mutex::new(client)),
            route,
        }
    }

    fn serve_one(&mut self, stream: TcpStream, peer: SocketAddr) {
        let mut log = WorkerLog {
            route: &mut self.route,
            client: &self.client,
        };
        self.backend.serve_with(stream, peer, &mut log);
    }

    /// Serve the connection the parent accepted, then return.
    pub(super) fn run_fork(mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        self.backend.close_listener();
        self.serve_one(stream, peer);
        Ok(())
    }

    /// Accept on the shared listener until the quota is used up or a stop
    /// is requested. A used-up quota asks the parent for a replacement.
    pub(super) fn run_prefork(mut self) -> Result<()> {
        let listener = ManuallyDrop::new(
            self.backend
                .take_listener()
                .ok_or_else(|| Error::resource("worker has no listener"))?,
        );
        signals::set_worker_listener(listener.as_raw_fd());

        let quota = self.backend.config().max_requests_per_child;
        let budget = self.backend.config().slow_request;
        let watchdog = if budget.is_zero() {
            None
        } else {
            Some(Watchdog::spawn(
                budget,
                self.client.clone(),
                self.backend.name().to_string(),
            )?)
        };

        let mut served = 0;
        while served < quota && !signals::stop_requested() {
            let (stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if signals::stop_requested() => {
                    tracing::debug!(error = %e, "accept ended by stop");
                    break;
                }
                Err(e) => match e.raw_os_error().map(Errno::from_raw) {
                    Some(Errno::EBADF) | Some(Errno::EINVAL) => return Err(e.into()),
                    _ => {
                        tracing::warn!(backend = %self.backend.name(), error = %e, "accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = prepare_connection(&stream) {
                tracing::warn!(backend = %self.backend.name(), %peer, error = %e, "connection dropped");
                continue;
            }
            served += 1;

            if let Some(w) = &watchdog {
                w.arm();
            }
            self.serve_one(stream, peer);
            if let Some(w) = &watchdog {
                w.disarm();
                if w.replaced() {
                    tracing::debug!(backend = %self.backend.name(), served, "retiring after slow request");
                    return Ok(());
                }
            }
        }

        if !signals::clear_worker_listener() {
            // Closed by a stop request.
            return Ok(());
        }
        if served >= quota {
            tracing::debug!(backend = %self.backend.name(), served, "quota reached");
            if let Err(e) = lock(&self.client).and_then(|mut c| c.fork_child()) {
                tracing::warn!(backend = %self.backend.name(), error = %e, "replacement request failed");
            }
        }
        Ok(())
    }
}

/// Leave the worker process without running destructors or flushing
/// buffers inherited from the parent.
pub(super) fn finish(outcome: thread::Result<Result<()>>) -> ! {
    let status = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::warn!(pid = %nix::unistd::getpid(), error = %e, "worker failed");
            1
        }
        Err(_) => PANIC_STATUS,
    };
    supervisor::exit_now(status)
}
