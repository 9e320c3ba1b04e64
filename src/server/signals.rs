//! Process-wide signal flags.
//!
//! Handlers only store into atomics. In a worker the stop handler also
//! closes the worker's listener so a blocked `accept` cannot resume.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::types::Result;

static STOP: AtomicBool = AtomicBool::new(false);
static REAP: AtomicBool = AtomicBool::new(false);
static WORKER_LISTENER: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_stop(_signo: nix::libc::c_int) {
    request_stop();
}

extern "C" fn on_child(_signo: nix::libc::c_int) {
    REAP.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM/SIGCHLD handlers and ignore SIGPIPE.
///
/// Handlers are installed without `SA_RESTART` so a blocking wait or
/// `accept` returns `EINTR`.
#[allow(unsafe_code)]
pub fn install() -> Result<()> {
    let stop = SigAction::new(SigHandler::Handler(on_stop), SaFlags::empty(), SigSet::empty());
    let child = SigAction::new(
        SigHandler::Handler(on_child),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the handlers only touch atomics and call close(2), both
    // async-signal-safe.
    unsafe {
        sigaction(Signal::SIGINT, &stop)?;
        sigaction(Signal::SIGTERM, &stop)?;
        sigaction(Signal::SIGCHLD, &child)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Raise the stop flag; in a worker, close its listener.
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
    let fd = WORKER_LISTENER.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        let _ = nix::unistd::close(fd);
    }
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Consume the deferred reap flag.
pub fn take_reap() -> bool {
    REAP.swap(false, Ordering::SeqCst)
}

pub fn reap_pending() -> bool {
    REAP.load(Ordering::SeqCst)
}

/// Clear both flags. Called when a server starts.
pub fn reset() {
    STOP.store(false, Ordering::SeqCst);
    REAP.store(false, Ordering::SeqCst);
    WORKER_LISTENER.store(-1, Ordering::SeqCst);
}

/// Register the listener fd a stop request must close.
pub(crate) fn set_worker_listener(fd: RawFd) {
    WORKER_LISTENER.store(fd, Ordering::SeqCst);
}

/// Forget the registered listener. Returns false when a stop request
/// already closed it.
pub(crate) fn clear_worker_listener() -> bool {
    WORKER_LISTENER.swap(-1, Ordering::SeqCst) >= 0
}

/// Serializes unit tests that touch the process-wide flags.
#[cfg(test)]
pub(crate) static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
