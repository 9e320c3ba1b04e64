//! Worker process supervision.
//!
//! The parent forks workers into a bounded [`ChildTable`], reaps them when
//! SIGCHLD has been seen, and propagates termination signals at shutdown.

mod table;

pub use table::{ChildTable, SlotId, SlotState, CHILD_SLOTS};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fmt;

use crate::ppc::{self, PpcChannel, PpcClient};
use crate::types::{BackendId, Error, Result};

/// Outcome of [`fork_worker`], seen from each side.
#[derive(Debug)]
pub enum Forked {
    Parent { pid: Pid, channel: PpcChannel },
    Child { client: PpcClient },
}

/// Create a PPC pair and fork. Each side keeps only its own end.
#[allow(unsafe_code)]
pub fn fork_worker() -> Result<Forked> {
    let (channel, client) = ppc::pair()?;

    // SAFETY: the child only runs engine code that serves connections and
    // leaves through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(client);
            Ok(Forked::Parent {
                pid: child,
                channel,
            })
        }
        Ok(ForkResult::Child) => {
            drop(channel);
            Ok(Forked::Child { client })
        }
        Err(e) => Err(Error::resource(format!("fork failed: {}", e))),
    }
}

/// Leave the current process at once: no destructors, no atexit handlers,
/// no flush of stdio or of buffers inherited from the parent.
#[allow(unsafe_code)]
pub fn exit_now(status: i32) -> ! {
    // SAFETY: `_exit` takes no pointers and never returns.
    unsafe { nix::libc::_exit(status) }
}

/// Why a reaped worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signaled(Signal),
    /// Collected by someone else; only its absence was observed.
    Vanished,
    Other,
}

impl From<WaitStatus> for ExitReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => ExitReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ExitReason::Signaled(signal),
            _ => ExitReason::Other,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with code {}", code),
            ExitReason::Signaled(sig) => write!(f, "killed by {}", sig),
            ExitReason::Vanished => f.write_str("vanished"),
            ExitReason::Other => f.write_str("stopped"),
        }
    }
}

/// A worker collected by [`reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub backend: Option<BackendId>,
    pub reason: ExitReason,
}

/// Collect every exited child without blocking and free their slots.
pub fn reap(table: &mut ChildTable) -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        let status = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                retire_vanished(table, &mut reaped);
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                break;
            }
        };
        let Some(pid) = status.pid() else { continue };

        let backend = match table.mark_exited(pid).and_then(|b| table.retire(pid).map(|_| b)) {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::debug!(%pid, error = %e, "reaped untracked child");
                None
            }
        };
        let reason = ExitReason::from(status);
        tracing::debug!(%pid, reason = %reason, "child reaped");
        reaped.push(Reaped {
            pid,
            backend,
            reason,
        });
    }
    reaped
}

/// With no child left to wait for, every tracked pid is gone.
fn retire_vanished(table: &mut ChildTable, reaped: &mut Vec<Reaped>) {
    for pid in table.pids() {
        match table.mark_exited(pid).and_then(|b| table.retire(pid).map(|_| b)) {
            Ok(backend) => {
                tracing::warn!(%pid, backend = %backend, "tracked child vanished");
                reaped.push(Reaped {
                    pid,
                    backend: Some(backend),
                    reason: ExitReason::Vanished,
                });
            }
            Err(e) => tracing::debug!(%pid, error = %e, "cannot retire vanished child"),
        }
    }
}

/// Send `signal` to every running worker. Returns how many were signalled.
pub fn signal_all(table: &ChildTable, signal: Signal) -> usize {
    let mut sent = 0;
    for pid in table.pids() {
        match kill(pid, signal) {
            Ok(()) => sent += 1,
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(%pid, %signal, error = %e, "kill failed"),
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_from_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            ExitReason::from(WaitStatus::Exited(pid, 3)),
            ExitReason::Exited(3)
        );
        assert_eq!(
            ExitReason::from(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            ExitReason::Signaled(Signal::SIGKILL)
        );
        assert_eq!(ExitReason::from(WaitStatus::StillAlive), ExitReason::Other);
        assert_eq!(ExitReason::Exited(0).to_string(), "exited with code 0");
    }

    #[test]
    fn vanished_children_free_their_slots() {
        let mut table = ChildTable::with_capacity(4);
        let backend = BackendId::new(1);
        for raw in [70_001, 70_002] {
            let slot = table.reserve(backend, 2).unwrap();
            table.commit(slot, Pid::from_raw(raw)).unwrap();
        }
        assert!(table.reserve(backend, 2).is_err());

        let mut reaped = Vec::new();
        retire_vanished(&mut table, &mut reaped);

        assert!(table.is_empty());
        assert_eq!(reaped.len(), 2);
        assert!(reaped
            .iter()
            .all(|r| r.reason == ExitReason::Vanished && r.backend == Some(backend)));
        assert!(table.reserve(backend, 2).is_ok());
    }

    #[test]
    #[allow(unsafe_code)]
    fn exit_now_leaves_inherited_buffers_unflushed() {
        use std::io::{BufWriter, Write};

        let _guard = crate::server::signals::TEST_SERIAL
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = BufWriter::new(file.reopen().unwrap());
        writer.write_all(b"parent bytes").unwrap();

        // SAFETY: the child only calls `_exit`.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => exit_now(7),
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 7));
                assert!(std::fs::read(file.path()).unwrap().is_empty());

                writer.flush().unwrap();
                assert_eq!(std::fs::read(file.path()).unwrap(), b"parent bytes");
            }
        }
    }

    #[test]
    fn signal_all_on_empty_table_sends_nothing() {
        let table = ChildTable::with_capacity(4);
        assert_eq!(signal_all(&table, Signal::SIGTERM), 0);
    }
}
