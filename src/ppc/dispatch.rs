//! Opcode dispatch table.
//!
//! Handlers receive the host (the parent's view of server state), the
//! origin of the request and the raw payload, and return the payload of the
//! `ResponseOk` frame. An `Err` becomes a `ResponseError` frame unless it
//! is a channel-closing error.

use bytes::Bytes;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;

use super::command::Opcode;
use super::handlers;
use crate::log::LogRecord;
use crate::types::{BackendId, Error, Result};

/// Parent-side actions a PPC command may request.
#[cfg_attr(test, mockall::automock)]
pub trait PpcHost {
    /// Queue a worker spawn for `backend`. Refused when the backend would
    /// exceed its ceiling.
    fn request_spawn(&mut self, backend: BackendId) -> Result<()>;

    /// Append a pre-rendered line to `backend`'s log, or the server log.
    fn append_log(&mut self, backend: BackendId, record: &LogRecord) -> Result<()>;
}

/// Which worker sent a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub pid: Pid,
    pub backend: BackendId,
}

pub type Handler = Box<dyn Fn(&mut dyn PpcHost, Origin, &[u8]) -> Result<Bytes>>;

/// Opcode → handler table.
pub struct Dispatcher {
    handlers: HashMap<Opcode, Handler>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.handlers.keys().copied().collect();
        ops.sort();
        f.debug_struct("Dispatcher").field("opcodes", &ops).finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Dispatcher {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A table with `Nop`, `ForkChild` and `LogAppend` registered.
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        let builtins: [(Opcode, Handler); 3] = [
            (Opcode::Nop, Box::new(handlers::nop)),
            (Opcode::ForkChild, Box::new(handlers::fork_child)),
            (Opcode::LogAppend, Box::new(handlers::log_append)),
        ];
        for (opcode, handler) in builtins {
            // Fresh table, registration cannot collide.
            dispatcher.handlers.insert(opcode, handler);
        }
        dispatcher
    }

    /// Install `handler` for `opcode`. Each opcode is registered once.
    pub fn register(&mut self, opcode: Opcode, handler: Handler) -> Result<()> {
        if opcode.is_response() {
            return Err(Error::config(format!(
                "response opcode {} cannot be registered",
                opcode
            )));
        }
        if self.handlers.contains_key(&opcode) {
            return Err(Error::config(format!(
                "handler for {} already registered",
                opcode
            )));
        }
        self.handlers.insert(opcode, handler);
        Ok(())
    }

    pub fn is_registered(&self, opcode: Opcode) -> bool {
        self.handlers.contains_key(&opcode)
    }

    /// Run the handler for a raw opcode byte.
    pub fn dispatch(
        &self,
        host: &mut dyn PpcHost,
        origin: Origin,
        opcode: u8,
        payload: &[u8],
    ) -> Result<Bytes> {
        let op = Opcode::try_from(opcode)?;
        let handler = self
            .handlers
            .get(&op)
            .ok_or(Error::UnknownCommand(opcode))?;
        tracing::trace!(pid = %origin.pid, backend = %origin.backend, command = %op, "ppc dispatch");
        handler(host, origin, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Level;

    fn origin() -> Origin {
        Origin {
            pid: Pid::from_raw(4242),
            backend: BackendId::new(1),
        }
    }

    #[test]
    fn nop_returns_empty_payload_without_touching_host() {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = MockPpcHost::new();
        host.expect_request_spawn().never();
        host.expect_append_log().never();

        let reply = dispatcher
            .dispatch(&mut host, origin(), Opcode::Nop.as_u8(), b"")
            .unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn fork_child_targets_the_callers_backend() {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = MockPpcHost::new();
        host.expect_request_spawn()
            .withf(|backend| *backend == BackendId::new(1))
            .times(1)
            .returning(|_| Ok(()));

        dispatcher
            .dispatch(&mut host, origin(), Opcode::ForkChild.as_u8(), b"")
            .unwrap();
    }

    #[test]
    fn refused_fork_child_is_a_resource_error() {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = MockPpcHost::new();
        host.expect_request_spawn()
            .returning(|_| Err(Error::resource("at ceiling")));

        let err = dispatcher
            .dispatch(&mut host, origin(), Opcode::ForkChild.as_u8(), b"")
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert!(!err.closes_channel());
    }

    #[test]
    fn log_append_decodes_the_record() {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = MockPpcHost::new();
        host.expect_append_log()
            .withf(|backend, record| {
                *backend == BackendId::new(1)
                    && record.level == Level::Notice
                    && record.line == "GET / 200"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let payload = serde_json::to_vec(&LogRecord::new(Level::Notice, "GET / 200")).unwrap();
        dispatcher
            .dispatch(&mut host, origin(), Opcode::LogAppend.as_u8(), &payload)
            .unwrap();
    }

    #[test]
    fn undecodable_log_record_is_a_protocol_error() {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = MockPpcHost::new();
        host.expect_append_log().never();

        let err = dispatcher
            .dispatch(&mut host, origin(), Opcode::LogAppend.as_u8(), b"not json")
            .unwrap_err();
        assert!(err.closes_channel());
    }

    #[test]
    fn unknown_and_unregistered_opcodes_are_rejected() {
        let dispatcher = Dispatcher::new();
        let mut host = MockPpcHost::new();

        let err = dispatcher.dispatch(&mut host, origin(), 0x42, b"").unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(0x42)));

        let err = dispatcher
            .dispatch(&mut host, origin(), Opcode::Nop.as_u8(), b"")
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(1)));
    }

    #[test]
    fn registration_is_once_per_opcode() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(Opcode::Nop, Box::new(|_, _, _| Ok(Bytes::from_static(b"pong"))))
            .unwrap();
        assert!(dispatcher.is_registered(Opcode::Nop));

        let err = dispatcher
            .register(Opcode::Nop, Box::new(|_, _, _| Ok(Bytes::new())))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));

        let mut host = MockPpcHost::new();
        let reply = dispatcher
            .dispatch(&mut host, origin(), Opcode::Nop.as_u8(), b"")
            .unwrap();
        assert_eq!(&reply[..], b"pong");
    }

    #[test]
    fn response_opcodes_cannot_be_registered() {
        let mut dispatcher = Dispatcher::new();
        for op in [Opcode::ResponseOk, Opcode::ResponseError] {
            assert!(dispatcher
                .register(op, Box::new(|_, _, _| Ok(Bytes::new())))
                .is_err());
        }
    }
}
