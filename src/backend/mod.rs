//! Backends: named protocol adapters bound to one listener.
//!
//! A backend pairs a [`Protocol`] implementation with its process model,
//! population limits and optional log device. The server owns every backend
//! and calls `serve` once per accepted connection.

mod echo;
mod http;
mod listener;
mod registry;

pub use echo::Echo;
pub use http::Http;
pub use listener::{bind, prepare_connection, resolve};
pub use registry::{ProtocolFactory, Registry};

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;

use crate::log::{Level, LogSink, LogWriter};
use crate::types::{BackendConfig, BackendId, Error, Result};

// =============================================================================
// Protocol contract
// =============================================================================

/// Callbacks a protocol adapter provides.
pub trait Protocol: fmt::Debug {
    /// Prepare per-backend state. Called once, in the parent, before listening.
    fn init(&mut self, name: &str, config: &BackendConfig) -> Result<()>;

    /// Serve one connection. The engine closes the connection afterwards.
    fn serve(&mut self, conn: &mut Connection<'_>) -> Result<()>;

    /// Release per-backend state.
    fn term(&mut self) {}
}

/// An accepted connection handed to [`Protocol::serve`].
pub struct Connection<'a> {
    stream: TcpStream,
    peer: SocketAddr,
    log: &'a mut dyn LogWriter,
}

impl fmt::Debug for Connection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<'a> Connection<'a> {
    pub fn new(stream: TcpStream, peer: SocketAddr, log: &'a mut dyn LogWriter) -> Self {
        Self { stream, peer, log }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Write a line to the backend's log device.
    pub fn log(&mut self, level: Level, line: &str) -> Result<()> {
        self.log.write_line(level, line)
    }
}

impl Read for Connection<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

// =============================================================================
// Process model
// =============================================================================

/// How connections of a backend are mapped onto processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessModel {
    /// Served in the parent, one at a time.
    Iterative,
    /// One fresh worker per connection.
    #[default]
    Fork,
    /// A pool of long-lived workers accepting on the shared listener.
    Prefork,
}

impl ProcessModel {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessModel::Iterative => "iterative",
            ProcessModel::Fork => "fork",
            ProcessModel::Prefork => "prefork",
        }
    }
}

impl fmt::Display for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iterative" => Ok(ProcessModel::Iterative),
            "fork" => Ok(ProcessModel::Fork),
            "prefork" => Ok(ProcessModel::Prefork),
            other => Err(Error::config(format!("unknown process model [{}]", other))),
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// A configured backend.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    name: String,
    model: ProcessModel,
    config: BackendConfig,
    listener: Option<TcpListener>,
    log: Option<LogSink>,
    protocol: Box<dyn Protocol>,
}

impl Backend {
    pub(crate) fn new(
        id: BackendId,
        name: &str,
        model: ProcessModel,
        config: BackendConfig,
        log: Option<LogSink>,
        protocol: Box<dyn Protocol>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            model,
            config,
            listener: None,
            log,
            protocol,
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> ProcessModel {
        self.model
    }

    pub(crate) fn set_model(&mut self, model: ProcessModel) {
        self.model = model;
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn log(&self) -> Option<&LogSink> {
        self.log.as_ref()
    }

    pub(crate) fn log_mut(&mut self) -> Option<&mut LogSink> {
        self.log.as_mut()
    }

    pub(crate) fn take_log(&mut self) -> Option<LogSink> {
        self.log.take()
    }

    /// Bind the listener. Idempotent.
    pub fn listen(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = bind(&self.config.addr, self.config.backlog)?;
        let addr = listener.local_addr()?;
        tracing::info!(backend = %self.name, %addr, model = %self.model, "listening");
        self.listener = Some(listener);
        Ok(addr)
    }

    pub(crate) fn take_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }

    /// Close the listening socket, if any.
    pub fn close_listener(&mut self) {
        self.listener = None;
    }

    /// Serve one connection, writing log lines to `log`.
    ///
    /// Errors are logged and the connection closed; they never propagate.
    pub fn serve_with(&mut self, stream: TcpStream, peer: SocketAddr, log: &mut dyn LogWriter) {
        let mut conn = Connection::new(stream, peer, log);
        if let Err(e) = self.protocol.serve(&mut conn) {
            tracing::warn!(backend = %self.name, %peer, error = %e, "serve failed");
        }
    }

    /// Serve one connection in the parent, logging to the backend's own
    /// device or else to `fallback`.
    pub fn serve(&mut self, stream: TcpStream, peer: SocketAddr, fallback: Option<&mut LogSink>) {
        let Backend {
            name,
            log,
            protocol,
            ..
        } = self;
        let mut writer = log.as_mut().or(fallback);
        let mut conn = Connection::new(stream, peer, &mut writer);
        if let Err(e) = protocol.serve(&mut conn) {
            tracing::warn!(backend = %name, %peer, error = %e, "serve failed");
        }
    }

    /// Run the protocol's `term` callback and close the listener.
    pub fn free(&mut self) {
        self.protocol.term();
        self.close_listener();
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.flush() {
                tracing::warn!(backend = %self.name, error = %e, "log flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_model_parsing_is_case_insensitive() {
        assert_eq!("PreFork".parse::<ProcessModel>().unwrap(), ProcessModel::Prefork);
        assert_eq!("fork".parse::<ProcessModel>().unwrap(), ProcessModel::Fork);
        assert_eq!(
            "ITERATIVE".parse::<ProcessModel>().unwrap(),
            ProcessModel::Iterative
        );
    }

    #[test]
    fn unknown_process_model_is_a_config_error() {
        let err = "threaded".parse::<ProcessModel>().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("threaded"));
    }

    #[test]
    fn default_model_is_fork() {
        assert_eq!(ProcessModel::default(), ProcessModel::Fork);
    }
}
