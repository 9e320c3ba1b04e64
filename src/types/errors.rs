//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Variants
//! follow the engine's failure taxonomy: configuration errors are fatal at
//! startup, resource errors abandon a single operation, protocol errors close
//! a PPC channel.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the server engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration (fatal at startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown backend prototype or missing entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Fork, accept, socket or slot exhaustion.
    #[error("resource error: {0}")]
    Resource(String),

    /// Malformed PPC frame or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// PPC opcode outside the command set or with no registered handler.
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    /// The parent answered a PPC request with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Invalid worker slot state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file syntax errors.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed system calls.
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that abort startup.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_) | Error::NotFound(_))
    }

    /// Errors that must close the PPC channel they came from.
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::UnknownCommand(_) | Error::Io(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }
}
