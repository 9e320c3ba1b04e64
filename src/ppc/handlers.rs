//! Built-in PPC command handlers.

use bytes::Bytes;

use super::dispatch::{Origin, PpcHost};
use crate::log::LogRecord;
use crate::types::{Error, Result};

pub(crate) fn nop(_host: &mut dyn PpcHost, _origin: Origin, _payload: &[u8]) -> Result<Bytes> {
    Ok(Bytes::new())
}

/// Queue a sibling for the requesting worker's backend.
pub(crate) fn fork_child(host: &mut dyn PpcHost, origin: Origin, _payload: &[u8]) -> Result<Bytes> {
    host.request_spawn(origin.backend)?;
    tracing::debug!(pid = %origin.pid, backend = %origin.backend, "spawn requested");
    Ok(Bytes::new())
}

pub(crate) fn log_append(host: &mut dyn PpcHost, origin: Origin, payload: &[u8]) -> Result<Bytes> {
    let record: LogRecord = serde_json::from_slice(payload)
        .map_err(|e| Error::protocol(format!("bad log record: {}", e)))?;
    host.append_log(origin.backend, &record)?;
    Ok(Bytes::new())
}
