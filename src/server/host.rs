//! Parent-side implementation of the PPC host.

use std::collections::VecDeque;

use crate::backend::{Backend, ProcessModel};
use crate::log::{LogRecord, LogSink};
use crate::ppc::PpcHost;
use crate::supervisor::ChildTable;
use crate::types::{BackendId, Error, Result};

/// Borrowed view of the server state PPC commands may act on.
pub(super) struct Host<'a> {
    pub(super) backends: &'a mut [Backend],
    pub(super) children: &'a ChildTable,
    pub(super) pending: &'a mut VecDeque<BackendId>,
    pub(super) log: Option<&'a mut LogSink>,
}

impl PpcHost for Host<'_> {
    fn request_spawn(&mut self, id: BackendId) -> Result<()> {
        let backend = self
            .backends
            .get(id.as_usize())
            .ok_or_else(|| Error::not_found(format!("no backend {}", id)))?;
        if backend.model() != ProcessModel::Prefork {
            return Err(Error::resource(format!(
                "backend {} is not a prefork backend",
                backend.name()
            )));
        }

        let max = backend.config().max_children;
        let queued = self.pending.iter().filter(|b| **b == id).count();
        let live = self.children.count_for(id);
        if live + queued >= max {
            return Err(Error::resource(format!(
                "backend {} at max_children ({} running, {} queued)",
                backend.name(),
                live,
                queued
            )));
        }
        self.pending.push_back(id);
        Ok(())
    }

    fn append_log(&mut self, id: BackendId, record: &LogRecord) -> Result<()> {
        let own = self.backends.get_mut(id.as_usize()).and_then(Backend::log_mut);
        match own.or(self.log.as_deref_mut()) {
            Some(sink) => sink.write(record.level, &record.line),
            None => Ok(()),
        }
    }
}
