//! Bounded child table.
//!
//! Slot lifecycle: EMPTY → SPAWNING → RUNNING → EXITED → EMPTY, with
//! SPAWNING → EMPTY when the fork fails. A slot counts against its
//! backend's ceiling from reservation until it is retired.

use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;

use crate::types::{BackendId, Error, Result};

/// Default number of child slots.
pub const CHILD_SLOTS: usize = 1024;

/// Slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Spawning,
    Running,
    Exited,
}

/// Handle on a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    backend: Option<BackendId>,
    pid: Option<Pid>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        state: SlotState::Empty,
        backend: None,
        pid: None,
    };
}

/// Fixed-capacity table of worker processes.
#[derive(Debug)]
pub struct ChildTable {
    slots: Vec<Slot>,
    by_pid: HashMap<Pid, usize>,
    counts: HashMap<BackendId, usize>,
}

impl Default for ChildTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildTable {
    pub fn new() -> Self {
        Self::with_capacity(CHILD_SLOTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::EMPTY; capacity],
            by_pid: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve a slot for `backend`, which may hold at most `max_children`.
    pub fn reserve(&mut self, backend: BackendId, max_children: usize) -> Result<SlotId> {
        let count = self.count_for(backend);
        if count >= max_children {
            return Err(Error::resource(format!(
                "{} at max_children ({})",
                backend, max_children
            )));
        }
        let index = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Empty)
            .ok_or_else(|| Error::resource(format!("child table full ({} slots)", self.capacity())))?;

        self.slots[index] = Slot {
            state: SlotState::Spawning,
            backend: Some(backend),
            pid: None,
        };
        *self.counts.entry(backend).or_insert(0) += 1;
        Ok(SlotId(index))
    }

    /// Record the pid of a successful fork.
    pub fn commit(&mut self, slot: SlotId, pid: Pid) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        if entry.state != SlotState::Spawning {
            return Err(Error::state_transition(format!(
                "cannot commit {}: state is {:?}, expected Spawning",
                slot, entry.state
            )));
        }
        entry.state = SlotState::Running;
        entry.pid = Some(pid);
        self.by_pid.insert(pid, slot.0);
        Ok(())
    }

    /// Release a reservation whose fork failed.
    pub fn abandon(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        if entry.state != SlotState::Spawning {
            return Err(Error::state_transition(format!(
                "cannot abandon {}: state is {:?}, expected Spawning",
                slot, entry.state
            )));
        }
        let backend = entry.backend;
        *entry = Slot::EMPTY;
        self.release(backend);
        Ok(())
    }

    /// Note that `pid` has terminated. Returns its backend.
    pub fn mark_exited(&mut self, pid: Pid) -> Result<BackendId> {
        let index = *self
            .by_pid
            .get(&pid)
            .ok_or_else(|| Error::not_found(format!("untracked pid {}", pid)))?;
        let entry = &mut self.slots[index];
        if entry.state != SlotState::Running {
            return Err(Error::state_transition(format!(
                "cannot mark pid {} exited: state is {:?}, expected Running",
                pid, entry.state
            )));
        }
        entry.state = SlotState::Exited;
        entry
            .backend
            .ok_or_else(|| Error::state_transition(format!("pid {} has no backend", pid)))
    }

    /// Free the slot of an exited pid.
    pub fn retire(&mut self, pid: Pid) -> Result<()> {
        let index = *self
            .by_pid
            .get(&pid)
            .ok_or_else(|| Error::not_found(format!("untracked pid {}", pid)))?;
        let entry = &mut self.slots[index];
        if entry.state != SlotState::Exited {
            return Err(Error::state_transition(format!(
                "cannot retire pid {}: state is {:?}, expected Exited",
                pid, entry.state
            )));
        }
        let backend = entry.backend;
        *entry = Slot::EMPTY;
        self.by_pid.remove(&pid);
        self.release(backend);
        Ok(())
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.slots.get(slot.0).map(|s| s.state)
    }

    /// Slots held by `backend`, including reservations.
    pub fn count_for(&self, backend: BackendId) -> usize {
        self.counts.get(&backend).copied().unwrap_or(0)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend_of(&self, pid: Pid) -> Option<BackendId> {
        self.by_pid.get(&pid).and_then(|&i| self.slots[i].backend)
    }

    /// Pids of running workers.
    pub fn pids(&self) -> Vec<Pid> {
        self.running().map(|(pid, _)| pid).collect()
    }

    pub fn pids_for(&self, backend: BackendId) -> Vec<Pid> {
        self.running()
            .filter(|(_, b)| *b == backend)
            .map(|(pid, _)| pid)
            .collect()
    }

    fn running(&self) -> impl Iterator<Item = (Pid, BackendId)> + '_ {
        self.slots.iter().filter_map(|s| match (s.state, s.pid, s.backend) {
            (SlotState::Running, Some(pid), Some(backend)) => Some((pid, backend)),
            _ => None,
        })
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Slot> {
        self.slots
            .get_mut(slot.0)
            .ok_or_else(|| Error::not_found(format!("no {}", slot)))
    }

    fn release(&mut self, backend: Option<BackendId>) {
        if let Some(backend) = backend {
            if let Some(count) = self.counts.get_mut(&backend) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(&backend);
                }
            }
        }
    }
}
