//! Outbound command FIFO.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::protocol::CommandPayload;

/// Where an outbound command is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The supervisor's control channel (commandsIn).
    Supervisor,
    /// The command channel of the currently negotiated workload.
    /// Resolved at send time, so commands follow a rebind.
    Workload,
    /// An explicit channel name.
    Channel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub destination: Destination,
    pub payload: CommandPayload,
}

/// Unbounded FIFO shared by submitters and the drain task.
#[derive(Default)]
pub struct CommandQueue {
    entries: Mutex<VecDeque<OutboundCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundCommand>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, command: OutboundCommand) {
        self.lock().push_back(command);
    }

    pub fn pop(&self) -> Option<OutboundCommand> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
