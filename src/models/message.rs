use super::task::{ChainStatus, ProcessKey, TaskChainId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn prefix(self) -> &'static str {
        match self {
            OutputStream::Stdout => "[stdout] ",
            OutputStream::Stderr => "[stderr] ",
        }
    }
}

/// Input consumed by the appender of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInput {
    Fragment(OutputStream, String),
    /// The backing process has ended; no more fragments follow.
    Exit { killed: bool, code: Option<i32> },
}

/// Change notifications published by the task chain store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Created(TaskChainId),
    /// A line was appended at this index of the chain's log.
    Appended(TaskChainId, usize),
    StatusChanged(TaskChainId, ChainStatus),
    ActiveChanged(Option<TaskChainId>),
    ProcessBound(TaskChainId, ProcessKey),
}

impl ChainEvent {
    pub fn chain_id(&self) -> Option<TaskChainId> {
        match self {
            ChainEvent::Created(id)
            | ChainEvent::Appended(id, _)
            | ChainEvent::StatusChanged(id, _)
            | ChainEvent::ProcessBound(id, _) => Some(*id),
            ChainEvent::ActiveChanged(id) => *id,
        }
    }
}
