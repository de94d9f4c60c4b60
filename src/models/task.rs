use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Identifier of a task chain. Derived from the creation time but opaque
/// to everything outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskChainId(u64);

static LAST_ID: AtomicU64 = AtomicU64::new(0);

impl TaskChainId {
    /// Allocates an id for a chain created at `created_at`.
    ///
    /// Ids are strictly increasing for the lifetime of the process, so two
    /// chains created within the same millisecond still get distinct ids and
    /// a removed id is never handed out again.
    pub(crate) fn allocate(created_at: DateTime<Utc>) -> Self {
        let millis = u64::try_from(created_at.timestamp_millis()).unwrap_or(0);
        let mut last = LAST_ID.load(Ordering::Relaxed);
        loop {
            let next = millis.max(last + 1);
            match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return TaskChainId(next),
                Err(current) => last = current,
            }
        }
    }
}

impl fmt::Display for TaskChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.to_string())
    }
}

impl std::str::FromStr for TaskChainId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(TaskChainId)
    }
}

/// Key under which the command registry tracks a running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessKey(String);

impl ProcessKey {
    pub fn new(key: impl Into<String>) -> Self {
        ProcessKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Running,
    Completed,
    Killed,
    /// No live process could be correlated with the chain.
    Unknown,
}

impl ChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainStatus::Completed | ChainStatus::Killed)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChainStatus::Running => "running",
            ChainStatus::Completed => "completed",
            ChainStatus::Killed => "killed",
            ChainStatus::Unknown => "unknown",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Killed,
}

impl From<TerminalStatus> for ChainStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => ChainStatus::Completed,
            TerminalStatus::Killed => ChainStatus::Killed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskChain {
    pub id: TaskChainId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: ChainStatus,
    pub process_key: Option<ProcessKey>,
    pub lines: Vec<String>,
}

impl TaskChain {
    pub fn new(name: String) -> Self {
        let created_at = Utc::now();
        Self {
            id: TaskChainId::allocate(created_at),
            name,
            created_at,
            status: ChainStatus::Running,
            process_key: None,
            lines: vec![],
        }
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            status: self.status,
            process_key: self.process_key.clone(),
            line_count: self.lines.len(),
        }
    }
}

/// Header information of a chain without its log lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub id: TaskChainId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: ChainStatus,
    pub process_key: Option<ProcessKey>,
    pub line_count: usize,
}
