use std::io;

use thiserror::Error;

use super::task::{ProcessKey, TaskChainId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("task chain {0} not found")]
    NotFound(TaskChainId),
    #[error("task chain {0} has already finished")]
    Closed(TaskChainId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("no active task")]
    NoActiveChain,
    #[error("no running process found for task {0}")]
    ProcessNotFound(TaskChainId),
    #[error("kill request for process {key} was rejected: {reason}")]
    KillRejected { key: ProcessKey, reason: String },
    #[error("command registry unavailable: {0}")]
    RegistryUnavailable(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("process {0} is not running")]
    UnknownProcess(ProcessKey),
    #[error("failed to signal process {key}: {source}")]
    Signal { key: ProcessKey, source: io::Error },
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] io::Error),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("failed to start appender thread: {0}")]
    Appender(#[source] io::Error),
}
