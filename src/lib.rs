//! Task-chain execution and log aggregation for long-running local commands.
//!
//! Commands are launched as task chains; their output is split into lines
//! per chain, one chain at a time is active for display, and the active
//! chain's process can be asked to terminate.

pub mod config;
pub mod manager;
pub mod models;
pub mod worker;

pub use config::ConsoleConfig;
pub use manager::{chain_store::TaskChainStore, control::TaskControl, task_manager::TaskManager};
pub use models::{
    error::{ChainError, ControlError, LaunchError, RegistryError},
    message::{ChainEvent, OutputStream, StreamInput},
    task::{ChainStatus, ChainSummary, ProcessKey, TaskChain, TaskChainId, TerminalStatus},
};
pub use worker::registry::{CommandRegistry, LocalCommandRegistry, ProcessInfo};
