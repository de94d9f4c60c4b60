use std::sync::Arc;

use crossbeam_channel::unbounded;
use log::{error, info};

use crate::config::ConsoleConfig;
use crate::manager::{chain_store::TaskChainStore, control::TaskControl};
use crate::models::{
    error::{ChainError, LaunchError},
    message::{OutputStream, StreamInput},
    task::{ChainSummary, TaskChainId, TerminalStatus},
};
use crate::worker::{
    appender::{spawn_appender_thread, LogAppender},
    registry::LocalCommandRegistry,
};

/// Launches commands as task chains and hands out the control surface.
pub struct TaskManager {
    store: Arc<TaskChainStore>,
    registry: Arc<LocalCommandRegistry>,
    control: TaskControl,
    stream_prefixes: bool,
}

impl TaskManager {
    pub fn new(config: &ConsoleConfig) -> Self {
        let store = Arc::new(TaskChainStore::new());
        let registry = Arc::new(LocalCommandRegistry::new(config.shell.clone()));
        let control = TaskControl::new(
            Arc::clone(&store),
            registry.clone(),
            config.registry_timeout(),
        );
        TaskManager {
            store,
            registry,
            control,
            stream_prefixes: config.stream_prefixes,
        }
    }

    /// Starts `command` under a new chain and makes that chain active.
    pub fn launch(&self, name: &str, command: &str) -> Result<TaskChainId, LaunchError> {
        let id = self.store.create_chain(name);
        self.store.set_active(id)?;

        let (sender, receiver) = unbounded();
        let appender =
            LogAppender::new(Arc::clone(&self.store), id).with_stream_prefixes(self.stream_prefixes);
        if let Err(e) = spawn_appender_thread(appender, receiver) {
            self.fail_launch(id, &e.to_string());
            return Err(LaunchError::Appender(e));
        }

        // Kept so a spawn failure goes through the chain's own writer.
        let notices = sender.clone();
        match self.registry.spawn(command, sender) {
            Ok(key) => {
                match self.store.bind_process(id, key) {
                    // Already exited and closed; there is nothing left to kill.
                    Ok(()) | Err(ChainError::Closed(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                info!("Task chain '{}' launched: {}", id, command);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to launch task chain '{}': {}", id, e);
                let _ = notices.send(StreamInput::Fragment(
                    OutputStream::Stderr,
                    format!("failed to start: {e}\n"),
                ));
                let _ = notices.send(StreamInput::Exit { killed: false, code: None });
                Err(e.into())
            }
        }
    }

    pub fn store(&self) -> &Arc<TaskChainStore> {
        &self.store
    }

    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    pub fn list_chains(&self) -> Vec<ChainSummary> {
        self.store.summaries()
    }

    fn fail_launch(&self, id: TaskChainId, reason: &str) {
        error!("Failed to launch task chain '{}': {}", id, reason);
        let _ = self.store.append(id, format!("failed to start: {reason}"));
        let _ = self.store.mark_completed(id, TerminalStatus::Completed);
    }
}
