use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{info, warn};

use crate::manager::chain_store::TaskChainStore;
use crate::models::{
    error::ControlError,
    message::ChainEvent,
    task::{ChainSummary, ProcessKey},
};
use crate::worker::registry::{CommandRegistry, ProcessInfo};

/// Operations the presentation layer performs against the task chains.
#[derive(Clone)]
pub struct TaskControl {
    store: Arc<TaskChainStore>,
    registry: Arc<dyn CommandRegistry>,
    registry_timeout: Duration,
    view_open: Arc<AtomicBool>,
}

impl TaskControl {
    pub fn new(
        store: Arc<TaskChainStore>,
        registry: Arc<dyn CommandRegistry>,
        registry_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            registry_timeout,
            view_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_visible_lines(&self) -> Vec<String> {
        self.store
            .get_active()
            .map(|chain| chain.lines)
            .unwrap_or_default()
    }

    pub fn copy_as_text(&self) -> String {
        self.get_visible_lines().join("\n")
    }

    pub fn active_summary(&self) -> Option<ChainSummary> {
        self.store.get_active().map(|chain| chain.summary())
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        self.store.subscribe()
    }

    /// Asks the registry to kill the process behind the active chain.
    ///
    /// The chain keeps its status here; it turns `Killed` once the
    /// process-exit notification reaches its appender.
    pub fn request_termination(&self) -> Result<ProcessKey, ControlError> {
        let chain = self.store.get_active().ok_or(ControlError::NoActiveChain)?;
        let running = self.list_running()?;

        let key = match chain.process_key {
            Some(key) if running.contains_key(&key) => key,
            _ => {
                warn!("No running process backs task chain '{}'.", chain.id);
                // The chain may have been dropped meanwhile; nothing to mark then.
                let _ = self.store.mark_unknown(chain.id);
                return Err(ControlError::ProcessNotFound(chain.id));
            }
        };

        self.registry.kill(&key).map_err(|e| {
            warn!("Kill request for task chain '{}' failed: {}", chain.id, e);
            ControlError::KillRejected {
                key: key.clone(),
                reason: e.to_string(),
            }
        })?;
        info!("Termination requested for task chain '{}' (process {}).", chain.id, key);
        Ok(key)
    }

    pub fn open_view(&self) {
        self.view_open.store(true, Ordering::Release);
    }

    pub fn close_view(&self) {
        self.view_open.store(false, Ordering::Release);
    }

    pub fn is_view_open(&self) -> bool {
        self.view_open.load(Ordering::Acquire)
    }

    /// Enumerates the registry on a helper thread so a hung registry cannot
    /// block the caller past `registry_timeout`.
    fn list_running(&self) -> Result<HashMap<ProcessKey, ProcessInfo>, ControlError> {
        let (sender, receiver) = bounded(1);
        let registry = Arc::clone(&self.registry);
        thread::Builder::new()
            .name("registry-list".to_string())
            .spawn(move || {
                let _ = sender.send(registry.list_running());
            })
            .map_err(|e| ControlError::RegistryUnavailable(e.to_string()))?;

        match receiver.recv_timeout(self.registry_timeout) {
            Ok(Ok(running)) => Ok(running),
            Ok(Err(e)) => Err(ControlError::RegistryUnavailable(e.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(ControlError::RegistryUnavailable(format!(
                "no answer within {:?}",
                self.registry_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(ControlError::RegistryUnavailable(
                "listing ended without an answer".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use parking_lot::Mutex;

    use super::*;
    use crate::models::{
        error::RegistryError,
        task::{ChainStatus, TerminalStatus},
    };

    #[derive(Default)]
    struct FakeRegistry {
        running: Mutex<HashMap<ProcessKey, ProcessInfo>>,
        kills: Mutex<Vec<ProcessKey>>,
        reject_kills: bool,
        list_delay: Option<Duration>,
    }

    impl FakeRegistry {
        fn with_process(key: &str) -> Self {
            let registry = FakeRegistry::default();
            registry.running.lock().insert(
                ProcessKey::new(key),
                ProcessInfo {
                    pid: 42,
                    command: "python train.py".to_string(),
                    started_at: SystemTime::now(),
                },
            );
            registry
        }
    }

    impl CommandRegistry for FakeRegistry {
        fn list_running(&self) -> Result<HashMap<ProcessKey, ProcessInfo>, RegistryError> {
            if let Some(delay) = self.list_delay {
                thread::sleep(delay);
            }
            Ok(self.running.lock().clone())
        }

        fn kill(&self, key: &ProcessKey) -> Result<(), RegistryError> {
            self.kills.lock().push(key.clone());
            if self.reject_kills {
                return Err(RegistryError::Unavailable("refused".to_string()));
            }
            Ok(())
        }
    }

    fn control_with(registry: Arc<FakeRegistry>) -> (Arc<TaskChainStore>, TaskControl) {
        let store = Arc::new(TaskChainStore::new());
        let control = TaskControl::new(Arc::clone(&store), registry, Duration::from_millis(200));
        (store, control)
    }

    #[test]
    fn no_active_chain_never_kills() {
        let registry = Arc::new(FakeRegistry::with_process("7"));
        let (_, control) = control_with(Arc::clone(&registry));

        assert_eq!(control.request_termination(), Err(ControlError::NoActiveChain));
        assert!(registry.kills.lock().is_empty());
        assert!(control.get_visible_lines().is_empty());
        assert_eq!(control.copy_as_text(), "");
    }

    #[test]
    fn copy_joins_lines_with_newlines() {
        let (store, control) = control_with(Arc::new(FakeRegistry::default()));
        let id = store.create_chain("logs");
        store.set_active(id).unwrap();
        for line in ["a", "b", "c"] {
            store.append(id, line).unwrap();
        }
        assert_eq!(control.copy_as_text(), "a\nb\nc");
    }

    #[test]
    fn train_scenario_stops_at_completion() {
        let (store, control) = control_with(Arc::new(FakeRegistry::default()));
        let id = store.create_chain("train-1");
        store.set_active(id).unwrap();
        store.append(id, "epoch 1").unwrap();
        store.append(id, "epoch 2").unwrap();
        assert_eq!(control.get_visible_lines(), vec!["epoch 1", "epoch 2"]);

        store.mark_completed(id, TerminalStatus::Completed).unwrap();
        assert!(store.append(id, "epoch 3").is_err());
        assert_eq!(control.get_visible_lines(), vec!["epoch 1", "epoch 2"]);
    }

    #[test]
    fn termination_kills_the_bound_process_only() {
        let registry = Arc::new(FakeRegistry::with_process("7"));
        registry.running.lock().insert(
            ProcessKey::new("3"),
            ProcessInfo {
                pid: 3,
                command: "pip install torch".to_string(),
                started_at: SystemTime::now(),
            },
        );
        let (store, control) = control_with(Arc::clone(&registry));
        let id = store.create_chain("train-1");
        store.bind_process(id, ProcessKey::new("7")).unwrap();
        store.set_active(id).unwrap();

        assert_eq!(control.request_termination(), Ok(ProcessKey::new("7")));
        assert_eq!(*registry.kills.lock(), vec![ProcessKey::new("7")]);
        // Killed only once the exit notification arrives.
        assert_eq!(store.get(id).unwrap().status, ChainStatus::Running);
    }

    #[test]
    fn unbound_chain_is_process_not_found() {
        let registry = Arc::new(FakeRegistry::with_process("7"));
        let (store, control) = control_with(Arc::clone(&registry));
        let id = store.create_chain("orphan");
        store.set_active(id).unwrap();

        assert_eq!(control.request_termination(), Err(ControlError::ProcessNotFound(id)));
        assert!(registry.kills.lock().is_empty());
        assert_eq!(store.get(id).unwrap().status, ChainStatus::Unknown);
    }

    #[test]
    fn exited_process_is_process_not_found() {
        let registry = Arc::new(FakeRegistry::default());
        let (store, control) = control_with(Arc::clone(&registry));
        let id = store.create_chain("done");
        store.bind_process(id, ProcessKey::new("9")).unwrap();
        store.set_active(id).unwrap();

        assert_eq!(control.request_termination(), Err(ControlError::ProcessNotFound(id)));
        assert!(registry.kills.lock().is_empty());
    }

    #[test]
    fn rejected_kill_leaves_chain_running() {
        let registry = Arc::new(FakeRegistry {
            reject_kills: true,
            ..FakeRegistry::with_process("7")
        });
        let (store, control) = control_with(Arc::clone(&registry));
        let id = store.create_chain("train-1");
        store.bind_process(id, ProcessKey::new("7")).unwrap();
        store.set_active(id).unwrap();

        assert!(matches!(
            control.request_termination(),
            Err(ControlError::KillRejected { key, .. }) if key == ProcessKey::new("7")
        ));
        assert_eq!(store.get(id).unwrap().status, ChainStatus::Running);
    }

    #[test]
    fn slow_registry_is_reported_unavailable() {
        let registry = Arc::new(FakeRegistry {
            list_delay: Some(Duration::from_secs(2)),
            ..FakeRegistry::with_process("7")
        });
        let (store, control) = control_with(Arc::clone(&registry));
        let id = store.create_chain("train-1");
        store.bind_process(id, ProcessKey::new("7")).unwrap();
        store.set_active(id).unwrap();

        assert!(matches!(
            control.request_termination(),
            Err(ControlError::RegistryUnavailable(_))
        ));
        assert!(registry.kills.lock().is_empty());
        assert_eq!(store.get(id).unwrap().status, ChainStatus::Running);
    }

    #[test]
    fn readers_only_see_whole_lines_while_appending() {
        let (store, control) = control_with(Arc::new(FakeRegistry::default()));
        let id = store.create_chain("train-1");
        store.set_active(id).unwrap();
        let expected: Vec<String> = (0..2_000).map(|n| format!("step {n}")).collect();

        let writer = {
            let store = Arc::clone(&store);
            let lines = expected.clone();
            thread::spawn(move || {
                for line in lines {
                    store.append(id, line).unwrap();
                }
            })
        };

        let mut last_len = 0;
        loop {
            let snapshot = control.get_visible_lines();
            assert!(snapshot.len() >= last_len);
            assert_eq!(snapshot[..], expected[..snapshot.len()]);
            last_len = snapshot.len();
            if last_len == expected.len() {
                break;
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn close_view_is_idempotent_and_keeps_store() {
        let (store, control) = control_with(Arc::new(FakeRegistry::default()));
        let id = store.create_chain("a");
        store.set_active(id).unwrap();
        store.append(id, "kept").unwrap();

        control.open_view();
        assert!(control.is_view_open());
        control.close_view();
        control.close_view();
        assert!(!control.is_view_open());
        assert_eq!(control.get_visible_lines(), vec!["kept"]);
    }

    #[test]
    fn summary_describes_active_chain() {
        let (store, control) = control_with(Arc::new(FakeRegistry::default()));
        assert!(control.active_summary().is_none());
        let id = store.create_chain("download");
        store.set_active(id).unwrap();
        store.append(id, "x").unwrap();

        let summary = control.active_summary().unwrap();
        assert_eq!(summary.id, id);
        assert_eq!(summary.name, "download");
        assert_eq!(summary.line_count, 1);
    }
}
