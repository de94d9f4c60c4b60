use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::models::{
    error::ChainError,
    message::ChainEvent,
    task::{ChainStatus, ChainSummary, ProcessKey, TaskChain, TaskChainId, TerminalStatus},
};

type SharedChain = Arc<Mutex<TaskChain>>;

/// In-memory registry of task chains and the single active-chain slot.
///
/// The id map is only write-locked on creation. Every chain sits behind its
/// own lock, so appends to different chains never wait on each other and a
/// reader takes a copy of a chain while holding that chain's lock only.
/// Events go out under a shared read lock on the subscriber list.
#[derive(Default)]
pub struct TaskChainStore {
    chains: RwLock<HashMap<TaskChainId, SharedChain>>,
    active: Mutex<Option<TaskChainId>>,
    subscribers: RwLock<Vec<(u64, Sender<ChainEvent>)>>,
    next_subscriber: AtomicU64,
}

impl TaskChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_chain(&self, name: impl Into<String>) -> TaskChainId {
        let chain = TaskChain::new(name.into());
        let id = chain.id;
        info!("Task chain '{}' ({}) created.", id, chain.name);
        self.chains.write().insert(id, Arc::new(Mutex::new(chain)));
        self.publish(ChainEvent::Created(id));
        id
    }

    pub fn set_active(&self, id: TaskChainId) -> Result<(), ChainError> {
        // Holding the slot while checking keeps the pointer valid.
        let mut active = self.active.lock();
        if !self.chains.read().contains_key(&id) {
            return Err(ChainError::NotFound(id));
        }
        if *active != Some(id) {
            *active = Some(id);
            debug!("Active task chain is now {}.", id);
            self.publish(ChainEvent::ActiveChanged(Some(id)));
        }
        Ok(())
    }

    pub fn clear_active(&self) {
        let mut active = self.active.lock();
        if active.take().is_some() {
            self.publish(ChainEvent::ActiveChanged(None));
        }
    }

    pub fn active_id(&self) -> Option<TaskChainId> {
        *self.active.lock()
    }

    /// Snapshot of the active chain, if any.
    pub fn get_active(&self) -> Option<TaskChain> {
        let id = self.active_id()?;
        self.get(id).ok()
    }

    pub fn get(&self, id: TaskChainId) -> Result<TaskChain, ChainError> {
        let chain = self.entry(id)?;
        let snapshot = chain.lock().clone();
        Ok(snapshot)
    }

    pub fn lines(&self, id: TaskChainId) -> Result<Vec<String>, ChainError> {
        let chain = self.entry(id)?;
        let lines = chain.lock().lines.clone();
        Ok(lines)
    }

    /// Summaries of every known chain ordered by id.
    pub fn summaries(&self) -> Vec<ChainSummary> {
        let chains: Vec<SharedChain> = self.chains.read().values().cloned().collect();
        let mut summaries: Vec<ChainSummary> =
            chains.iter().map(|chain| chain.lock().summary()).collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    pub fn append(&self, id: TaskChainId, text: impl Into<String>) -> Result<(), ChainError> {
        let chain = self.entry(id)?;
        let mut chain = chain.lock();
        if chain.status.is_terminal() {
            return Err(ChainError::Closed(id));
        }
        let index = chain.lines.len();
        chain.lines.push(text.into());
        // Published under the chain lock so subscribers see appends in order.
        self.publish(ChainEvent::Appended(id, index));
        Ok(())
    }

    pub fn mark_completed(&self, id: TaskChainId, status: TerminalStatus) -> Result<(), ChainError> {
        let chain = self.entry(id)?;
        let mut chain = chain.lock();
        if chain.status.is_terminal() {
            return Err(ChainError::Closed(id));
        }
        chain.status = status.into();
        info!("Task chain '{}' finished: {}.", id, chain.status);
        self.publish(ChainEvent::StatusChanged(id, chain.status));
        Ok(())
    }

    /// Moves a running chain to `Unknown`. Terminal chains are left alone.
    pub fn mark_unknown(&self, id: TaskChainId) -> Result<(), ChainError> {
        let chain = self.entry(id)?;
        let mut chain = chain.lock();
        if chain.status == ChainStatus::Running {
            chain.status = ChainStatus::Unknown;
            self.publish(ChainEvent::StatusChanged(id, ChainStatus::Unknown));
        }
        Ok(())
    }

    /// Records the process behind a chain. A finished chain is `Closed`.
    pub fn bind_process(&self, id: TaskChainId, key: ProcessKey) -> Result<(), ChainError> {
        let chain = self.entry(id)?;
        let mut chain = chain.lock();
        if chain.status.is_terminal() {
            return Err(ChainError::Closed(id));
        }
        chain.process_key = Some(key.clone());
        debug!("Task chain '{}' bound to process {}.", id, key);
        self.publish(ChainEvent::ProcessBound(id, key));
        Ok(())
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (sender, receiver) = unbounded();
        let token = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((token, sender));
        receiver
    }

    fn entry(&self, id: TaskChainId) -> Result<SharedChain, ChainError> {
        self.chains
            .read()
            .get(&id)
            .cloned()
            .ok_or(ChainError::NotFound(id))
    }

    fn publish(&self, event: ChainEvent) {
        let gone: Vec<u64> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, subscriber)| subscriber.send(event.clone()).is_err())
            .map(|(token, _)| *token)
            .collect();
        if !gone.is_empty() {
            self.subscribers
                .write()
                .retain(|(token, _)| !gone.contains(token));
        }
    }
}
