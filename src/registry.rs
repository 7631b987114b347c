use crate::chain::Chain;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

/// Delta buffer and intake counter guarded by the worker lock.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub delta: Chain,
    pub intake: u64,
}

/// One channel's in-memory buffer plus the lock that also serializes all I/O
/// against that channel's chain file.
#[derive(Debug)]
pub struct Worker {
    name: String,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Worker {
            name: name.into(),
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocking acquire. A poisoned lock is recovered; the buffer is still a valid chain.
    pub fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking acquire; `None` when another operation holds the chain.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, WorkerState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub chain: String,
    pub intake: u64,
}

/// Concurrent map from channel name to worker. The map lock is only held for
/// lookup and insertion, never across chain I/O.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<FxHashMap<String, Arc<Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Worker> {
        if let Some(worker) = self.get(name) {
            return worker;
        }
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        workers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Worker::new(name)))
            .clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sorted channel names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every worker, sorted by name, taken without holding the map lock afterwards.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.name().cmp(b.name()));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers()
            .iter()
            .map(|w| WorkerStats {
                chain: w.name().to_string(),
                intake: w.lock().intake,
            })
            .collect()
    }
}
