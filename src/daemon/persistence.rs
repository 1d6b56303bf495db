use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::daemon::process::ProcessState;
use crate::error::PersistenceError;

/// Saved state of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pid: u64,
    pub process_type: String,
    pub state: ProcessState,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    /// Where an interrupted process picks up when continued.
    #[serde(default)]
    pub resume: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(pid: u64, process_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            pid,
            process_type: process_type.into(),
            state: ProcessState::Created,
            inputs,
            outputs: None,
            error: None,
            resume: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `state`, refreshing the timestamp.
    pub fn transition(&mut self, state: ProcessState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Checkpoint store shared by the launcher and the runner.
pub trait Persister: Send + Sync {
    /// Allocate a fresh process id.
    fn next_pid(&self) -> u64;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    fn load_checkpoint(&self, pid: u64) -> Result<Checkpoint, PersistenceError>;

    fn delete_checkpoint(&self, pid: u64) -> Result<(), PersistenceError>;
}

/// Keeps checkpoints as serialized JSON in memory.
#[derive(Debug)]
pub struct InMemoryPersister {
    checkpoints: Mutex<HashMap<u64, String>>,
    next_pid: AtomicU64,
}

impl Default for InMemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persister for InMemoryPersister {
    fn next_pid(&self) -> u64 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_string(checkpoint)?;
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(checkpoint.pid, encoded);
        Ok(())
    }

    fn load_checkpoint(&self, pid: u64) -> Result<Checkpoint, PersistenceError> {
        let encoded = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
            .ok_or(PersistenceError::NotFound(pid))?;
        Ok(serde_json::from_str(&encoded)?)
    }

    fn delete_checkpoint(&self, pid: u64) -> Result<(), PersistenceError> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
            .map(|_| ())
            .ok_or(PersistenceError::NotFound(pid))
    }
}
