//! Session store port and its in-memory adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::RegistryError;
use crate::run::model::Run;

/// A state-transition function applied to one run under its lock.
pub type MutateOp = Box<dyn FnOnce(&mut Run) + Send>;

/// Storage port for run state.
///
/// The core never assumes a specific backing: tests and the default binary
/// use [`MemoryStore`], a networked adapter can implement the same contract.
/// Keys are always normalized before they reach the store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new run, keyed by its (already normalized) participant key.
    /// Fails with `DuplicateRun` if any run exists for that key.
    async fn create(&self, run: Run) -> Result<(), RegistryError>;

    /// Read a consistent snapshot of a run.
    async fn get(&self, key: &str) -> Option<Run>;

    /// Apply `op` under the run's lock and return the post-mutation snapshot.
    ///
    /// Exactly one writer mutates a given run at a time; mutations of
    /// different runs proceed independently.
    async fn mutate(&self, key: &str, op: MutateOp) -> Result<Run, RegistryError>;

    /// Remove a run. Returns false if none existed.
    async fn remove(&self, key: &str) -> bool;

    /// All stored keys.
    async fn keys(&self) -> Vec<String>;
}

/// In-process concurrent map adapter.
///
/// The outer `RwLock` guards the key index only and is held briefly; each run
/// sits behind its own `Mutex`, so per-run mutation is serialized while
/// cross-run operations run in parallel. Readers clone a snapshot and never
/// observe a torn state.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, Arc<Mutex<Run>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, run: Run) -> Result<(), RegistryError> {
        let key = run.participant_key.clone();
        let mut runs = self.runs.write().await;
        if runs.contains_key(&key) {
            return Err(RegistryError::DuplicateRun { key });
        }
        runs.insert(key, Arc::new(Mutex::new(run)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Run> {
        let entry = self.runs.read().await.get(key).cloned()?;
        let run = entry.lock().await;
        Some(run.clone())
    }

    async fn mutate(&self, key: &str, op: MutateOp) -> Result<Run, RegistryError> {
        let entry = self
            .runs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                key: key.to_string(),
            })?;
        // The index lock is released; only this run's lock is held while the
        // transition runs.
        let mut run = entry.lock().await;
        op(&mut run);
        Ok(run.clone())
    }

    async fn remove(&self, key: &str) -> bool {
        self.runs.write().await.remove(key).is_some()
    }

    async fn keys(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }
}
