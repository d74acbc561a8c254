//! Session Registry — the single source of truth for run state and live
//! channel attachments.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::delivery::frame::StateFrame;
use crate::error::RegistryError;
use crate::run::model::{Run, Step, normalize_key};

pub use store::{MemoryStore, MutateOp, SessionStore};

/// Live delivery binding for a run. The registry exclusively owns these; the
/// multiplexer borrows a sender to push but never stores its own copy.
struct Attachment {
    tx: mpsc::Sender<StateFrame>,
    attached_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
}

/// Concurrency-safe mapping from normalized participant identity to run
/// state and channel attachment.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    channels: RwLock<HashMap<String, Attachment>>,
    channel_capacity: usize,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, channel_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            channels: RwLock::new(HashMap::new()),
            channel_capacity,
        })
    }

    /// Create a run for a participant.
    ///
    /// Fails with `DuplicateRun` while an active, non-terminal run exists for
    /// the same (case-normalized) identity — the caller decides whether to
    /// reset first. A leftover terminal run is replaced.
    pub async fn create_run(
        &self,
        participant_key: &str,
        platform: String,
        steps: Vec<Step>,
    ) -> Result<Run, RegistryError> {
        let key = normalize_key(participant_key);
        if let Some(existing) = self.store.get(&key).await {
            if !existing.is_terminal() {
                return Err(RegistryError::DuplicateRun { key });
            }
            debug!(participant = %key, "Replacing terminal run");
            self.detach_channel(&key).await;
            self.store.remove(&key).await;
        }

        let run = Run::new(key.clone(), platform, steps);
        self.store.create(run.clone()).await?;
        info!(participant = %key, run_id = %run.id, platform = %run.platform, "Run created");
        Ok(run)
    }

    /// Explicitly discard a run and its attachment. Never called implicitly.
    pub async fn reset_run(&self, participant_key: &str) -> bool {
        let key = normalize_key(participant_key);
        self.detach_channel(&key).await;
        let removed = self.store.remove(&key).await;
        if removed {
            info!(participant = %key, "Run reset");
        }
        removed
    }

    /// Normalized lookup: succeeds for any casing of the same identity.
    pub async fn get_run(&self, participant_key: &str) -> Option<Run> {
        self.store.get(&normalize_key(participant_key)).await
    }

    /// Apply a state-transition function under the run's lock.
    ///
    /// Returns the closure's output together with the post-mutation snapshot.
    pub async fn mutate<T, F>(
        &self,
        participant_key: &str,
        f: F,
    ) -> Result<(T, Run), RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Run) -> T + Send + 'static,
    {
        let key = normalize_key(participant_key);
        let slot: Arc<std::sync::Mutex<Option<T>>> = Arc::new(std::sync::Mutex::new(None));
        let out = Arc::clone(&slot);
        let run = self
            .store
            .mutate(
                &key,
                Box::new(move |run| {
                    *out.lock().expect("mutation slot poisoned") = Some(f(run));
                }),
            )
            .await?;
        let value = slot
            .lock()
            .expect("mutation slot poisoned")
            .take()
            .expect("store mutate must invoke the transition exactly once");
        Ok((value, run))
    }

    /// Attach a live channel for a run, replacing any previous attachment
    /// (the old receiver's stream ends when its sender is dropped).
    pub async fn attach_channel(
        &self,
        participant_key: &str,
    ) -> Result<mpsc::Receiver<StateFrame>, RegistryError> {
        let key = normalize_key(participant_key);
        if self.store.get(&key).await.is_none() {
            return Err(RegistryError::NotFound { key });
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let now = Utc::now();
        self.channels.write().await.insert(
            key.clone(),
            Attachment {
                tx,
                attached_at: now,
                last_heartbeat_at: now,
            },
        );
        debug!(participant = %key, "Live channel attached");
        Ok(rx)
    }

    /// Detach the live channel, if any. Idempotent.
    pub async fn detach_channel(&self, participant_key: &str) -> bool {
        let key = normalize_key(participant_key);
        match self.channels.write().await.remove(&key) {
            Some(attachment) => {
                let now = Utc::now();
                debug!(
                    participant = %key,
                    attached_secs = (now - attachment.attached_at).num_seconds(),
                    idle_secs = (now - attachment.last_heartbeat_at).num_seconds(),
                    "Live channel detached"
                );
                true
            }
            None => false,
        }
    }

    /// Borrow a sender for the run's live channel, if one is attached.
    pub async fn channel(&self, participant_key: &str) -> Option<mpsc::Sender<StateFrame>> {
        let key = normalize_key(participant_key);
        self.channels.read().await.get(&key).map(|a| a.tx.clone())
    }

    /// Keys with a live channel attached.
    pub async fn attached_keys(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Record a successful heartbeat on a channel.
    pub async fn touch_heartbeat(&self, participant_key: &str) {
        let key = normalize_key(participant_key);
        if let Some(attachment) = self.channels.write().await.get_mut(&key) {
            attachment.last_heartbeat_at = Utc::now();
        }
    }

    /// All stored run keys.
    pub async fn active_keys(&self) -> Vec<String> {
        self.store.keys().await
    }

    /// Remove a run and its attachment (reaping path).
    pub async fn remove_run(&self, participant_key: &str) -> bool {
        let key = normalize_key(participant_key);
        self.detach_channel(&key).await;
        self.store.remove(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(Arc::new(MemoryStore::new()), 16)
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let registry = registry();
        registry
            .create_run("User@Co.com", "jira".into(), Vec::new())
            .await
            .unwrap();

        let exact = registry.get_run("user@co.com").await.unwrap();
        let cased = registry.get_run("USER@CO.COM").await.unwrap();
        let padded = registry.get_run("  User@Co.com ").await.unwrap();
        assert_eq!(exact.id, cased.id);
        assert_eq!(exact.id, padded.id);
        assert_eq!(exact.participant_key, "user@co.com");
    }

    #[tokio::test]
    async fn duplicate_active_run_rejected() {
        let registry = registry();
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        assert!(matches!(
            registry
                .create_run("USER@co.com", "jira".into(), Vec::new())
                .await,
            Err(RegistryError::DuplicateRun { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_run_is_replaced() {
        let registry = registry();
        let first = registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        registry
            .mutate("user@co.com", |run| {
                run.phase = crate::run::model::RunPhase::Onboarded;
            })
            .await
            .unwrap();

        let second = registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn reset_then_create() {
        let registry = registry();
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        assert!(registry.reset_run("User@Co.com").await);
        assert!(registry.get_run("user@co.com").await.is_none());
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mutate_returns_value_and_snapshot() {
        let registry = registry();
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        let (first, run) = registry
            .mutate("User@Co.com", |run| run.engagement.activate())
            .await
            .unwrap();
        assert!(first);
        assert!(run.engagement.agent_activated());
    }

    #[tokio::test]
    async fn attach_requires_run() {
        let registry = registry();
        assert!(matches!(
            registry.attach_channel("ghost@co.com").await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = registry();
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        // Nothing attached yet: safe no-op.
        assert!(!registry.detach_channel("user@co.com").await);

        let _rx = registry.attach_channel("user@co.com").await.unwrap();
        assert!(registry.detach_channel("user@co.com").await);
        assert!(!registry.detach_channel("user@co.com").await);
    }

    #[tokio::test]
    async fn attach_replaces_previous_channel() {
        let registry = registry();
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        let mut old_rx = registry.attach_channel("user@co.com").await.unwrap();
        let _new_rx = registry.attach_channel("user@co.com").await.unwrap();
        // Old sender dropped: the old stream ends.
        assert!(old_rx.recv().await.is_none());
    }
}
