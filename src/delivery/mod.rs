//! Delivery Multiplexer — fans state changes out to live channels, keeps the
//! poll-fallback snapshot current, and maintains channel liveness.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::SessionRegistry;

pub use frame::{FrameEvent, StateDelta, StateFrame};

/// Result of one in-lock live push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSend {
    /// The frame was handed to the channel.
    Delivered,
    /// No channel was attached when the publish began.
    NoChannel,
    /// The channel buffer was full; the frame was dropped from the push.
    Full,
    /// The receiver is gone; the channel should be detached.
    Closed,
}

/// Try-send one frame on the live channel from inside the run's critical
/// section. Synchronous and non-blocking, so the run lock is never held
/// across an await.
///
/// Sending under the same lock that assigned the frame's seq is what keeps
/// live delivery in seq order: two concurrent publishes cannot interleave
/// their append and their send.
pub fn live_send(tx: Option<&mpsc::Sender<StateFrame>>, frame: &StateFrame) -> LiveSend {
    let Some(tx) = tx else {
        return LiveSend::NoChannel;
    };
    match tx.try_send(frame.clone()) {
        Ok(()) => LiveSend::Delivered,
        Err(TrySendError::Full(_)) => LiveSend::Full,
        Err(TrySendError::Closed(_)) => LiveSend::Closed,
    }
}

/// Pushes state changes for a session to whichever observers are attached.
///
/// Holds only a reference to the registry — run state is always re-read from
/// it, never cached here.
pub struct DeliveryMux {
    registry: Arc<SessionRegistry>,
}

impl DeliveryMux {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Publish a state change for a run.
    ///
    /// The poll snapshot is updated and the live push attempted inside the
    /// run's critical section, so push and poll observers both see frames in
    /// seq order. Channel bookkeeping (detach on close, drop warnings)
    /// happens after the lock is released.
    pub async fn publish(
        &self,
        participant_key: &str,
        delta: StateDelta,
    ) -> Result<StateFrame, RegistryError> {
        let tx = self.registry.channel(participant_key).await;
        let ((frame, status), _run) = self
            .registry
            .mutate(participant_key, move |run| {
                let frame = frame::append_frame(run, delta);
                let status = live_send(tx.as_ref(), &frame);
                (frame, status)
            })
            .await?;
        self.settle(participant_key, &[status], std::slice::from_ref(&frame))
            .await;
        Ok(frame)
    }

    /// Post-lock bookkeeping for in-lock pushes.
    ///
    /// A closed channel is not an error: the channel is detached and the run
    /// continues in poll-only mode. A full channel drops the push; the frame
    /// is already in the poll snapshot and the observer resyncs from there.
    /// A final (`done`/`error`) frame detaches the channel after delivery,
    /// which ends the observer's stream.
    pub async fn settle(
        &self,
        participant_key: &str,
        statuses: &[LiveSend],
        frames: &[StateFrame],
    ) {
        for (status, frame) in statuses.iter().zip(frames) {
            match status {
                LiveSend::Full => {
                    warn!(
                        participant = participant_key,
                        seq = frame.seq,
                        "Live channel full, frame not pushed"
                    );
                }
                LiveSend::Closed => {
                    info!(
                        participant = participant_key,
                        "Live channel closed, falling back to poll-only"
                    );
                }
                LiveSend::Delivered | LiveSend::NoChannel => {}
            }
        }

        let closed = statuses.contains(&LiveSend::Closed);
        let finished = frames.iter().any(|f| f.event.is_final());
        if closed || finished {
            self.registry.detach_channel(participant_key).await;
        }
    }

    /// Emit a heartbeat on every attached channel, detaching dead ones.
    pub async fn heartbeat_sweep(&self) {
        for key in self.registry.attached_keys().await {
            let Some(run) = self.registry.get_run(&key).await else {
                // Run vanished under the attachment; drop the channel.
                self.registry.detach_channel(&key).await;
                continue;
            };
            let Some(tx) = self.registry.channel(&key).await else {
                continue;
            };
            match tx.try_send(frame::heartbeat(&run)) {
                Ok(()) => self.registry.touch_heartbeat(&key).await,
                Err(TrySendError::Closed(_)) => {
                    info!(participant = %key, "Stalled channel detected by heartbeat, detaching");
                    self.registry.detach_channel(&key).await;
                }
                Err(TrySendError::Full(_)) => {
                    debug!(participant = %key, "Channel full during heartbeat");
                }
            }
        }
    }

    /// Garbage-collect runs that reached a terminal phase more than `grace`
    /// ago. Cleanup only — never cancels in-flight work.
    pub async fn reap_sweep(&self, grace: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut reaped = 0;
        for key in self.registry.active_keys().await {
            let Some(run) = self.registry.get_run(&key).await else {
                continue;
            };
            if run.is_terminal() && run.terminal_at.is_some_and(|t| t < cutoff) {
                self.registry.remove_run(&key).await;
                info!(participant = %key, phase = %run.phase, "Reaped terminal run");
                reaped += 1;
            }
        }
        reaped
    }
}

/// Spawn the periodic heartbeat task.
pub fn spawn_heartbeat_task(
    mux: Arc<DeliveryMux>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            mux.heartbeat_sweep().await;
        }
    })
}

/// Spawn the periodic terminal-run reaper.
pub fn spawn_reap_task(
    mux: Arc<DeliveryMux>,
    interval: Duration,
    grace: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            mux.reap_sweep(grace).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use crate::run::model::{PhaseStatus, RunPhase};

    async fn setup() -> (Arc<SessionRegistry>, Arc<DeliveryMux>) {
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), 16);
        let mux = DeliveryMux::new(Arc::clone(&registry));
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        (registry, mux)
    }

    fn update(message: &str) -> StateDelta {
        StateDelta::update(RunPhase::Onboarding, PhaseStatus::Running, message)
    }

    #[tokio::test]
    async fn push_and_poll_stay_consistent() {
        let (registry, mux) = setup().await;
        let mut rx = registry.attach_channel("user@co.com").await.unwrap();

        mux.publish("user@co.com", update("first")).await.unwrap();

        let pushed = rx.recv().await.unwrap();
        let polled = registry.get_run("user@co.com").await.unwrap();
        assert_eq!(polled.delivery_log.len(), 1);
        assert_eq!(polled.delivery_log[0].seq, pushed.seq);
        assert_eq!(polled.delivery_log[0].message, pushed.message);
    }

    #[tokio::test]
    async fn scenario_c_poll_catches_up_after_detach() {
        let (registry, mux) = setup().await;
        let mut rx = registry.attach_channel("user@co.com").await.unwrap();

        for message in ["one", "two", "three"] {
            mux.publish("user@co.com", update(message)).await.unwrap();
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        // Simulate a disconnect, then publish a fourth change.
        drop(rx);
        registry.detach_channel("user@co.com").await;
        mux.publish("user@co.com", update("four")).await.unwrap();

        let run = registry.get_run("user@co.com").await.unwrap();
        let messages: Vec<&str> = run
            .delivery_log
            .iter()
            .map(|f| f.message.as_str())
            .collect();
        assert_eq!(messages, ["one", "two", "three", "four"]);
        let seqs: Vec<u64> = run.delivery_log.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn closed_channel_detaches_and_publish_continues() {
        let (registry, mux) = setup().await;
        let rx = registry.attach_channel("user@co.com").await.unwrap();
        drop(rx); // Observer went away without detaching.

        mux.publish("user@co.com", update("after close")).await.unwrap();

        // Degraded mode: detached, state still recorded.
        assert!(registry.channel("user@co.com").await.is_none());
        let run = registry.get_run("user@co.com").await.unwrap();
        assert_eq!(run.delivery_log.len(), 1);
    }

    #[tokio::test]
    async fn final_frame_ends_the_stream() {
        let (registry, mux) = setup().await;
        let mut rx = registry.attach_channel("user@co.com").await.unwrap();

        mux.publish("user@co.com", StateDelta::done("onboarded"))
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, FrameEvent::Done);
        // Sender dropped on detach: stream ends.
        assert!(rx.recv().await.is_none());
        assert!(registry.channel("user@co.com").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_keep_live_order() {
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), 256);
        let mux = DeliveryMux::new(Arc::clone(&registry));
        registry
            .create_run("user@co.com", "jira".into(), Vec::new())
            .await
            .unwrap();
        let mut rx = registry.attach_channel("user@co.com").await.unwrap();

        let drain = tokio::spawn(async move {
            let mut seqs = Vec::new();
            while let Some(frame) = rx.recv().await {
                seqs.push(frame.seq);
            }
            seqs
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mux = Arc::clone(&mux);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    mux.publish("user@co.com", update("tick")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Final frame detaches the channel, ending the drain.
        mux.publish("user@co.com", StateDelta::done("onboarded"))
            .await
            .unwrap();

        let seqs = drain.await.unwrap();
        assert!(!seqs.is_empty());
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "live frames out of order: {seqs:?}"
        );
    }

    #[tokio::test]
    async fn heartbeat_detaches_dead_channels() {
        let (registry, mux) = setup().await;
        let rx = registry.attach_channel("user@co.com").await.unwrap();
        drop(rx);

        mux.heartbeat_sweep().await;
        assert!(registry.channel("user@co.com").await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_reaches_live_channels() {
        let (registry, mux) = setup().await;
        let mut rx = registry.attach_channel("user@co.com").await.unwrap();

        mux.heartbeat_sweep().await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, FrameEvent::Heartbeat);

        // Heartbeats never land in the poll snapshot.
        let run = registry.get_run("user@co.com").await.unwrap();
        assert!(run.delivery_log.is_empty());
    }

    #[tokio::test]
    async fn reap_respects_grace() {
        let (registry, mux) = setup().await;
        mux.publish("user@co.com", StateDelta::done("onboarded"))
            .await
            .unwrap();

        // Inside the grace period: untouched.
        assert_eq!(mux.reap_sweep(Duration::from_secs(300)).await, 0);
        assert!(registry.get_run("user@co.com").await.is_some());

        // Grace elapsed (zero grace): reaped.
        assert_eq!(mux.reap_sweep(Duration::from_secs(0)).await, 1);
        assert!(registry.get_run("user@co.com").await.is_none());
    }

    #[tokio::test]
    async fn non_terminal_runs_never_reaped() {
        let (registry, mux) = setup().await;
        mux.publish("user@co.com", update("working")).await.unwrap();
        assert_eq!(mux.reap_sweep(Duration::from_secs(0)).await, 0);
        assert!(registry.get_run("user@co.com").await.is_some());
    }
}
