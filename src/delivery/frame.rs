//! Delivery frames — the units pushed on live channels and retained in the
//! poll-fallback snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::model::{PhaseStatus, Run, RunPhase};

/// Wire-level event name of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameEvent {
    /// A state change.
    Update,
    /// Liveness no-op, never recorded in the poll snapshot.
    Heartbeat,
    /// Final frame of a successful run; the channel closes after it.
    Done,
    /// Final frame of a failed run; the channel closes after it.
    Error,
}

impl FrameEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Heartbeat => "heartbeat",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Whether this frame terminates the channel.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One state-change frame: `{phase, status, message, data}` plus ordering
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFrame {
    /// Per-run sequence number, assigned under the run lock.
    pub seq: u64,
    pub event: FrameEvent,
    pub phase: RunPhase,
    pub status: PhaseStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// A state change to publish, before a sequence number is assigned.
#[derive(Debug, Clone)]
pub struct StateDelta {
    pub event: FrameEvent,
    pub phase: RunPhase,
    pub status: PhaseStatus,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl StateDelta {
    pub fn update(phase: RunPhase, status: PhaseStatus, message: impl Into<String>) -> Self {
        Self {
            event: FrameEvent::Update,
            phase,
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self {
            event: FrameEvent::Done,
            phase: RunPhase::Onboarded,
            status: PhaseStatus::Completed,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(phase: RunPhase, message: impl Into<String>) -> Self {
        Self {
            event: FrameEvent::Error,
            phase,
            status: PhaseStatus::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Apply a delta to a run under its lock: assign the next sequence number,
/// move the run's observed phase, and append to the poll-fallback snapshot.
///
/// The snapshot is always updated here, whether or not a live channel is
/// attached, so push and poll state never diverge.
pub fn append_frame(run: &mut Run, delta: StateDelta) -> StateFrame {
    let frame = StateFrame {
        seq: run.next_seq,
        event: delta.event,
        phase: delta.phase,
        status: delta.status,
        message: delta.message,
        data: delta.data,
        at: Utc::now(),
    };
    run.next_seq += 1;
    run.phase = delta.phase;
    run.phase_status = delta.status;
    if run.phase.is_terminal() && run.terminal_at.is_none() {
        run.terminal_at = Some(frame.at);
    }
    run.delivery_log.push(frame.clone());
    frame
}

/// Build a heartbeat frame reflecting the run's current phase. Not appended
/// to the poll snapshot: it carries no state change.
pub fn heartbeat(run: &Run) -> StateFrame {
    StateFrame {
        seq: run.next_seq.saturating_sub(1),
        event: FrameEvent::Heartbeat,
        phase: run.phase,
        status: run.phase_status,
        message: String::new(),
        data: None,
        at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_ordered_seqs() {
        let mut run = Run::new("user@co.com".into(), "jira".into(), Vec::new());
        let first = append_frame(
            &mut run,
            StateDelta::update(RunPhase::Analyzing, PhaseStatus::Running, "analyzing"),
        );
        let second = append_frame(
            &mut run,
            StateDelta::update(RunPhase::Generating, PhaseStatus::Running, "generating"),
        );
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(run.delivery_log.len(), 2);
        assert_eq!(run.phase, RunPhase::Generating);
    }

    #[test]
    fn terminal_frame_sets_terminal_at_once() {
        let mut run = Run::new("user@co.com".into(), "jira".into(), Vec::new());
        append_frame(&mut run, StateDelta::done("all done"));
        let stamped = run.terminal_at.unwrap();
        append_frame(
            &mut run,
            StateDelta::error(RunPhase::Failed, "late error frame"),
        );
        assert_eq!(run.terminal_at.unwrap(), stamped);
    }

    #[test]
    fn heartbeat_not_recorded() {
        let run = Run::new("user@co.com".into(), "jira".into(), Vec::new());
        let frame = heartbeat(&run);
        assert_eq!(frame.event, FrameEvent::Heartbeat);
        assert!(run.delivery_log.is_empty());
    }
}
