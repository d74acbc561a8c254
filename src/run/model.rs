//! Run data model — runs, steps, sub-units, and engagement state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::frame::StateFrame;

/// Normalize a participant key for storage and lookup.
///
/// All identity comparison in the core goes through this: keys are trimmed
/// and lowercased so `"User@Co.com"` and `"user@co.com"` resolve to the same
/// run.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Engagement lifecycle for a run.
///
/// Progresses one way: NotStarted → Activated → InProgress → Completed.
/// Replaces the three ad-hoc booleans (`agentActivated`,
/// `engagementInProgress`, `engagementCompleted`) of the original protocol so
/// contradictory combinations are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementState {
    /// No activation event received yet.
    NotStarted,
    /// The client agent has activated; no observation reports yet.
    Activated,
    /// The participant is actively working through steps.
    InProgress,
    /// The engagement finished. Terminal.
    Completed,
}

impl EngagementState {
    /// Whether the client agent has ever activated (monotonic).
    pub fn agent_activated(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }

    /// Whether the participant is actively working.
    pub fn in_progress(&self) -> bool {
        matches!(self, Self::Activated | Self::InProgress)
    }

    /// Whether the engagement completed (monotonic, terminal).
    pub fn completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Apply an activation. Returns true only on the first activation;
    /// repeated activations are no-ops.
    pub fn activate(&mut self) -> bool {
        if matches!(self, Self::NotStarted) {
            *self = Self::Activated;
            true
        } else {
            false
        }
    }

    /// Mark the participant as actively working (first observation report).
    pub fn begin(&mut self) -> bool {
        if matches!(self, Self::Activated) {
            *self = Self::InProgress;
            true
        } else {
            false
        }
    }

    /// Apply an engagement-completed signal. Returns true only on the first
    /// transition. A completion before any activation is rejected (false) —
    /// a run that was never activated must not spuriously complete.
    pub fn complete(&mut self) -> bool {
        if matches!(self, Self::Activated | Self::InProgress) {
            *self = Self::Completed;
            true
        } else {
            false
        }
    }
}

impl Default for EngagementState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl std::fmt::Display for EngagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Activated => "activated",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Externally observed phase of a run, as published on delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Provisioning: analyzing the workflow request.
    Analyzing,
    /// Provisioning: generating workflow content.
    Generating,
    /// Provisioning: dispatching the task/notification.
    Sending,
    /// The client agent activated; participant has opened the workflow.
    Opened,
    /// The participant is working through steps.
    Onboarding,
    /// Terminal: the engagement finished.
    Onboarded,
    /// Terminal: provisioning errored before the workflow reached the
    /// participant.
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Onboarded | Self::Failed)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Sending => "sending",
            Self::Opened => "opened",
            Self::Onboarding => "onboarding",
            Self::Onboarded => "onboarded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Status qualifier on a phase frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Error,
}

/// Status of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A finer-grained checkable item within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubUnit {
    pub description: String,
    /// Keywords the Completion Heuristic matches judgment text against.
    pub keywords: Vec<String>,
    pub done: bool,
    /// Proof recorded at the moment the sub-unit was marked done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

impl SubUnit {
    pub fn new(description: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            description: description.into(),
            keywords,
            done: false,
            proof: None,
        }
    }
}

/// A unit of work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: u32,
    /// Position in the sequence (steps are evaluated strictly left to right).
    pub ordinal: u32,
    pub description: String,
    /// Keywords describing the step as a whole.
    pub keywords: Vec<String>,
    pub status: StepStatus,
    pub sub_units: Vec<SubUnit>,
}

impl Step {
    pub fn new(
        id: u32,
        ordinal: u32,
        description: impl Into<String>,
        keywords: Vec<String>,
        sub_units: Vec<SubUnit>,
    ) -> Self {
        Self {
            id,
            ordinal,
            description: description.into(),
            keywords,
            status: StepStatus::Pending,
            sub_units,
        }
    }

    /// Index of the first not-done sub-unit, if any.
    pub fn first_open_sub_unit(&self) -> Option<usize> {
        self.sub_units.iter().position(|u| !u.done)
    }

    /// Whether every sub-unit is done (vacuously true with no sub-units).
    pub fn all_sub_units_done(&self) -> bool {
        self.sub_units.iter().all(|u| u.done)
    }
}

/// Kind of an ingested progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Activation,
    ObservationReport,
    EngagementCompleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Activation => "activation",
            Self::ObservationReport => "observation_report",
            Self::EngagementCompleted => "engagement_completed",
        };
        write!(f, "{s}")
    }
}

/// One raw ingested event, kept for audit and heuristic context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub kind: EventKind,
    /// Judgment text of the observation, if the event carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judgment: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: EventKind, judgment: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            judgment,
            received_at: Utc::now(),
        }
    }
}

/// One onboarding engagement for one participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// Normalized participant identity (lowercase, trimmed).
    pub participant_key: String,
    /// Platform the step catalog was drawn from (e.g. "jira").
    pub platform: String,
    pub steps: Vec<Step>,
    pub engagement: EngagementState,
    pub phase: RunPhase,
    pub phase_status: PhaseStatus,
    pub created_at: DateTime<Utc>,
    /// Set once, on the first activation event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_activation_at: Option<DateTime<Utc>>,
    /// Set once, when the engagement completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once, when the run reaches a terminal phase (drives reaping).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
    /// Append-only ordered log of ingested events (bounded by config).
    pub event_log: Vec<EventRecord>,
    /// Ordered delivery history — the poll-fallback snapshot. Always updated
    /// on publish, whether or not a live channel was attached.
    pub delivery_log: Vec<StateFrame>,
    /// Next delivery sequence number. Assigned under the run lock, so frames
    /// are totally ordered per run.
    pub next_seq: u64,
}

impl Run {
    /// Create a run in its initial state. `participant_key` must already be
    /// normalized by the caller.
    pub fn new(participant_key: String, platform: String, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_key,
            platform,
            steps,
            engagement: EngagementState::default(),
            phase: RunPhase::Analyzing,
            phase_status: PhaseStatus::Running,
            created_at: Utc::now(),
            first_activation_at: None,
            completed_at: None,
            terminal_at: None,
            event_log: Vec::new(),
            delivery_log: Vec::new(),
            next_seq: 1,
        }
    }

    /// Whether the run is in a terminal phase.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Append an event to the audit log, dropping the oldest entry past `cap`.
    pub fn push_event(&mut self, record: EventRecord, cap: usize) {
        self.event_log.push(record);
        if self.event_log.len() > cap {
            let excess = self.event_log.len() - cap;
            self.event_log.drain(..excess);
        }
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Progress summary attached to delivery frames.
    pub fn progress(&self) -> serde_json::Value {
        let total = self.steps.len();
        let completed = self.completed_steps();
        let percentage = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };
        serde_json::json!({
            "completed_steps": completed,
            "total_steps": total,
            "completion_percentage": percentage,
        })
    }
}
