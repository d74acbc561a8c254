//! Run domain — data model, step ledger, completion heuristic, catalogs.

pub mod catalog;
pub mod heuristic;
pub mod ledger;
pub mod model;

pub use heuristic::{CompletionDecision, Heuristic, Observation};
pub use model::{EngagementState, EventKind, EventRecord, Run, RunPhase, Step, StepStatus, SubUnit};
