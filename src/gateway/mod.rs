//! Event Ingestion Gateway — the boundary that accepts run-start requests and
//! progress events, normalizes identity, and dispatches into the registry.

pub mod event;
pub mod routes;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::delivery::frame::{self, StateDelta, StateFrame};
use crate::delivery::{DeliveryMux, LiveSend, live_send};
use crate::error::GatewayError;
use crate::provision::{Provisioner, WorkflowRequest};
use crate::registry::SessionRegistry;
use crate::run::heuristic::{CompletionDecision, Heuristic};
use crate::run::model::{
    EventKind, EventRecord, PhaseStatus, Run, RunPhase, StepStatus,
};
use crate::run::{catalog, ledger};

pub use event::{IngestOutcome, ProgressEvent};

/// Accepts inbound events and run-start requests; owns no state of its own.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    mux: Arc<DeliveryMux>,
    provisioner: Arc<dyn Provisioner>,
    heuristic: Heuristic,
    event_log_cap: usize,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        mux: Arc<DeliveryMux>,
        provisioner: Arc<dyn Provisioner>,
        heuristic: Heuristic,
        event_log_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            mux,
            provisioner,
            heuristic,
            event_log_cap,
        })
    }

    /// Start a run: create the session, attach the caller's live channel, and
    /// kick off provisioning in the background.
    ///
    /// Returns the created run and the receiver end of its delivery channel.
    pub async fn initiate(
        &self,
        participant_key: &str,
        platform: &str,
        request: WorkflowRequest,
    ) -> Result<(Run, mpsc::Receiver<StateFrame>), GatewayError> {
        let steps = catalog::steps_for(platform).ok_or_else(|| {
            GatewayError::MalformedEvent(format!("unknown platform {platform}"))
        })?;

        let run = self
            .registry
            .create_run(participant_key, platform.to_string(), steps)
            .await?;
        let rx = self.registry.attach_channel(&run.participant_key).await?;

        self.spawn_provisioning(run.participant_key.clone(), platform.to_string(), request);
        Ok((run, rx))
    }

    fn spawn_provisioning(&self, key: String, platform: String, request: WorkflowRequest) {
        let mux = Arc::clone(&self.mux);
        let provisioner = Arc::clone(&self.provisioner);
        tokio::spawn(async move {
            if let Err(e) = drive_provisioning(&mux, &*provisioner, &key, &platform, &request).await
            {
                warn!(participant = %key, error = %e, "Provisioning failed");
                let delta = StateDelta::error(RunPhase::Failed, format!("Provisioning failed: {e}"));
                if let Err(e) = mux.publish(&key, delta).await {
                    warn!(participant = %key, error = %e, "Could not publish failure frame");
                }
            }
        });
    }

    /// Ingest one raw progress event.
    ///
    /// The event is appended to the run's audit log whether or not it changes
    /// state. The returned ack reflects the state mutation only; the live
    /// push is non-blocking, so the ack never waits on a slow observer.
    pub async fn ingest(&self, raw: &serde_json::Value) -> Result<IngestOutcome, GatewayError> {
        let event = match ProgressEvent::from_value(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Rejected inbound event");
                return Err(e);
            }
        };

        let key = event.participant_key.clone();
        let kind = event.kind;
        let heuristic = self.heuristic;
        let cap = self.event_log_cap;

        // The sender is cloned before the mutation so the live push can run
        // inside the run's critical section, keeping delivery in seq order.
        let tx = self.registry.channel(&key).await;
        let (result, _run) = self
            .registry
            .mutate(&key, move |run| apply_event(run, &event, heuristic, cap, tx))
            .await?;
        let (outcome, frames, statuses) = result;

        info!(
            participant = %key,
            kind = %kind,
            outcome = ?outcome,
            "Event ingested"
        );
        self.mux.settle(&key, &statuses, &frames).await;
        Ok(outcome)
    }
}

/// Apply one event to a run under its lock. Returns the ack outcome, the
/// frames recorded for delivery, and the result of pushing each one on the
/// live channel (the push happens here, still under the lock).
fn apply_event(
    run: &mut Run,
    event: &ProgressEvent,
    heuristic: Heuristic,
    cap: usize,
    tx: Option<mpsc::Sender<StateFrame>>,
) -> (IngestOutcome, Vec<StateFrame>, Vec<LiveSend>) {
    let judgment = event.observation.as_ref().map(|o| o.judgment.clone());
    run.push_event(EventRecord::new(event.kind, judgment), cap);

    let mut frames = Vec::new();
    let outcome = match event.kind {
        EventKind::Activation => apply_activation(run, &mut frames),
        EventKind::ObservationReport => {
            match event.observation.as_ref() {
                Some(observation) => {
                    apply_observation(run, observation, heuristic, &mut frames)
                }
                // Validated at the boundary; absent means a bug upstream.
                None => IngestOutcome::Feedback {
                    message: "observation missing".into(),
                },
            }
        }
        EventKind::EngagementCompleted => apply_completion(run, &mut frames),
    };
    let statuses = frames
        .iter()
        .map(|frame| live_send(tx.as_ref(), frame))
        .collect();
    (outcome, frames, statuses)
}

fn apply_activation(run: &mut Run, frames: &mut Vec<StateFrame>) -> IngestOutcome {
    if !run.engagement.activate() {
        // Idempotent: the agent retries activation freely.
        return IngestOutcome::DuplicateActivation;
    }
    if run.first_activation_at.is_none() {
        run.first_activation_at = Some(Utc::now());
    }
    let progress = run.progress();
    frames.push(frame::append_frame(
        run,
        StateDelta::update(
            RunPhase::Opened,
            PhaseStatus::Running,
            "Client agent activated; engagement in progress",
        )
        .with_data(progress),
    ));
    IngestOutcome::Activated
}

fn apply_observation(
    run: &mut Run,
    observation: &crate::run::heuristic::Observation,
    heuristic: Heuristic,
    frames: &mut Vec<StateFrame>,
) -> IngestOutcome {
    if !run.engagement.agent_activated() {
        warn!(
            participant = %run.participant_key,
            "Observation before activation, not applied"
        );
        return IngestOutcome::RejectedNotActivated;
    }
    if run.engagement.completed() {
        return IngestOutcome::Feedback {
            message: "engagement already completed".into(),
        };
    }

    if run.engagement.begin() {
        frames.push(frame::append_frame(
            run,
            StateDelta::update(
                RunPhase::Onboarding,
                PhaseStatus::Running,
                "Participant working through steps",
            ),
        ));
    }

    match heuristic.evaluate(run, observation) {
        CompletionDecision::NoChange => IngestOutcome::Feedback {
            message: observation.judgment.clone(),
        },
        CompletionDecision::AdvanceSubUnit { index, proof } => {
            advance_sub_unit(run, index, proof, frames)
        }
        CompletionDecision::AdvanceStep => advance_step(run, frames),
    }
}

fn advance_sub_unit(
    run: &mut Run,
    index: usize,
    proof: Option<String>,
    frames: &mut Vec<StateFrame>,
) -> IngestOutcome {
    let Some(step_idx) = run
        .steps
        .iter()
        .position(|s| s.status != StepStatus::Completed)
    else {
        return IngestOutcome::Feedback {
            message: "all steps already completed".into(),
        };
    };
    let step_id = run.steps[step_idx].id;

    if run.steps[step_idx].status == StepStatus::Pending {
        if !transition(run, step_id, StepStatus::Running) {
            return IngestOutcome::Feedback {
                message: "step could not start".into(),
            };
        }
    }

    {
        let unit = &mut run.steps[step_idx].sub_units[index];
        unit.done = true;
        unit.proof = proof;
    }
    let unit_desc = run.steps[step_idx].sub_units[index].description.clone();

    // Sub-unit completion wins over confirmation: finishing the last
    // sub-unit completes the step in the same mutation.
    let step_completed = run.steps[step_idx].all_sub_units_done()
        && transition(run, step_id, StepStatus::Completed);

    let progress = run.progress();
    frames.push(frame::append_frame(
        run,
        StateDelta::update(
            RunPhase::Onboarding,
            PhaseStatus::Running,
            format!("Completed: {unit_desc}"),
        )
        .with_data(serde_json::json!({
            "step_id": step_id,
            "sub_unit": index,
            "step_completed": step_completed,
            "progress": progress,
        })),
    ));

    IngestOutcome::SubUnitAdvanced {
        step_id,
        sub_unit: index,
        step_completed,
    }
}

fn advance_step(run: &mut Run, frames: &mut Vec<StateFrame>) -> IngestOutcome {
    let Some(step) = ledger::next_pending_step(run) else {
        return IngestOutcome::Feedback {
            message: "all steps already completed".into(),
        };
    };
    let step_id = step.id;
    let status = step.status;
    let description = step.description.clone();

    if status == StepStatus::Pending && !transition(run, step_id, StepStatus::Running) {
        return IngestOutcome::Feedback {
            message: "step could not start".into(),
        };
    }
    if !transition(run, step_id, StepStatus::Completed) {
        return IngestOutcome::Feedback {
            message: "step could not complete".into(),
        };
    }

    let progress = run.progress();
    frames.push(frame::append_frame(
        run,
        StateDelta::update(
            RunPhase::Onboarding,
            PhaseStatus::Running,
            format!("Step completed: {description}"),
        )
        .with_data(serde_json::json!({
            "step_id": step_id,
            "progress": progress,
        })),
    ));
    IngestOutcome::StepAdvanced { step_id }
}

fn apply_completion(run: &mut Run, frames: &mut Vec<StateFrame>) -> IngestOutcome {
    if !run.engagement.agent_activated() {
        // A run that was never activated must not spuriously complete.
        warn!(
            participant = %run.participant_key,
            "Engagement-completed before activation, rejected"
        );
        return IngestOutcome::RejectedNotActivated;
    }
    if !run.engagement.complete() {
        return IngestOutcome::DuplicateCompletion;
    }

    if run.completed_at.is_none() {
        run.completed_at = Some(Utc::now());
    }
    let progress = run.progress();
    frames.push(frame::append_frame(
        run,
        StateDelta::update(
            RunPhase::Onboarding,
            PhaseStatus::Completed,
            "Engagement completed",
        )
        .with_data(progress),
    ));
    frames.push(frame::append_frame(
        run,
        StateDelta::done("Participant onboarded"),
    ));
    IngestOutcome::Completed
}

/// Apply a ledger transition in place, logging (not propagating) rejections.
/// A rejection here means a gateway logic error, not a client error.
fn transition(run: &mut Run, step_id: u32, status: StepStatus) -> bool {
    match ledger::advance(run, step_id, status) {
        Ok(updated) => {
            *run = updated;
            true
        }
        Err(e) => {
            error!(participant = %run.participant_key, error = %e, "Ledger rejected transition");
            false
        }
    }
}

async fn drive_provisioning(
    mux: &DeliveryMux,
    provisioner: &dyn Provisioner,
    key: &str,
    platform: &str,
    request: &WorkflowRequest,
) -> Result<(), crate::error::ProvisionError> {
    publish_or_log(
        mux,
        key,
        StateDelta::update(
            RunPhase::Analyzing,
            PhaseStatus::Running,
            "Analyzing workflow request",
        ),
    )
    .await;
    let spec = provisioner.analyze(key, platform, request).await?;

    publish_or_log(
        mux,
        key,
        StateDelta::update(
            RunPhase::Generating,
            PhaseStatus::Running,
            "Generating workflow content",
        ),
    )
    .await;
    let content = provisioner.generate(&spec).await?;

    publish_or_log(
        mux,
        key,
        StateDelta::update(
            RunPhase::Sending,
            PhaseStatus::Running,
            "Dispatching notification",
        ),
    )
    .await;
    provisioner.send(key, &content).await?;

    publish_or_log(
        mux,
        key,
        StateDelta::update(
            RunPhase::Sending,
            PhaseStatus::Completed,
            "Workflow delivered; waiting for activation",
        )
        .with_data(serde_json::json!({ "task_url": content.task_url })),
    )
    .await;
    Ok(())
}

async fn publish_or_log(mux: &DeliveryMux, key: &str, delta: StateDelta) {
    if let Err(e) = mux.publish(key, delta).await {
        // The run was reset mid-provisioning; nothing to deliver to.
        warn!(participant = %key, error = %e, "Phase update not published");
    }
}
