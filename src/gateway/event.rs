//! Inbound progress events and their defensive parsing.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::GatewayError;
use crate::run::heuristic::Observation;
use crate::run::model::EventKind;

/// One progress event from the client agent, validated at the boundary.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub participant_key: String,
    pub kind: EventKind,
    /// Present iff `kind` is `ObservationReport`.
    pub observation: Option<Observation>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProgressEvent {
    /// Validate an untrusted payload into a `ProgressEvent`.
    ///
    /// The client agent is not trusted to send well-formed JSON, so required
    /// fields are checked explicitly and anything missing is rejected as
    /// `MalformedEvent` rather than bubbling a deserialization panic.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, GatewayError> {
        let obj = value
            .as_object()
            .ok_or_else(|| GatewayError::MalformedEvent("event must be a JSON object".into()))?;

        let participant_key = obj
            .get("participant_key")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::MalformedEvent("missing participant_key".into()))?
            .to_string();

        let kind_value = obj
            .get("event_kind")
            .or_else(|| obj.get("kind"))
            .ok_or_else(|| GatewayError::MalformedEvent("missing event_kind".into()))?;
        let kind: EventKind = serde_json::from_value(kind_value.clone()).map_err(|_| {
            GatewayError::MalformedEvent(format!("unknown event_kind {kind_value}"))
        })?;

        let observation = match kind {
            EventKind::ObservationReport => {
                let raw = obj.get("observation").ok_or_else(|| {
                    GatewayError::MalformedEvent("observation_report requires an observation".into())
                })?;
                Some(Observation::parse(raw).ok_or_else(|| {
                    GatewayError::MalformedEvent(
                        "observation carries no judgment text".into(),
                    )
                })?)
            }
            _ => None,
        };

        let timestamp = obj
            .get("timestamp")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        Ok(Self {
            participant_key,
            kind,
            observation,
            timestamp,
        })
    }
}

/// Result of ingesting one event, surfaced to the client agent as the ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// First activation: the engagement is now in progress.
    Activated,
    /// Repeated activation for an already-activated run; no-op.
    DuplicateActivation,
    /// The observation advanced nothing; the judgment is feedback only.
    Feedback { message: String },
    /// A sub-unit was marked done.
    SubUnitAdvanced {
        step_id: u32,
        sub_unit: usize,
        step_completed: bool,
    },
    /// The current step was completed via confirmation.
    StepAdvanced { step_id: u32 },
    /// First engagement-completed signal: the run is onboarded.
    Completed,
    /// Repeated completion signal; no-op.
    DuplicateCompletion,
    /// The event arrived before any activation and was not applied.
    RejectedNotActivated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_activation() {
        let value = serde_json::json!({
            "participant_key": "User@Co.com",
            "event_kind": "activation",
        });
        let event = ProgressEvent::from_value(&value).unwrap();
        assert_eq!(event.participant_key, "User@Co.com");
        assert_eq!(event.kind, EventKind::Activation);
        assert!(event.observation.is_none());
    }

    #[test]
    fn accepts_kind_alias() {
        let value = serde_json::json!({
            "participant_key": "user@co.com",
            "kind": "engagement_completed",
        });
        let event = ProgressEvent::from_value(&value).unwrap();
        assert_eq!(event.kind, EventKind::EngagementCompleted);
    }

    #[test]
    fn observation_report_requires_observation() {
        let value = serde_json::json!({
            "participant_key": "user@co.com",
            "event_kind": "observation_report",
        });
        assert!(matches!(
            ProgressEvent::from_value(&value),
            Err(GatewayError::MalformedEvent(_))
        ));
    }

    #[test]
    fn observation_report_with_judgment() {
        let value = serde_json::json!({
            "participant_key": "user@co.com",
            "event_kind": "observation_report",
            "observation": {
                "judgment": "Perfect, email entered!",
                "proof": "screenshot shows user@co.com"
            },
            "timestamp": "2025-06-01T12:00:00Z",
        });
        let event = ProgressEvent::from_value(&value).unwrap();
        let observation = event.observation.unwrap();
        assert_eq!(observation.judgment, "Perfect, email entered!");
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn missing_fields_rejected() {
        for value in [
            serde_json::json!([]),
            serde_json::json!({"event_kind": "activation"}),
            serde_json::json!({"participant_key": "  ", "event_kind": "activation"}),
            serde_json::json!({"participant_key": "u@c.com"}),
            serde_json::json!({"participant_key": "u@c.com", "event_kind": "bogus"}),
        ] {
            assert!(
                matches!(
                    ProgressEvent::from_value(&value),
                    Err(GatewayError::MalformedEvent(_))
                ),
                "expected rejection for {value}"
            );
        }
    }
}
