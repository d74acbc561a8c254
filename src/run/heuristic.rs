//! Completion Heuristic — converts an unreliable upstream judgment into a
//! safe, monotonic state advancement.
//!
//! The upstream evaluator is a generative process, so its output is treated
//! as an untrusted, partially structured payload. Advancement is proof-gated:
//! at most one sub-unit per evaluation, never out of order, defaulting to
//! `NoChange` on anything malformed or ambiguous.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ledger;
use super::model::Run;

/// Affirmation tokens the upstream coach emits for a completed action.
static AFFIRMATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(correct|perfect|excellent|great|well done|nice work|good job)\b")
        .expect("valid affirmation regex")
});

/// Explicit completion tokens.
static COMPLETION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(complete|completed|done|finished)\b").expect("valid completion regex"));

/// Markers that flag the judgment text as carrying its own proof.
static PROOF_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(proof|verified|evidence|confirmed)\b").expect("valid proof regex")
});

/// One client-supplied observation: a natural-language judgment plus optional
/// structured proof, both emitted by the upstream screen evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Natural-language judgment of what the participant did.
    pub judgment: String,
    /// Structured proof text, if the evaluator supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    /// Description of the page/screen the observation was made on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

impl Observation {
    /// Best-effort extraction of an observation from an untrusted payload.
    ///
    /// Accepts a bare string (the judgment), or an object with the judgment
    /// under `judgment` or `message` (optionally nested under `guidance`, the
    /// shape the upstream coach produces). Markdown code fences are stripped.
    /// Returns `None` when no judgment text can be found.
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        if let Some(text) = value.as_str() {
            let judgment = strip_code_fences(text).trim().to_string();
            if judgment.is_empty() {
                return None;
            }
            return Some(Self {
                judgment,
                proof: None,
                page: None,
            });
        }

        let obj = value.as_object()?;
        // The upstream coach nests its verdict under "guidance".
        let body = obj
            .get("guidance")
            .and_then(|g| g.as_object())
            .unwrap_or(obj);

        let judgment = body
            .get("judgment")
            .or_else(|| body.get("message"))
            .and_then(|v| v.as_str())
            .map(|s| strip_code_fences(s).trim().to_string())
            .filter(|s| !s.is_empty())?;

        let proof = body
            .get("proof")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let page = body
            .get("page")
            .or_else(|| body.get("current_page"))
            .and_then(|v| v.as_str())
            .map(String::from);

        Some(Self {
            judgment,
            proof,
            page,
        })
    }
}

/// Outcome of evaluating one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionDecision {
    /// Nothing advances; the judgment is user-facing feedback only.
    NoChange,
    /// Mark the sub-unit at `index` done, recording `proof`.
    AdvanceSubUnit { index: usize, proof: Option<String> },
    /// Complete the current step (all sub-units already done, or none).
    AdvanceStep,
}

/// The proof-gated decision function.
#[derive(Debug, Clone, Copy)]
pub struct Heuristic {
    /// Minimum length of a proof field for it to count as non-trivial.
    pub min_proof_len: usize,
}

impl Default for Heuristic {
    fn default() -> Self {
        Self { min_proof_len: 12 }
    }
}

impl Heuristic {
    pub fn new(min_proof_len: usize) -> Self {
        Self { min_proof_len }
    }

    /// Evaluate one observation against the run's current step.
    ///
    /// Returns at most one advancement per call. Never panics on bad input —
    /// anything that fails a gate is `NoChange`.
    pub fn evaluate(&self, run: &Run, observation: &Observation) -> CompletionDecision {
        let Some(step) = ledger::next_pending_step(run) else {
            debug!(participant = %run.participant_key, "Observation for a fully completed run");
            return CompletionDecision::NoChange;
        };

        if step.all_sub_units_done() {
            // Step-level confirmation path. Only reachable once every
            // sub-unit is done (or the step declares none) — it never
            // bypasses sub-unit gating.
            if strong_completion(&observation.judgment, &step.keywords) {
                return CompletionDecision::AdvanceStep;
            }
            return CompletionDecision::NoChange;
        }

        // Gate 1: only the first not-done sub-unit is eligible.
        let Some(index) = step.first_open_sub_unit() else {
            return CompletionDecision::NoChange;
        };
        let unit = &step.sub_units[index];

        // Gate 2: strong-completion judgment referencing this unit of work.
        let keywords = if unit.keywords.is_empty() {
            &step.keywords
        } else {
            &unit.keywords
        };
        if !strong_completion(&observation.judgment, keywords) {
            return CompletionDecision::NoChange;
        }

        // Gate 3: non-trivial proof.
        let field_proof = observation
            .proof
            .as_deref()
            .map(str::trim)
            .filter(|p| p.len() >= self.min_proof_len);
        let marker_proof = PROOF_MARKER_RE.is_match(&observation.judgment);
        if field_proof.is_none() && !marker_proof {
            return CompletionDecision::NoChange;
        }

        // Recent-window dedup: a proof already recorded on a done sub-unit of
        // this step advances nothing a second time.
        let proof = field_proof
            .map(String::from)
            .unwrap_or_else(|| observation.judgment.clone());
        let duplicate = step
            .sub_units
            .iter()
            .filter(|u| u.done)
            .any(|u| u.proof.as_deref() == Some(proof.as_str()));
        if duplicate {
            debug!(
                participant = %run.participant_key,
                step_id = step.id,
                "Duplicate proof, no advancement"
            );
            return CompletionDecision::NoChange;
        }

        // Gate 4 holds by construction: one sub-unit, one call.
        CompletionDecision::AdvanceSubUnit {
            index,
            proof: Some(proof),
        }
    }
}

/// Strict "strong completion" pattern: an affirmation token co-occurring with
/// a reference to the unit of work, or an explicit completion token paired
/// with emphasis.
fn strong_completion(judgment: &str, keywords: &[String]) -> bool {
    let affirmed = AFFIRMATION_RE.is_match(judgment) && references(judgment, keywords);
    let completed = COMPLETION_RE.is_match(judgment) && has_emphasis(judgment);
    affirmed || completed
}

fn references(judgment: &str, keywords: &[String]) -> bool {
    let lower = judgment.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

fn has_emphasis(judgment: &str) -> bool {
    judgment.contains('!')
        || judgment
            .split_whitespace()
            .any(|w| w.len() >= 3 && w.chars().all(|c| c.is_ascii_uppercase()))
}

/// Strip markdown code fences the upstream evaluator sometimes wraps its
/// output in.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json").or_else(|| trimmed.strip_prefix("```")) {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}
