//! Iterative architecture review.
//!
//! Each submitted review consumes one iteration slot of a bounded loop.
//! Precedence, highest first:
//!
//! 1. escalation requested, or any open question: `needs-human`
//! 2. no issues and every approval precondition holds: `approved`
//! 3. issues below the iteration cap: `rejected`
//! 4. issues at the cap: `needs-human`
//!
//! Unmet approval preconditions (a missing gate artifact, no approved
//! architecture decision) are reported as issues, so they follow rules 3 and 4.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use phaseguard_reason::{ReasonCode, payload_of};
use phaseguard_state::{
    ArchitectureDecision, Presence, ReviewFeedback, ReviewStatus, SessionState,
};
use phaseguard_utils::types::{GateName, GateStatus, PhaseId};

use crate::error::GateError;
use crate::outcome::{GateCondition, GateOutcome};

/// Reviewer feedback for one iteration, as submitted by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewInput {
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    /// Reviewer asks for a human decision regardless of issues
    #[serde(default)]
    pub escalate: bool,
    /// Version of the plan under review; defaults to the recorded one
    #[serde(default)]
    pub plan_version: Option<u32>,
    /// Decisions to record before evaluating
    #[serde(default)]
    pub decisions: Vec<ArchitectureDecision>,
    /// Gate artifacts to record before evaluating
    #[serde(default)]
    pub artifacts: BTreeMap<String, Presence>,
}

fn non_blank(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Evaluate one architecture review against `state`.
///
/// `state` must already carry the decisions and artifacts from `review`.
pub fn evaluate_architecture(
    state: &SessionState,
    review: &ReviewInput,
) -> Result<GateOutcome, GateError> {
    let gate = GateName::Architecture;
    let phase = state.current_phase();
    if phase != PhaseId::ArchitectureReview {
        return Err(GateError::WrongPhase { gate, phase });
    }
    let loop_state = &state.phase5_review;
    if loop_state.status == ReviewStatus::EscalatedToHuman
        || state.gate_status(gate) == GateStatus::NeedsHuman
    {
        return Err(GateError::AwaitingHuman {
            gate,
            iteration: loop_state.iteration,
        });
    }

    let iteration = loop_state.iteration;
    let cap = loop_state.max_iterations;
    let mut outcome = GateOutcome::new(gate, iteration);
    outcome.issues = non_blank(&review.issues);
    outcome.suggestions = non_blank(&review.suggestions);
    outcome.questions = non_blank(&review.questions);

    let missing: Vec<String> = state
        .gate_artifacts
        .get(&gate)
        .map(|a| a.missing().into_iter().map(str::to_string).collect())
        .unwrap_or_default();
    outcome.conditions.push(GateCondition::check(
        "gate artifacts provided",
        missing.is_empty(),
        if missing.is_empty() { "all present".to_string() } else { format!("missing {}", missing.join(", ")) },
        "all present",
    ));
    let has_decision = state.has_approved_decision();
    outcome.conditions.push(GateCondition::check(
        "approved architecture decision",
        has_decision,
        has_decision.to_string(),
        "true",
    ));
    outcome.conditions.push(GateCondition::check(
        "iteration within cap",
        iteration <= cap,
        iteration.to_string(),
        format!("<= {cap}"),
    ));

    let human_reason = || {
        (
            ReasonCode::EscalatedToHuman,
            payload_of([("gate", gate.as_str().to_string()), ("iteration", iteration.to_string())]),
        )
    };

    if review.escalate || !outcome.questions.is_empty() {
        outcome.status = GateStatus::NeedsHuman;
        let (code, payload) = human_reason();
        outcome.offer_reason(code, payload);
    } else {
        if outcome.issues.is_empty() {
            if let Some(artifact) = missing.first() {
                outcome.issues.push(format!("gate artifact '{artifact}' is missing"));
                outcome.offer_reason(
                    ReasonCode::GateArtifactMissing,
                    payload_of([("gate", gate.as_str()), ("artifact", artifact.as_str())]),
                );
            }
            if !has_decision {
                outcome
                    .issues
                    .push("no architecture decision has been approved".to_string());
                outcome.offer_reason(
                    ReasonCode::ArchitectureDecisionMissing,
                    payload_of([("gate", gate.as_str())]),
                );
            }
        }
        outcome.status = if outcome.issues.is_empty() {
            GateStatus::Approved
        } else if iteration < cap {
            GateStatus::Rejected
        } else {
            let (code, payload) = human_reason();
            outcome.reason_code = None;
            outcome.offer_reason(code, payload);
            GateStatus::NeedsHuman
        };
    }

    outcome.feedback = Some(ReviewFeedback {
        iteration,
        plan_version: review.plan_version.unwrap_or(loop_state.plan_version),
        status: outcome.status,
        issues: outcome.issues.clone(),
        suggestions: outcome.suggestions.clone(),
        questions: outcome.questions.clone(),
        escalated: review.escalate,
    });

    tracing::info!(
        gate = gate.as_str(),
        iteration,
        status = outcome.status.as_str(),
        issues = outcome.issues.len(),
        "architecture review evaluated"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseguard_evidence::RepoIdentity;
    use phaseguard_state::{DecisionStatus, GateArtifacts};
    use phaseguard_utils::test_support::{fixed_now, test_key};

    fn in_review() -> SessionState {
        let identity = RepoIdentity {
            repo_fingerprint: test_key().repo_fingerprint,
            repo_root: None,
        };
        let mut state = SessionState::new(&test_key(), &identity, "id-1", fixed_now());
        state.phase = PhaseId::ArchitectureReview.into();
        state.architecture_decisions.push(ArchitectureDecision {
            id: "ADR-1".to_string(),
            title: "Single writer".to_string(),
            status: DecisionStatus::Approved,
        });
        state
    }

    fn issues(list: &[&str]) -> ReviewInput {
        ReviewInput {
            issues: list.iter().map(|s| s.to_string()).collect(),
            ..ReviewInput::default()
        }
    }

    #[test]
    fn test_issues_reject_below_cap() {
        let out = evaluate_architecture(&in_review(), &issues(&["missing test coverage"])).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.iteration, 1);
        let feedback = out.feedback.unwrap();
        assert_eq!(feedback.issues, vec!["missing test coverage"]);
        assert_eq!(feedback.plan_version, 1);
    }

    #[test]
    fn test_clean_review_approves() {
        let out = evaluate_architecture(&in_review(), &issues(&[])).unwrap();
        assert!(out.is_approved());
        assert!(out.reason_code.is_none());
        assert!(out.conditions.iter().all(|c| c.passed));
    }

    #[test]
    fn test_questions_and_escalation_need_human() {
        let mut review = issues(&[]);
        review.questions = vec!["Which queue?".to_string()];
        let out = evaluate_architecture(&in_review(), &review).unwrap();
        assert_eq!(out.status, GateStatus::NeedsHuman);
        assert_eq!(out.reason_code, Some(ReasonCode::EscalatedToHuman));

        let review = ReviewInput {
            escalate: true,
            ..issues(&["x"])
        };
        let out = evaluate_architecture(&in_review(), &review).unwrap();
        assert_eq!(out.status, GateStatus::NeedsHuman);
    }

    #[test]
    fn test_blank_questions_are_ignored() {
        let mut review = issues(&[]);
        review.questions = vec!["  ".to_string()];
        assert!(evaluate_architecture(&in_review(), &review).unwrap().is_approved());
    }

    #[test]
    fn test_cap_turns_rejection_into_needs_human() {
        let mut state = in_review();
        state.phase5_review.iteration = 3;
        let out = evaluate_architecture(&state, &issues(&["still wrong"])).unwrap();
        assert_eq!(out.status, GateStatus::NeedsHuman);
        assert_eq!(out.payload["iteration"], "3");
    }

    #[test]
    fn test_approval_needs_decision_and_artifacts() {
        let mut state = in_review();
        state.architecture_decisions.clear();
        let out = evaluate_architecture(&state, &issues(&[])).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.reason_code, Some(ReasonCode::ArchitectureDecisionMissing));

        let mut state = in_review();
        let mut artifacts = GateArtifacts::default();
        artifacts.provided.insert("threat-model".to_string(), Presence::Missing);
        state.gate_artifacts.insert(GateName::Architecture, artifacts);
        let out = evaluate_architecture(&state, &issues(&[])).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.reason_code, Some(ReasonCode::GateArtifactMissing));
        assert_eq!(out.payload["artifact"], "threat-model");
    }

    #[test]
    fn test_refuses_outside_phase_or_when_escalated() {
        let mut state = in_review();
        state.phase = PhaseId::Planning.into();
        assert!(matches!(
            evaluate_architecture(&state, &issues(&[])),
            Err(GateError::WrongPhase { .. })
        ));

        let mut state = in_review();
        state.phase5_review.status = ReviewStatus::EscalatedToHuman;
        assert!(matches!(
            evaluate_architecture(&state, &issues(&[])),
            Err(GateError::AwaitingHuman { iteration: 1, .. })
        ));
    }
}
