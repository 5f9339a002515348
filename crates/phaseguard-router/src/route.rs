//! Outcome application and forward settling.
//!
//! [`route`] is a pure function: it takes the current state and an optional
//! gate outcome and returns the next state. Applying the same outcome twice,
//! or routing a settled state again, returns an unchanged state.

use serde::Serialize;

use phaseguard_gate::GateOutcome;
use phaseguard_reason::{Category, ReasonCode, ReasonPayload, payload_of};
use phaseguard_state::{ReviewStatus, SessionState, Transition, TransitionKind};
use phaseguard_utils::logging::log_decision;
use phaseguard_utils::types::{GateName, GateStatus, PhaseId, PhaseKind};

/// The state a routing call produced, and what it did to get there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub state: SessionState,
    /// Transitions appended by this call, in order
    pub transitions: Vec<Transition>,
    /// Phase token or blocking code, mirrors `state.next`
    pub next: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<(ReasonCode, ReasonPayload)>,
    /// Whether the supplied outcome was applied or ignored as stale
    pub outcome_applied: bool,
    pub state_unchanged: bool,
}

impl RouteDecision {
    pub(crate) fn from_states(
        before: &SessionState,
        state: SessionState,
        reason: Option<(ReasonCode, ReasonPayload)>,
        outcome_applied: bool,
    ) -> Self {
        let transitions = state
            .transitions
            .get(before.transitions.len()..)
            .map(<[Transition]>::to_vec)
            .unwrap_or_default();
        let state_unchanged = state == *before;
        Self {
            next: state.next.clone(),
            transitions,
            reason,
            outcome_applied,
            state_unchanged,
            state,
        }
    }
}

/// What the current phase allows.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Advance(TransitionKind),
    Wait(&'static str),
    Block(ReasonCode, ReasonPayload),
}

/// Apply `outcome` (if it is current) and advance as far as preconditions allow.
#[must_use]
pub fn route(current: &SessionState, outcome: Option<&GateOutcome>) -> RouteDecision {
    let mut state = current.clone();
    let applied = outcome.is_some_and(|o| apply_outcome(&mut state, o));
    let reason = settle(&mut state);

    if let Some(key) = state.key() {
        log_decision(
            &key,
            state.current_phase(),
            state.current_phase().gate().map(|g| g.as_str()),
            reason.as_ref().map(|(code, _)| code.as_str()),
        );
    }
    RouteDecision::from_states(current, state, reason, applied)
}

/// Apply an outcome for the current gate and iteration. Anything else is a
/// stale outcome and leaves the state alone.
fn apply_outcome(state: &mut SessionState, outcome: &GateOutcome) -> bool {
    let phase = state.current_phase();
    let gate = outcome.gate;
    if phase.gate() != Some(gate) {
        tracing::debug!(gate = gate.as_str(), phase = phase.as_str(), "outcome for another phase ignored");
        return false;
    }
    let recorded = recorded_iteration(state, gate);
    let status = state.gate_status(gate);
    if outcome.iteration != recorded
        || matches!(status, GateStatus::Approved | GateStatus::NeedsHuman | GateStatus::NotApplicable)
    {
        tracing::debug!(
            gate = gate.as_str(),
            outcome_iteration = outcome.iteration,
            recorded,
            status = status.as_str(),
            "stale gate outcome ignored"
        );
        return false;
    }
    // a pending outcome records why claims are unverified without spending an iteration
    if outcome.status == GateStatus::NotApplicable {
        return false;
    }

    for (claim_id, resolution) in &outcome.resolutions {
        if let Some(entry) = state.build_evidence.claims.get_mut(claim_id) {
            if let Some(id) = &resolution.evidence_id
                && !entry.evidence_ids.contains(id)
            {
                entry.evidence_ids.push(id.clone());
            }
            entry.resolution = Some(resolution.clone());
        }
    }
    for (code, payload) in &outcome.resolution_payloads {
        state
            .diagnostics
            .reason_payloads
            .insert(code.as_str().to_string(), payload.clone());
    }
    for id in &outcome.evidence_ids {
        if !state.build_evidence.evidence_ids.contains(id) {
            state.build_evidence.evidence_ids.push(id.clone());
        }
    }
    if let Some(feedback) = &outcome.feedback {
        state.phase5_review.plan_version = feedback.plan_version;
        state.phase5_review.history.push(feedback.clone());
    }

    let record = state.gate_mut(gate);
    for id in &outcome.evidence_ids {
        if !record.evidence_ids.contains(id) {
            record.evidence_ids.push(id.clone());
        }
    }
    record.status = outcome.status;

    match outcome.status {
        GateStatus::Approved => {
            state.clear_reasons(Category::NotVerified);
            if gate == GateName::Architecture {
                state.phase5_review.status = ReviewStatus::Approved;
            }
        }
        GateStatus::Rejected => {
            let next_iteration = outcome.iteration + 1;
            state.gate_mut(gate).iteration = next_iteration;
            if gate == GateName::Architecture {
                state.phase5_review.iteration = next_iteration;
            }
            let authoring = phase.authoring_phase().unwrap_or(phase);
            state.transitions.push(Transition {
                from: phase,
                to: authoring,
                kind: TransitionKind::ReturnToAuthoring,
                gate: Some(gate),
                iteration: Some(next_iteration),
                authorization: None,
            });
        }
        GateStatus::NeedsHuman => {
            if gate == GateName::Architecture {
                state.phase5_review.status = ReviewStatus::EscalatedToHuman;
            }
            state.transitions.push(Transition {
                from: phase,
                to: phase,
                kind: TransitionKind::EscalateToHuman,
                gate: Some(gate),
                iteration: Some(outcome.iteration),
                authorization: None,
            });
        }
        GateStatus::Pending | GateStatus::NotApplicable => {}
    }
    tracing::info!(
        gate = gate.as_str(),
        iteration = outcome.iteration,
        status = outcome.status.as_str(),
        "gate outcome applied"
    );
    true
}

fn recorded_iteration(state: &SessionState, gate: GateName) -> u32 {
    if gate == GateName::Architecture {
        state.phase5_review.iteration
    } else {
        state.gates.get(&gate).map_or(1, |g| g.iteration)
    }
}

/// Advance from the current phase until a precondition stops the run.
pub(crate) fn settle(state: &mut SessionState) -> Option<(ReasonCode, ReasonPayload)> {
    loop {
        let phase = state.current_phase();
        match step(state, phase) {
            Step::Advance(kind) => {
                let Some(to) = phase.successor() else {
                    state.unblock_to(phase.token());
                    return None;
                };
                enter(state, phase, to, kind);
            }
            Step::Wait(token) => {
                state.unblock_to(token);
                state.prune_payloads();
                return None;
            }
            Step::Block(code, payload) => {
                state.clear_reasons(Category::Blocked);
                state.block(code, payload.clone());
                state.prune_payloads();
                return Some((code, payload));
            }
        }
    }
}

pub(crate) fn enter(state: &mut SessionState, from: PhaseId, to: PhaseId, kind: TransitionKind) {
    if kind == TransitionKind::NotApplicable
        && let Some(gate) = from.gate()
    {
        state.gate_mut(gate).status = GateStatus::NotApplicable;
    }
    tracing::debug!(from = from.as_str(), to = to.as_str(), ?kind, "phase transition");
    state.transitions.push(Transition {
        from,
        to,
        kind,
        gate: from.gate(),
        iteration: None,
        authorization: None,
    });
    state.phase = to.into();
}

/// What `phase` allows given `state`. Never mutates.
pub(crate) fn step(state: &SessionState, phase: PhaseId) -> Step {
    match phase.kind() {
        PhaseKind::Terminal => Step::Wait(phase.token()),
        PhaseKind::Plain | PhaseKind::Authoring => artifacts_step(state, phase),
        PhaseKind::Conditional => match applicable(state, phase) {
            Ok(false) => Step::Advance(TransitionKind::NotApplicable),
            Ok(true) => artifacts_step(state, phase),
            Err(blocked) => blocked,
        },
        PhaseKind::Gated => {
            let Some(gate) = phase.gate() else {
                return Step::Wait(phase.token());
            };
            match applicable(state, phase) {
                Ok(false) => return Step::Advance(TransitionKind::NotApplicable),
                Ok(true) => {}
                Err(blocked) => return blocked,
            }
            match state.gate_status(gate) {
                GateStatus::Approved | GateStatus::NotApplicable => artifacts_step(state, phase),
                GateStatus::Pending => Step::Wait(phase.token()),
                GateStatus::Rejected => {
                    Step::Wait(phase.authoring_phase().unwrap_or(phase).token())
                }
                GateStatus::NeedsHuman => Step::Block(
                    ReasonCode::EscalatedToHuman,
                    payload_of([
                        ("gate", gate.as_str().to_string()),
                        ("iteration", recorded_iteration(state, gate).to_string()),
                    ]),
                ),
            }
        }
    }
}

fn artifacts_step(state: &SessionState, phase: PhaseId) -> Step {
    if phase.required_artifacts().iter().all(|a| state.has_artifact(a)) {
        Step::Advance(TransitionKind::Advance)
    } else {
        Step::Wait(phase.token())
    }
}

/// `Ok(true)` for phases without a signal. An unrecorded signal blocks.
fn applicable(state: &SessionState, phase: PhaseId) -> Result<bool, Step> {
    let Some(signal) = phase.applicability() else {
        return Ok(true);
    };
    state.applicability.get(signal.as_str()).copied().ok_or_else(|| {
        Step::Block(
            ReasonCode::MissingEvidence,
            payload_of([("claim_id", signal.as_str())]),
        )
    })
}
