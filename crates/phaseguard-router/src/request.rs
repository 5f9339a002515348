//! Explicit phase requests.
//!
//! Forward requests must satisfy every intermediate precondition. Backward
//! requests need a [`RollbackAuthorization`] and are recorded as a rollback
//! transition; they reset the gates at or after the target.

use phaseguard_state::{ReviewStatus, RollbackAuthorization, SessionState, Transition, TransitionKind};
use phaseguard_utils::types::{GateName, PhaseId};

use crate::error::RouterError;
use crate::route::{RouteDecision, Step, enter, step};

/// Move the run to `target`, or refuse without touching `current`.
pub fn request_phase(
    current: &SessionState,
    target: PhaseId,
    authorization: Option<&RollbackAuthorization>,
) -> Result<RouteDecision, RouterError> {
    let from = current.current_phase();
    let mut state = current.clone();

    if target < from {
        let Some(auth) = authorization else {
            return Err(RouterError::MonotonicityViolation {
                current: from,
                requested: target,
            });
        };
        if auth.target != target
            || auth.authorized_by.trim().is_empty()
            || auth.reason.trim().is_empty()
        {
            return Err(RouterError::RollbackNotAuthorized { target });
        }
        rollback(&mut state, from, target, auth);
    } else if target > from {
        let mut phase = from;
        while phase < target {
            let Step::Advance(kind) = step(&state, phase) else {
                return Err(RouterError::PhaseMismatch {
                    unsatisfied: phase,
                    requested: target,
                });
            };
            let Some(to) = phase.successor() else { break };
            enter(&mut state, phase, to, kind);
            phase = to;
        }
        state.unblock_to(target.token());
        state.prune_payloads();
    }

    Ok(RouteDecision::from_states(current, state, None, false))
}

fn rollback(state: &mut SessionState, from: PhaseId, target: PhaseId, auth: &RollbackAuthorization) {
    for gate in GateName::ALL {
        if gate.phase() >= target
            && let Some(record) = state.gates.get_mut(&gate)
        {
            record.status = Default::default();
            record.iteration = 1;
            record.evidence_ids.clear();
        }
    }
    for claim in state.build_evidence.claims.values_mut() {
        if claim.gate.phase() >= target {
            claim.resolution = None;
        }
    }
    for phase in PhaseId::ALL.iter().filter(|p| **p >= target) {
        for artifact in phase.required_artifacts() {
            state.artifacts.remove(*artifact);
        }
    }
    if target <= PhaseId::ArchitectureReview {
        let review = &mut state.phase5_review;
        review.iteration = 1;
        review.status = ReviewStatus::InProgress;
        review.plan_version += 1;
    }

    tracing::warn!(
        from = from.as_str(),
        to = target.as_str(),
        authorized_by = %auth.authorized_by,
        "authorized phase rollback"
    );
    state.transitions.push(Transition {
        from,
        to: target,
        kind: TransitionKind::Rollback,
        gate: None,
        iteration: None,
        authorization: Some(auth.clone()),
    });
    state.phase = target.into();
    state.unblock_to(target.token());
    // implement mode is only valid while every upstream gate is approved
    state.mode = state.derived_mode();
    state.prune_payloads();
}
