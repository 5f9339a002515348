//! Evidence-backed gates.
//!
//! Test-quality, business-rules, rollback-safety and implementation-QA are
//! decided only from stored evidence. Narrative text attached to a claim
//! carries no weight: a claim without a matching fresh, trusted, correctly
//! typed record is `NOT_VERIFIED`, and a gate with any unverified claim never
//! approves.
//!
//! A gate whose only problems are missing or stale evidence stays pending:
//! the claims are reported and re-probed, but no iteration is consumed.

use phaseguard_evidence::{Claim, ClaimVerdict, Evidence, FreshnessContext, verify_claim};
use phaseguard_reason::{ReasonCode, payload_of};
use phaseguard_state::{ClaimEntry, ClaimResolution, SessionState};
use phaseguard_utils::types::{GateName, GateStatus, MAX_GATE_ITERATIONS};

use crate::error::GateError;
use crate::outcome::{GateCondition, GateOutcome};

fn to_claim(claim_id: &str, entry: &ClaimEntry) -> Claim {
    Claim {
        claim_id: claim_id.to_string(),
        label: entry.label.clone(),
        kind: entry.kind,
        required_class: entry.required_class,
        evidence_ids: entry.evidence_ids.clone(),
    }
}

fn verdict_evidence(verdict: &ClaimVerdict) -> Option<&str> {
    match verdict {
        ClaimVerdict::Missing { .. } => None,
        ClaimVerdict::Verified { evidence_id, .. }
        | ClaimVerdict::Stale { evidence_id, .. }
        | ClaimVerdict::TypeMismatch { evidence_id, .. }
        | ClaimVerdict::Contradicted { evidence_id, .. }
        | ClaimVerdict::Untrusted { evidence_id, .. } => Some(evidence_id),
    }
}

/// Evaluate an evidence-backed gate for the current phase.
pub fn evaluate_evidence_gate(
    state: &SessionState,
    gate: GateName,
    records: &[Evidence],
    ctx: &FreshnessContext,
) -> Result<GateOutcome, GateError> {
    if gate == GateName::Architecture {
        return Err(GateError::NotEvidenceBacked { gate });
    }
    let phase = state.current_phase();
    if phase != gate.phase() {
        return Err(GateError::WrongPhase { gate, phase });
    }
    let iteration = state.gates.get(&gate).map_or(1, |g| g.iteration);
    if state.gate_status(gate) == GateStatus::NeedsHuman {
        return Err(GateError::AwaitingHuman { gate, iteration });
    }

    let mut outcome = GateOutcome::new(gate, iteration);
    // issues that only new or fresher evidence can clear
    let mut awaiting_evidence = 0usize;
    let claims: Vec<(&String, &ClaimEntry)> = state
        .build_evidence
        .claims
        .iter()
        .filter(|(_, entry)| entry.gate == gate)
        .collect();

    if claims.is_empty() {
        outcome
            .issues
            .push(format!("no claims are registered for {gate}"));
        outcome.offer_reason(
            ReasonCode::MissingEvidence,
            payload_of([("claim_id", gate.as_str())]),
        );
    }

    for (claim_id, entry) in claims {
        let verdict = verify_claim(&to_claim(claim_id, entry), records, ctx);
        let evidence_id = verdict_evidence(&verdict).map(str::to_string);
        outcome.conditions.push(GateCondition::check(
            format!("claim {claim_id}"),
            verdict.is_verified(),
            verdict
                .reason_code()
                .map_or("verified", |c| c.as_str()),
            "verified",
        ));

        match verdict.reason_code() {
            None => {
                if let Some(id) = &evidence_id {
                    outcome.evidence_ids.push(id.clone());
                }
                outcome.resolutions.insert(
                    claim_id.clone(),
                    ClaimResolution {
                        verified: true,
                        reason_code: None,
                        evidence_id,
                    },
                );
            }
            Some(code) => {
                let payload = verdict.payload();
                outcome.issues.push(format!("{code}: {claim_id}"));
                if matches!(code, ReasonCode::NotVerifiedMissingEvidence | ReasonCode::EvidenceStale) {
                    awaiting_evidence += 1;
                }
                if let Some(reprobe) = verdict.reprobe() {
                    outcome.reprobe.push(reprobe.clone());
                }
                outcome.resolutions.insert(
                    claim_id.clone(),
                    ClaimResolution {
                        verified: false,
                        reason_code: Some(code.as_str().to_string()),
                        evidence_id,
                    },
                );
                outcome.resolution_payloads.insert(code, payload.clone());
                outcome.offer_reason(code, payload);
            }
        }
    }

    if gate == GateName::ImplementationQa {
        for upstream in gate.upstream() {
            let status = state.gate_status(upstream);
            let allowed = status.is_allowed_upstream();
            outcome.conditions.push(GateCondition::check(
                format!("upstream {upstream}"),
                allowed,
                status.as_str(),
                "approved or not-applicable",
            ));
            if !allowed {
                outcome
                    .issues
                    .push(format!("upstream gate {upstream} is {status}"));
                outcome.offer_reason(
                    ReasonCode::UpstreamGateNotApproved,
                    payload_of([
                        ("gate", gate.as_str()),
                        ("upstream_gate", upstream.as_str()),
                        ("status", status.as_str()),
                    ]),
                );
            }
        }
    }

    if let Some(artifacts) = state.gate_artifacts.get(&gate) {
        for artifact in artifacts.missing() {
            outcome
                .issues
                .push(format!("gate artifact '{artifact}' is missing"));
            outcome.offer_reason(
                ReasonCode::GateArtifactMissing,
                payload_of([("gate", gate.as_str()), ("artifact", artifact)]),
            );
        }
    }

    outcome.status = if outcome.issues.is_empty() {
        GateStatus::Approved
    } else if awaiting_evidence == outcome.issues.len() {
        GateStatus::Pending
    } else if iteration < MAX_GATE_ITERATIONS {
        GateStatus::Rejected
    } else {
        outcome.reason_code = None;
        outcome.offer_reason(
            ReasonCode::EscalatedToHuman,
            payload_of([("gate", gate.as_str().to_string()), ("iteration", iteration.to_string())]),
        );
        GateStatus::NeedsHuman
    };

    tracing::info!(
        gate = gate.as_str(),
        iteration,
        status = outcome.status.as_str(),
        reason_code = outcome.reason_code.map(|c| c.as_str()),
        reprobe = outcome.reprobe.len(),
        "evidence gate evaluated"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use phaseguard_evidence::{ClaimKind, EvidenceClass, RepoIdentity};
    use phaseguard_state::{GateArtifacts, Presence};
    use phaseguard_utils::test_support::{fixed_now, test_key};
    use phaseguard_utils::types::PhaseId;
    use serde_json::json;

    fn ctx() -> FreshnessContext {
        FreshnessContext::starting_now(fixed_now(), fixed_now() - Duration::hours(2))
    }

    fn at(phase: PhaseId) -> SessionState {
        let identity = RepoIdentity {
            repo_fingerprint: test_key().repo_fingerprint,
            repo_root: None,
        };
        let mut state = SessionState::new(&test_key(), &identity, "id-1", fixed_now());
        state.phase = phase.into();
        state
    }

    fn claim(state: &mut SessionState, id: &str, label: &str, gate: GateName) {
        state.build_evidence.claims.insert(
            id.to_string(),
            ClaimEntry {
                label: label.to_string(),
                kind: ClaimKind::TestsPass,
                required_class: EvidenceClass::GateEvidence,
                gate,
                evidence_ids: Vec::new(),
                resolution: None,
            },
        );
    }

    fn test_run(id: &str, claim_id: &str, failed: u32, age_hours: i64) -> Evidence {
        let exit_code = i32::from(failed != 0);
        Evidence::seal(
            id,
            EvidenceClass::GateEvidence,
            fixed_now() - Duration::hours(age_hours),
            json!({"claim_id": claim_id, "kind": "test_run", "passed": 12, "failed": failed, "skipped": 0, "exit_code": exit_code}),
        )
        .unwrap()
    }

    #[test]
    fn test_claim_without_evidence_is_not_verified() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &[], &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Pending);
        assert_eq!(out.reason_code, Some(ReasonCode::NotVerifiedMissingEvidence));
        let resolution = &out.resolutions["tests-green"];
        assert!(!resolution.verified);
        assert_eq!(
            resolution.reason_code.as_deref(),
            Some("NOT_VERIFIED-MISSING-EVIDENCE")
        );
        assert!(out.resolution_payloads.contains_key(&ReasonCode::NotVerifiedMissingEvidence));
    }

    #[test]
    fn test_fresh_passing_run_approves() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        let records = [test_run("ev-1", "tests-green", 0, 1)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert!(out.is_approved());
        assert_eq!(out.evidence_ids, vec!["ev-1"]);
    }

    #[test]
    fn test_stale_run_requests_reprobe() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        let records = [test_run("ev-old", "tests-green", 0, 30)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Pending);
        assert_eq!(out.reason_code, Some(ReasonCode::EvidenceStale));
        assert_eq!(out.reprobe.len(), 1);
        assert_eq!(out.reprobe[0].previous_evidence_id, "ev-old");
    }

    #[test]
    fn test_failing_run_contradicts() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        let records = [test_run("ev-1", "tests-green", 2, 1)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.reason_code, Some(ReasonCode::EvidenceContradicts));
    }

    #[test]
    fn test_missing_evidence_never_escalates() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        state.gate_mut(GateName::TestQuality).iteration = 3;
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &[], &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Pending);
        assert_eq!(out.iteration, 3);
        assert_eq!(out.reason_code, Some(ReasonCode::NotVerifiedMissingEvidence));
    }

    #[test]
    fn test_missing_evidence_next_to_a_real_failure_rejects() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        claim(&mut state, "suite-green", "suite green", GateName::TestQuality);
        let records = [test_run("ev-1", "tests-green", 2, 1)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.resolutions.len(), 2);
    }

    #[test]
    fn test_gate_without_claims_never_approves() {
        let state = at(PhaseId::RollbackSafety);
        let out = evaluate_evidence_gate(&state, GateName::RollbackSafety, &[], &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.reason_code, Some(ReasonCode::MissingEvidence));
    }

    #[test]
    fn test_missing_artifact_blocks_approval() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        let mut artifacts = GateArtifacts::default();
        artifacts.provided.insert("coverage-report".to_string(), Presence::Missing);
        state.gate_artifacts.insert(GateName::TestQuality, artifacts);
        let records = [test_run("ev-1", "tests-green", 0, 1)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::Rejected);
        assert_eq!(out.reason_code, Some(ReasonCode::GateArtifactMissing));
    }

    #[test]
    fn test_implementation_qa_checks_upstream() {
        let mut state = at(PhaseId::Implementation);
        claim(&mut state, "build-ok", "build ok", GateName::ImplementationQa);
        state.build_evidence.claims.get_mut("build-ok").unwrap().kind = ClaimKind::BuildSucceeds;
        let build = Evidence::seal(
            "ev-b",
            EvidenceClass::GateEvidence,
            fixed_now(),
            json!({"claim_id": "build-ok", "kind": "build", "exit_code": 0}),
        )
        .unwrap();
        let out =
            evaluate_evidence_gate(&state, GateName::ImplementationQa, &[build.clone()], &ctx()).unwrap();
        assert_eq!(out.reason_code, Some(ReasonCode::UpstreamGateNotApproved));

        for g in [GateName::Architecture, GateName::TestQuality, GateName::RollbackSafety] {
            state.gate_mut(g).status = GateStatus::Approved;
        }
        state.gate_mut(GateName::BusinessRules).status = GateStatus::NotApplicable;
        let out = evaluate_evidence_gate(&state, GateName::ImplementationQa, &[build], &ctx()).unwrap();
        assert!(out.is_approved());
    }

    #[test]
    fn test_third_failure_needs_human() {
        let mut state = at(PhaseId::TestQuality);
        claim(&mut state, "tests-green", "tests green", GateName::TestQuality);
        state.gate_mut(GateName::TestQuality).iteration = 3;
        let records = [test_run("ev-1", "tests-green", 2, 1)];
        let out = evaluate_evidence_gate(&state, GateName::TestQuality, &records, &ctx()).unwrap();
        assert_eq!(out.status, GateStatus::NeedsHuman);
        assert_eq!(out.reason_code, Some(ReasonCode::EscalatedToHuman));
        // the claim itself still records why it failed
        assert!(out.resolution_payloads.contains_key(&ReasonCode::EvidenceContradicts));
    }

    #[test]
    fn test_architecture_is_not_evidence_backed() {
        let state = at(PhaseId::ArchitectureReview);
        assert!(matches!(
            evaluate_evidence_gate(&state, GateName::Architecture, &[], &ctx()),
            Err(GateError::NotEvidenceBacked { .. })
        ));
    }
}
