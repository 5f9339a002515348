//! Phase routing.
//!
//! The router owns phase movement. [`route`] applies a gate outcome and moves
//! forward while preconditions hold; [`request_phase`] handles explicit jumps
//! and authorized rollbacks. Both are pure and leave the input state alone.

pub mod error;
pub mod request;
pub mod route;

pub use error::RouterError;
pub use request::request_phase;
pub use route::{RouteDecision, route};

#[cfg(test)]
mod proptests {
    use super::*;
    use phaseguard_evidence::RepoIdentity;
    use phaseguard_gate::GateOutcome;
    use phaseguard_state::SessionState;
    use phaseguard_utils::test_support::{fixed_now, proptest_cases, test_key};
    use phaseguard_utils::types::{GateName, GateStatus, PhaseId};
    use proptest::prelude::*;

    const ARTIFACTS: [&str; 7] = [
        "repo_signals",
        "repo_map",
        "decision_pack",
        "api_inventory",
        "api_validation",
        "plan",
        "change_set",
    ];

    #[derive(Debug, Clone, Copy)]
    enum Action {
        Artifact(usize),
        Signal(usize, bool),
        Outcome(usize, usize, u32),
        Request(usize),
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            (0..ARTIFACTS.len()).prop_map(Action::Artifact),
            (0usize..2, any::<bool>()).prop_map(|(i, b)| Action::Signal(i, b)),
            (0..GateName::ALL.len(), 0usize..3, 1u32..4).prop_map(|(g, s, i)| Action::Outcome(g, s, i)),
            (0..PhaseId::ALL.len()).prop_map(Action::Request),
        ]
    }

    fn outcome(gate: GateName, status: GateStatus, iteration: u32) -> GateOutcome {
        serde_json::from_value(serde_json::json!({
            "gate": gate,
            "status": status,
            "iteration": iteration,
            "issues": [],
            "suggestions": [],
            "questions": [],
            "conditions": [],
        }))
        .unwrap()
    }

    fn fresh() -> SessionState {
        let identity = RepoIdentity {
            repo_fingerprint: test_key().repo_fingerprint,
            repo_root: None,
        };
        let mut state = SessionState::new(&test_key(), &identity, "id-1", fixed_now());
        state.architecture_decisions.push(phaseguard_state::ArchitectureDecision {
            id: "ADR-1".to_string(),
            title: "t".to_string(),
            status: phaseguard_state::DecisionStatus::Approved,
        });
        state
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(64)))]

        /// Without a rollback authorization, the phase ordinal never decreases,
        /// and routing a settled state again changes nothing.
        #[test]
        fn prop_phase_is_monotonic_and_routing_idempotent(actions in prop::collection::vec(action(), 1..40)) {
            let mut state = route(&fresh(), None).state;
            for action in actions {
                let before = state.phase.ordinal;
                let next = match action {
                    Action::Artifact(i) => {
                        let mut s = state.clone();
                        s.artifacts.insert(ARTIFACTS[i].to_string(), true);
                        route(&s, None).state
                    }
                    Action::Signal(i, present) => {
                        let mut s = state.clone();
                        let signal = phaseguard_utils::types::ApplicabilitySignal::ALL[i];
                        s.applicability.insert(signal.as_str().to_string(), present);
                        route(&s, None).state
                    }
                    Action::Outcome(g, s, i) => {
                        let status = [GateStatus::Approved, GateStatus::Rejected, GateStatus::NeedsHuman][s];
                        route(&state, Some(&outcome(GateName::ALL[g], status, i))).state
                    }
                    Action::Request(p) => match request_phase(&state, PhaseId::ALL[p], None) {
                        Ok(decision) => decision.state,
                        Err(_) => state.clone(),
                    },
                };
                prop_assert!(next.phase.ordinal >= before);
                if !matches!(action, Action::Request(_)) {
                    prop_assert!(route(&next, None).state_unchanged);
                }
                state = next;
            }
        }
    }
}
