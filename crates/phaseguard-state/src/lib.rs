//! Session state for a governed run.
//!
//! [`SessionState`] is the single persisted document per run. The
//! [`SessionRepository`] is the only way it reaches disk: every save runs the
//! full [`invariants::check`] pass, rewrites legacy field names according to
//! the rollout phase and goes through the persistence policy's writer.

pub mod aliases;
pub mod error;
pub mod invariants;
pub mod model;
pub mod repository;

pub use aliases::{AliasPolicy, LEGACY_ALIASES, LegacyAlias, Rewrite};
pub use error::StateError;
pub use invariants::{Invariant, Violation, check_canonical_path};
pub use model::{
    ArchitectureDecision, BuildEvidence, ClaimEntry, ClaimResolution, DecisionStatus,
    DecisionSurface, Diagnostics, GateArtifacts, GateRecord, IntegrityHashes, MigrationEvent,
    Phase5Review, PhaseRef, Presence, ReviewFeedback, ReviewStatus, RollbackAuthorization,
    SCHEMA_VERSION, SessionState, Transition, TransitionKind,
};
pub use repository::{LoadedState, SaveReport, SessionRepository, StateOptions, StateWarning};

#[cfg(test)]
mod proptests {
    use super::*;
    use phaseguard_evidence::RepoIdentity;
    use phaseguard_reason::ReasonRegistry;
    use phaseguard_utils::test_support::{fixed_now, proptest_cases, test_key};
    use phaseguard_utils::types::{CONFIDENCE_THRESHOLD, Mode};
    use proptest::prelude::*;

    fn mode() -> impl Strategy<Value = Mode> {
        prop_oneof![
            Just(Mode::Draft),
            Just(Mode::Standard),
            Just(Mode::Blocked),
            Just(Mode::Architect),
            Just(Mode::Implement),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(64)))]

        /// Confidence rules fire exactly when the mode and level disagree.
        #[test]
        fn prop_confidence_rules(level in -20i64..130, mode in mode()) {
            let registry = ReasonRegistry::builtin().unwrap();
            let identity = RepoIdentity { repo_fingerprint: test_key().repo_fingerprint, repo_root: None };
            let mut state = SessionState::new(&test_key(), &identity, "id-1", fixed_now());
            state.confidence_level = level;
            state.mode = mode;

            let found: Vec<Invariant> = invariants::check(&state, &registry)
                .into_iter()
                .map(|v| v.invariant)
                .collect();
            let low = level < i64::from(CONFIDENCE_THRESHOLD) && !matches!(mode, Mode::Draft | Mode::Blocked);
            prop_assert_eq!(found.contains(&Invariant::LowConfidence), low);
            prop_assert_eq!(found.contains(&Invariant::ConfidenceRange), !(0..=100).contains(&level));
        }

        /// The JCS form of a state reads back to the same state.
        #[test]
        fn prop_canonical_form_reads_back(level in 0i64..=100, next in "[0-7]") {
            let identity = RepoIdentity { repo_fingerprint: test_key().repo_fingerprint, repo_root: None };
            let mut state = SessionState::new(&test_key(), &identity, "id-1", fixed_now());
            state.confidence_level = level;
            state.next = next;
            let text = phaseguard_utils::canonicalization::emit_jcs(&state).unwrap();
            let back: SessionState = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(back, state);
        }
    }
}
