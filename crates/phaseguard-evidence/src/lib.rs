//! Evidence records, freshness and claim verification.
//!
//! Every claim the engine accepts (tests passed, build succeeded, operator
//! confirmed) must be backed by a stored [`Evidence`] record that is
//! untampered, of the right class and still fresh.

pub mod claim;
pub mod error;
pub mod record;
pub mod store;
pub mod verify;

pub use claim::{Claim, ClaimKind, RunResult, slug};
pub use error::EvidenceError;
pub use record::{
    Evidence, EvidenceClass, FUTURE_SKEW_TOLERANCE_SECS, Freshness, FreshnessContext, RepoIdentity,
    Ttl,
};
pub use store::EvidenceStore;
pub use verify::{ClaimVerdict, ReprobeRequest, verify_claim};

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::Duration;
    use phaseguard_utils::test_support::{fixed_now, proptest_cases};
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(64)))]

        /// Whatever the order records arrive in, the same one is chosen.
        #[test]
        fn prop_verdict_independent_of_record_order(
            ages in prop::collection::vec((0i64..48, 0u64..2), 1..6),
            seed in any::<u64>(),
        ) {
            let records: Vec<Evidence> = ages
                .iter()
                .enumerate()
                .map(|(i, (hours, failed))| {
                    Evidence::seal(
                        format!("e{i}"),
                        EvidenceClass::GateEvidence,
                        fixed_now() - Duration::hours(*hours),
                        json!({"kind": "test_run", "claim_id": "c", "passed": 1, "failed": failed, "exit_code": 0}),
                    )
                    .unwrap()
                })
                .collect();
            let mut shuffled = records.clone();
            let n = shuffled.len();
            shuffled.rotate_left((seed as usize) % n);
            shuffled.reverse();

            let claim = Claim::new("c", "tests", ClaimKind::TestsPass, EvidenceClass::GateEvidence);
            let ctx = FreshnessContext::starting_now(fixed_now(), fixed_now() - Duration::hours(1));
            prop_assert_eq!(verify_claim(&claim, &records, &ctx), verify_claim(&claim, &shuffled, &ctx));
        }

        /// Stale records never verify.
        #[test]
        fn prop_stale_never_verifies(hours in 25i64..1000) {
            let e = Evidence::seal(
                "old",
                EvidenceClass::GateEvidence,
                fixed_now() - Duration::hours(hours),
                json!({"kind": "build", "claim_id": "c", "exit_code": 0}),
            )
            .unwrap();
            let claim = Claim::new("c", "build", ClaimKind::BuildSucceeds, EvidenceClass::GateEvidence);
            let ctx = FreshnessContext::starting_now(fixed_now(), fixed_now());
            prop_assert!(!verify_claim(&claim, &[e], &ctx).is_verified());
        }
    }
}
