//! Property tests over whole runs driven through the engine handle.
//!
//! Random operation sequences must keep the run's guarantees after every
//! step: the phase never moves backwards, a blocked run names its blocker
//! in `next`, low confidence never reads as a confident mode, and a status
//! read straight after a commit changes nothing.

mod test_support;

use proptest::prelude::*;
use serde_json::json;

use phaseguard::paths::with_isolated_home;
use phaseguard::types::CONFIDENCE_THRESHOLD;
use phaseguard::{EnvelopeStatus, ExecutionMode, GateName, Mode};
use phaseguard_utils::test_support::{fixed_now, proptest_cases};

use test_support::{observed, review, started};

const ARTIFACTS: [&str; 6] = [
    "repo_signals",
    "repo_map",
    "decision_pack",
    "api_inventory",
    "plan",
    "architecture_doc",
];
const SIGNALS: [&str; 2] = ["api-artifacts-detected", "business-rules-present"];

#[derive(Debug, Clone)]
enum Op {
    Artifact(usize),
    Signal(usize, bool),
    Assess(u8),
    Review(bool),
    Advance,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ARTIFACTS.len()).prop_map(Op::Artifact),
        (0..SIGNALS.len(), any::<bool>()).prop_map(|(i, b)| Op::Signal(i, b)),
        (0u8..=100).prop_map(Op::Assess),
        any::<bool>().prop_map(Op::Review),
        Just(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_cases(16)))]

    #[test]
    fn prop_runs_keep_their_guarantees(ops in prop::collection::vec(op(), 1..20)) {
        let home = with_isolated_home();
        let mode = ExecutionMode::Interactive;
        let mut handle = started(&home.home(), mode);
        let mut previous = handle.status().unwrap().state.current_phase();

        for (i, op) in ops.into_iter().enumerate() {
            // refused operations leave the run as it was
            let _ = match op {
                Op::Artifact(a) => handle.record_evidence(
                    observed(&format!("ev-{i}"), json!({"artifact": ARTIFACTS[a]})),
                    fixed_now(),
                ),
                Op::Signal(s, present) => handle.record_evidence(
                    observed(&format!("ev-{i}"), json!({"signal": SIGNALS[s], "present": present})),
                    fixed_now(),
                ),
                Op::Assess(confidence) => handle.assess(confidence, None, fixed_now()),
                Op::Review(approve) => {
                    let issues: &[&str] = if approve { &[] } else { &["unclear ownership"] };
                    handle.submit_review(GateName::Architecture, &review(issues), fixed_now())
                }
                Op::Advance => handle.advance(fixed_now()),
            };

            let status = handle.status().unwrap();
            let state = &status.state;
            prop_assert!(state.current_phase() >= previous);
            if state.mode == Mode::Blocked {
                prop_assert!(state.next.starts_with("BLOCKED-"), "next was {}", state.next);
                prop_assert_ne!(status.envelope.status, EnvelopeStatus::Ok);
            }
            if state.confidence_level < i64::from(CONFIDENCE_THRESHOLD) {
                prop_assert!(matches!(state.mode, Mode::Draft | Mode::Blocked));
            }
            prop_assert!(status.state_unchanged);
            previous = state.current_phase();
        }
    }

    #[test]
    fn prop_assess_mode_follows_the_threshold(confidence in 0u8..=100) {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let report = handle.assess(confidence, None, fixed_now()).unwrap();
        if confidence < CONFIDENCE_THRESHOLD {
            prop_assert_eq!(report.state.mode, Mode::Draft);
        } else {
            prop_assert_eq!(report.state.mode, Mode::Standard);
        }
        let again = handle.advance(fixed_now()).unwrap();
        prop_assert!(again.state_unchanged);
    }
}
