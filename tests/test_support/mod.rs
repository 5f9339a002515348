//! Shared fixtures for the integration tests.
//!
//! Include with `mod test_support;` from a test file.

#![allow(dead_code)]

use camino::Utf8Path;
use serde_json::{Value, json};

use phaseguard::canonicalization::blake3_hex;
use phaseguard::evidence::{ClaimKind, Evidence, EvidenceClass};
use phaseguard::gate::ReviewInput;
use phaseguard::integrity::{MANIFEST_FILE, lock_bundle};
use phaseguard::state::{ArchitectureDecision, ClaimEntry, DecisionStatus, Presence};
use phaseguard::{Config, EngineHandle, ExecutionMode, GateName, OperationReport};
use phaseguard_utils::test_support::{fixed_now, test_key};

pub fn config(home: &Utf8Path, mode: ExecutionMode) -> Config {
    Config::builder()
        .home(home.to_path_buf())
        .execution_mode(mode)
        .engine_version("1.0.0")
        .build()
        .expect("fixture config")
}

pub fn identity(id: &str) -> Evidence {
    Evidence::seal(
        id,
        EvidenceClass::IdentitySignal,
        fixed_now(),
        json!({"repo_fingerprint": test_key().repo_fingerprint, "repo_root": "${REPO_ROOT}"}),
    )
    .expect("identity record")
}

pub fn observed(id: &str, payload: Value) -> Evidence {
    Evidence::seal(id, EvidenceClass::PreflightProbe, fixed_now(), payload).expect("probe record")
}

pub fn gate_evidence(id: &str, payload: Value) -> Evidence {
    Evidence::seal(id, EvidenceClass::GateEvidence, fixed_now(), payload).expect("gate record")
}

/// Handle on a run that has just been started from an identity record.
pub fn started(home: &Utf8Path, mode: ExecutionMode) -> EngineHandle {
    let mut handle = EngineHandle::open_at(config(home, mode), test_key(), fixed_now()).expect("open handle");
    handle
        .record_evidence(identity("id-1"), fixed_now())
        .expect("start run");
    handle
}

/// Record everything a run needs to reach the architecture review.
pub fn to_review(handle: &mut EngineHandle) -> OperationReport {
    let mut last = None;
    for (i, payload) in [
        json!({"artifact": "repo_signals"}),
        json!({"artifact": "repo_map"}),
        json!({"signal": "api-artifacts-detected", "present": false}),
        json!({"signal": "business-rules-present", "present": false}),
        json!({"artifact": "decision_pack"}),
        json!({"artifact": "plan"}),
    ]
    .into_iter()
    .enumerate()
    {
        last = Some(
            handle
                .record_evidence(observed(&format!("ev-{i}"), payload), fixed_now())
                .expect("record evidence"),
        );
    }
    last.expect("at least one record")
}

pub fn adr(status: DecisionStatus) -> ArchitectureDecision {
    ArchitectureDecision {
        id: "ADR-1".to_string(),
        title: "Single writer per run".to_string(),
        status,
    }
}

pub fn review(issues: &[&str]) -> ReviewInput {
    ReviewInput {
        issues: issues.iter().map(|s| (*s).to_string()).collect(),
        decisions: vec![adr(DecisionStatus::Approved)],
        artifacts: [("architecture_doc".to_string(), Presence::Present)].into(),
        ..ReviewInput::default()
    }
}

pub fn tests_green_claim() -> ClaimEntry {
    ClaimEntry {
        label: "tests green".to_string(),
        kind: ClaimKind::TestsPass,
        required_class: EvidenceClass::GateEvidence,
        gate: GateName::TestQuality,
        evidence_ids: Vec::new(),
        resolution: None,
    }
}

/// Take a run from its start through every gate to completion.
///
/// Business rules are marked absent, so that gate is not applicable.
pub fn to_complete(handle: &mut EngineHandle) -> OperationReport {
    to_review(handle);
    handle
        .submit_review(GateName::Architecture, &review(&[]), fixed_now())
        .expect("architecture approval");

    let claims = [
        (
            "tests-green",
            GateName::TestQuality,
            ClaimKind::TestsPass,
            json!({"claim_id": "tests-green", "kind": "test_run", "passed": 40, "failed": 0, "exit_code": 0}),
        ),
        (
            "rollback-drill",
            GateName::RollbackSafety,
            ClaimKind::Attested,
            json!({"claim_id": "rollback-drill", "restored": true}),
        ),
        (
            "build-ok",
            GateName::ImplementationQa,
            ClaimKind::BuildSucceeds,
            json!({"claim_id": "build-ok", "kind": "build", "exit_code": 0}),
        ),
    ];
    let mut last = None;
    for (claim_id, gate, kind, payload) in claims {
        if gate == GateName::ImplementationQa {
            handle
                .record_evidence(observed("change-set", json!({"artifact": "change_set"})), fixed_now())
                .expect("change set");
        }
        let entry = ClaimEntry {
            label: claim_id.replace('-', " "),
            kind,
            required_class: EvidenceClass::GateEvidence,
            gate,
            evidence_ids: Vec::new(),
            resolution: None,
        };
        handle.assert_claim(claim_id, entry, fixed_now()).expect("register claim");
        handle
            .record_evidence(gate_evidence(&format!("run-{claim_id}"), payload), fixed_now())
            .expect("gate evidence");
        last = Some(handle.advance(fixed_now()).expect("advance"));
    }
    last.expect("at least one gate")
}

/// Write a one-file rule bundle under `dir` and lock it.
pub fn write_bundle(dir: &Utf8Path, version: &str, rules: &str) {
    std::fs::create_dir_all(dir.join("rules")).unwrap();
    std::fs::write(dir.join("rules/core.md"), rules).unwrap();
    let manifest = format!(
        "name = \"core\"\nversion = \"{version}\"\nmin_engine_version = \"0.1.0\"\n\n\
         [compatibility]\nstate-schema-v1 = true\n\n\
         [[file]]\npath = \"rules/core.md\"\nblake3 = \"{}\"\n",
        blake3_hex(rules.as_bytes())
    );
    std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    lock_bundle(dir).unwrap();
}
