//! The session state document.
//!
//! Field names are serialized in PascalCase; these are the canonical names.
//! Legacy spellings are handled in [`crate::aliases`] before a document ever
//! reaches these types, so every struct here denies unknown fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use phaseguard_evidence::{ClaimKind, EvidenceClass, RepoIdentity};
use phaseguard_policy::GovernedRun;
use phaseguard_reason::{Category, ReasonCode, ReasonPayload};
use phaseguard_utils::types::{
    CONFIDENCE_THRESHOLD, GateName, GateStatus, MAX_GATE_ITERATIONS, Mode, PhaseId, RolloutPhase,
    SessionKey,
};

pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SessionState {
    pub schema_version: String,
    pub repo_fingerprint: String,
    pub run_id: String,
    pub session_started_at: DateTime<Utc>,
    pub phase: PhaseRef,
    pub mode: Mode,
    /// Kept signed so out-of-range documents load and fail the range check
    pub confidence_level: i64,
    /// Phase token to work on next, or a `BLOCKED-*` code
    pub next: String,
    #[serde(default)]
    pub gates: BTreeMap<GateName, GateRecord>,
    #[serde(default)]
    pub gate_artifacts: BTreeMap<GateName, GateArtifacts>,
    #[serde(default)]
    pub phase5_review: Phase5Review,
    #[serde(default)]
    pub architecture_decisions: Vec<ArchitectureDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_surface: Option<DecisionSurface>,
    #[serde(default)]
    pub build_evidence: BuildEvidence,
    #[serde(default)]
    pub diagnostics: Diagnostics,
    #[serde(default)]
    pub loaded_rulebooks: BTreeMap<String, String>,
    #[serde(default)]
    pub loaded_addons: BTreeMap<String, String>,
    #[serde(default)]
    pub load_evidence: BTreeMap<String, String>,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Artifact name -> present
    #[serde(default)]
    pub artifacts: BTreeMap<String, bool>,
    #[serde(default)]
    pub applicability: BTreeMap<String, bool>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hashes: Option<IntegrityHashes>,
    #[serde(rename = "migration_events", default)]
    pub migration_events: Vec<MigrationEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PhaseRef {
    pub ordinal: u8,
    pub token: String,
    pub name: PhaseId,
}

impl From<PhaseId> for PhaseRef {
    fn from(phase: PhaseId) -> Self {
        Self {
            ordinal: phase.ordinal(),
            token: phase.token().to_string(),
            name: phase,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GateRecord {
    pub status: GateStatus,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    /// 1-based review iteration currently in progress
    #[serde(default = "first_iteration")]
    pub iteration: u32,
}

fn first_iteration() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GateArtifacts {
    #[serde(default)]
    pub provided: BTreeMap<String, Presence>,
}

impl GateArtifacts {
    #[must_use]
    pub fn missing(&self) -> Vec<&str> {
        self.provided
            .iter()
            .filter(|(_, p)| **p == Presence::Missing)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
    #[default]
    InProgress,
    Approved,
    EscalatedToHuman,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Phase5Review {
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: ReviewStatus,
    pub plan_version: u32,
    #[serde(default)]
    pub history: Vec<ReviewFeedback>,
}

impl Default for Phase5Review {
    fn default() -> Self {
        Self {
            iteration: 1,
            max_iterations: MAX_GATE_ITERATIONS,
            status: ReviewStatus::InProgress,
            plan_version: 1,
            history: Vec::new(),
        }
    }
}

/// One architecture-review round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ReviewFeedback {
    pub iteration: u32,
    pub plan_version: u32,
    pub status: GateStatus,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub escalated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Proposed,
    Approved,
    Rejected,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ArchitectureDecision {
    pub id: String,
    pub title: String,
    pub status: DecisionStatus,
}

/// Choice put to the operator while in `ARCHITECT` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DecisionSurface {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl DecisionSurface {
    #[must_use]
    pub fn is_populated(&self) -> bool {
        !self.question.trim().is_empty() && self.options.iter().any(|o| !o.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BuildEvidence {
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub claims: BTreeMap<String, ClaimEntry>,
}

/// A claim registered against a gate, with its last verification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ClaimEntry {
    pub label: String,
    pub kind: ClaimKind,
    pub required_class: EvidenceClass,
    pub gate: GateName,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ClaimResolution>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ClaimResolution {
    pub verified: bool,
    /// `NOT_VERIFIED-*` or `BLOCKED-*` code when not verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Diagnostics {
    /// Codes currently in force, as their wire strings
    #[serde(default)]
    pub active_reasons: Vec<String>,
    #[serde(default)]
    pub reason_payloads: BTreeMap<String, ReasonPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    Advance,
    /// Conditional phase skipped because its precondition was false
    NotApplicable,
    /// Gate rejected; work returns to the authoring phase
    ReturnToAuthoring,
    EscalateToHuman,
    Rollback,
}

/// Operator sign-off for moving a run backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RollbackAuthorization {
    pub target: PhaseId,
    pub authorized_by: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Transition {
    pub from: PhaseId,
    pub to: PhaseId,
    pub kind: TransitionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<RollbackAuthorization>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct IntegrityHashes {
    pub ruleset_hash: String,
    pub activation_hash: String,
    /// Category -> digest, for diffing against the next activation
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

/// Record of a legacy field rewritten to its canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationEvent {
    pub field: String,
    pub canonical: String,
    pub rollout: RolloutPhase,
    pub at: DateTime<Utc>,
}

impl SessionState {
    /// Fresh state for a run whose repository identity has been resolved.
    #[must_use]
    pub fn new(
        key: &SessionKey,
        identity: &RepoIdentity,
        identity_evidence_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut paths = BTreeMap::new();
        paths.insert("repo_root".to_string(), "${REPO_ROOT}".to_string());
        paths.insert(
            "session_root".to_string(),
            format!("${{SESSION_ROOT}}/{}/{}", key.repo_fingerprint, key.run_id),
        );
        let mut artifacts = BTreeMap::new();
        artifacts.insert("repo_identity".to_string(), true);
        let mut load_evidence = BTreeMap::new();
        load_evidence.insert("repo_identity".to_string(), identity_evidence_id.to_string());

        tracing::debug!(repo = %identity.repo_fingerprint, run_id = %key.run_id, "new session state");

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            repo_fingerprint: key.repo_fingerprint.clone(),
            run_id: key.run_id.clone(),
            session_started_at: now,
            phase: PhaseId::Bootstrap.into(),
            mode: Mode::Draft,
            confidence_level: 0,
            next: PhaseId::Bootstrap.token().to_string(),
            gates: BTreeMap::new(),
            gate_artifacts: BTreeMap::new(),
            phase5_review: Phase5Review::default(),
            architecture_decisions: Vec::new(),
            decision_surface: None,
            build_evidence: BuildEvidence::default(),
            diagnostics: Diagnostics::default(),
            loaded_rulebooks: BTreeMap::new(),
            loaded_addons: BTreeMap::new(),
            load_evidence,
            paths,
            artifacts,
            applicability: BTreeMap::new(),
            transitions: Vec::new(),
            integrity_hashes: None,
            migration_events: Vec::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> Option<SessionKey> {
        SessionKey::new(self.repo_fingerprint.clone(), self.run_id.clone()).ok()
    }

    #[must_use]
    pub fn current_phase(&self) -> PhaseId {
        self.phase.name
    }

    #[must_use]
    pub fn gate_status(&self, gate: GateName) -> GateStatus {
        self.gates.get(&gate).map(|g| g.status).unwrap_or_default()
    }

    /// Gate record, created pending on first access.
    pub fn gate_mut(&mut self, gate: GateName) -> &mut GateRecord {
        self.gates.entry(gate).or_insert_with(|| GateRecord {
            iteration: 1,
            ..GateRecord::default()
        })
    }

    #[must_use]
    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifacts.get(name).copied().unwrap_or(false)
    }

    /// Whether `Next` carries a blocking code.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.next.starts_with("BLOCKED-")
    }

    #[must_use]
    pub fn has_approved_decision(&self) -> bool {
        self.architecture_decisions
            .iter()
            .any(|d| d.status == DecisionStatus::Approved)
    }

    /// Whether the run is parked waiting for a human.
    #[must_use]
    pub fn awaiting_human(&self) -> bool {
        self.phase5_review.status == ReviewStatus::EscalatedToHuman
            || self.gates.values().any(|g| g.status == GateStatus::NeedsHuman)
    }

    /// Mark `code` active and record its payload.
    pub fn raise(&mut self, code: ReasonCode, payload: ReasonPayload) {
        let wire = code.as_str().to_string();
        if !self.diagnostics.active_reasons.contains(&wire) {
            self.diagnostics.active_reasons.push(wire.clone());
        }
        self.diagnostics.reason_payloads.insert(wire, payload);
    }

    /// Drop every active code of `category` that nothing else still references.
    pub fn clear_reasons(&mut self, category: Category) {
        self.diagnostics
            .active_reasons
            .retain(|c| Category::of(c) != Some(category));
        self.prune_payloads();
    }

    /// Remove payloads for codes no longer referenced anywhere.
    pub fn prune_payloads(&mut self) {
        let live = crate::invariants::referenced_codes(self);
        self.diagnostics
            .reason_payloads
            .retain(|code, _| live.contains(code));
    }

    /// Set `Next` to a blocking code and switch to `BLOCKED`.
    pub fn block(&mut self, code: ReasonCode, payload: ReasonPayload) {
        self.next = code.as_str().to_string();
        self.mode = Mode::Blocked;
        self.raise(code, payload);
    }

    /// Point `Next` at a phase token, leaving `BLOCKED` if the run was blocked.
    pub fn unblock_to(&mut self, token: &str) {
        self.next = token.to_string();
        if self.mode == Mode::Blocked {
            self.mode = if self.confidence_level < i64::from(CONFIDENCE_THRESHOLD) {
                Mode::Draft
            } else {
                Mode::Standard
            };
        }
        self.clear_reasons(Category::Blocked);
    }

    /// Mode implied by confidence, the decision surface and the phase.
    /// A blocked run stays blocked.
    #[must_use]
    pub fn derived_mode(&self) -> Mode {
        if self.mode == Mode::Blocked {
            Mode::Blocked
        } else if self.confidence_level < i64::from(CONFIDENCE_THRESHOLD) {
            Mode::Draft
        } else if self.decision_surface.as_ref().is_some_and(DecisionSurface::is_populated) {
            Mode::Architect
        } else if self.current_phase() == PhaseId::Implementation {
            Mode::Implement
        } else {
            Mode::Standard
        }
    }

    /// Gate that governs the current phase: the last gate at or before it.
    #[must_use]
    pub fn governing_gate(&self) -> GateName {
        let phase = self.current_phase();
        GateName::ALL
            .iter()
            .rev()
            .copied()
            .find(|g| g.phase() <= phase && self.gate_status(*g) != GateStatus::NotApplicable)
            .unwrap_or(GateName::Architecture)
    }
}

impl GovernedRun for SessionState {
    fn current_phase(&self) -> PhaseId {
        SessionState::current_phase(self)
    }

    fn governing_gate(&self) -> GateName {
        SessionState::governing_gate(self)
    }

    fn gate_status(&self, gate: GateName) -> GateStatus {
        SessionState::gate_status(self, gate)
    }

    fn session_started_at(&self) -> DateTime<Utc> {
        self.session_started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseguard_utils::test_support::{fixed_now, test_key};

    fn identity() -> RepoIdentity {
        RepoIdentity {
            repo_fingerprint: test_key().repo_fingerprint,
            repo_root: None,
        }
    }

    #[test]
    fn test_new_state_serializes_canonical_names() {
        let state = SessionState::new(&test_key(), &identity(), "id-1", fixed_now());
        let v = serde_json::to_value(&state).unwrap();
        for field in ["SchemaVersion", "Phase", "ConfidenceLevel", "Next", "Gates", "Phase5Review", "migration_events"] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(v["Phase"]["Token"], "0");
        assert_eq!(v["Mode"], "DRAFT");
        assert_eq!(v["Phase5Review"]["Iteration"], 1);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let state = SessionState::new(&test_key(), &identity(), "id-1", fixed_now());
        let mut v = serde_json::to_value(&state).unwrap();
        v["Surprise"] = serde_json::json!(true);
        assert!(serde_json::from_value::<SessionState>(v).is_err());
    }

    #[test]
    fn test_gate_keys_use_gate_names() {
        let mut state = SessionState::new(&test_key(), &identity(), "id-1", fixed_now());
        state.gate_mut(GateName::TestQuality).status = GateStatus::Approved;
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["Gates"]["P5.3-TestQuality"]["Status"], "approved");
        let back: SessionState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_governing_gate_tracks_phase() {
        let mut state = SessionState::new(&test_key(), &identity(), "id-1", fixed_now());
        assert_eq!(state.governing_gate(), GateName::Architecture);
        state.phase = PhaseId::RollbackSafety.into();
        assert_eq!(state.governing_gate(), GateName::RollbackSafety);
        state.phase = PhaseId::BusinessRules.into();
        state.gate_mut(GateName::BusinessRules).status = GateStatus::NotApplicable;
        assert_eq!(state.governing_gate(), GateName::TestQuality);
    }

    #[test]
    fn test_block_and_unblock_keep_diagnostics_consistent() {
        use phaseguard_reason::payload_of;

        let mut state = SessionState::new(&test_key(), &identity(), "id-1", fixed_now());
        state.confidence_level = 80;
        state.block(
            ReasonCode::EscalatedToHuman,
            payload_of([("gate", "P5-Architecture"), ("iteration", "3")]),
        );
        assert_eq!(state.mode, Mode::Blocked);
        assert!(state.is_blocked());
        assert!(state.diagnostics.reason_payloads.contains_key("BLOCKED-ESCALATED-TO-HUMAN"));

        state.unblock_to("5");
        assert_eq!(state.mode, Mode::Standard);
        assert_eq!(state.next, "5");
        assert!(state.diagnostics.active_reasons.is_empty());
        assert!(state.diagnostics.reason_payloads.is_empty());
    }
}
