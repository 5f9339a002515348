//! Cross-field invariants.
//!
//! [`check`] runs every rule in one pass and returns all violations, so a
//! refused save names everything that is wrong, not just the first problem.

use serde::{Deserialize, Serialize};
use std::fmt;

use phaseguard_reason::{Category, ReasonCode, ReasonRegistry};
use phaseguard_utils::types::{CONFIDENCE_THRESHOLD, GateName, GateStatus, Mode, PhaseId};

use crate::model::SessionState;

/// Roots a path field may start from.
pub const CANONICAL_ROOTS: [&str; 4] = [
    "${REPO_ROOT}",
    "${WORKSPACE_HOME}",
    "${CONFIG_ROOT}",
    "${SESSION_ROOT}",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Invariant {
    BlockedNext,
    LowConfidence,
    ConfidenceRange,
    ReasonPayload,
    ArchitectSurface,
    LoadEvidence,
    CanonicalPaths,
    ArchitectureApproval,
    UpstreamGates,
    GateArtifacts,
    PhaseToken,
}

impl Invariant {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedNext => "blocked-next",
            Self::LowConfidence => "low-confidence",
            Self::ConfidenceRange => "confidence-range",
            Self::ReasonPayload => "reason-payload",
            Self::ArchitectSurface => "architect-surface",
            Self::LoadEvidence => "load-evidence",
            Self::CanonicalPaths => "canonical-paths",
            Self::ArchitectureApproval => "architecture-approval",
            Self::UpstreamGates => "upstream-gates",
            Self::GateArtifacts => "gate-artifacts",
            Self::PhaseToken => "phase-token",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: Invariant,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.detail)
    }
}

/// Every violation in `state`, in rule order.
#[must_use]
pub fn check(state: &SessionState, registry: &ReasonRegistry) -> Vec<Violation> {
    let mut out = Vec::new();
    let mut push = |invariant: Invariant, detail: String| out.push(Violation { invariant, detail });

    if state.mode == Mode::Blocked && !state.next.starts_with(Category::Blocked.prefix()) {
        push(
            Invariant::BlockedNext,
            format!("Mode is BLOCKED but Next is '{}'", state.next),
        );
    }

    if state.confidence_level < i64::from(CONFIDENCE_THRESHOLD)
        && !matches!(state.mode, Mode::Draft | Mode::Blocked)
    {
        push(
            Invariant::LowConfidence,
            format!(
                "ConfidenceLevel {} is below {CONFIDENCE_THRESHOLD} but Mode is {}",
                state.confidence_level, state.mode
            ),
        );
    }

    if !(0..=100).contains(&state.confidence_level) {
        push(
            Invariant::ConfidenceRange,
            format!("ConfidenceLevel {} is outside 0..=100", state.confidence_level),
        );
    }

    for detail in reason_payload_problems(state, registry) {
        push(Invariant::ReasonPayload, detail);
    }

    if state.mode == Mode::Architect
        && !state.decision_surface.as_ref().is_some_and(|s| s.is_populated())
    {
        push(
            Invariant::ArchitectSurface,
            "Mode is ARCHITECT but DecisionSurface has no question and options".to_string(),
        );
    }

    for name in state.loaded_rulebooks.keys().chain(state.loaded_addons.keys()) {
        if state.load_evidence.get(name).is_none_or(|id| id.trim().is_empty()) {
            push(
                Invariant::LoadEvidence,
                format!("'{name}' is loaded without LoadEvidence"),
            );
        }
    }

    for (name, path) in &state.paths {
        if let Err(why) = check_canonical_path(path) {
            push(Invariant::CanonicalPaths, format!("Paths.{name} '{path}' {why}"));
        }
    }

    if state.gate_status(GateName::Architecture) == GateStatus::Approved
        && !state.has_approved_decision()
    {
        push(
            Invariant::ArchitectureApproval,
            "P5-Architecture is approved without an approved architecture decision".to_string(),
        );
    }

    if state.mode == Mode::Implement || state.current_phase().is_code_producing() {
        let blocking: Vec<String> = GateName::ImplementationQa
            .upstream()
            .into_iter()
            .filter(|g| !state.gate_status(*g).is_allowed_upstream())
            .map(|g| format!("{g}={}", state.gate_status(g)))
            .collect();
        if !blocking.is_empty() {
            push(
                Invariant::UpstreamGates,
                format!("code-producing step with upstream gates {}", blocking.join(", ")),
            );
        }
    }

    for (gate, record) in &state.gates {
        if record.status != GateStatus::Approved {
            continue;
        }
        if let Some(artifacts) = state.gate_artifacts.get(gate) {
            let missing = artifacts.missing();
            if !missing.is_empty() {
                push(
                    Invariant::GateArtifacts,
                    format!("{gate} is approved with missing artifacts {}", missing.join(", ")),
                );
            }
        }
    }

    let expected = PhaseId::from_ordinal(state.phase.ordinal);
    if expected != Some(state.phase.name) || state.phase.token != state.phase.name.token() {
        push(
            Invariant::PhaseToken,
            format!(
                "Phase {{Ordinal: {}, Token: '{}'}} does not match {}",
                state.phase.ordinal,
                state.phase.token,
                state.phase.name.as_str()
            ),
        );
    }

    out
}

/// Reason codes referenced anywhere in the document, deduplicated.
#[must_use]
pub fn referenced_codes(state: &SessionState) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    if Category::of(&state.next).is_some() {
        codes.push(state.next.clone());
    }
    codes.extend(state.diagnostics.active_reasons.iter().cloned());
    codes.extend(
        state
            .build_evidence
            .claims
            .values()
            .filter_map(|c| c.resolution.as_ref()?.reason_code.clone()),
    );
    codes.sort();
    codes.dedup();
    codes
}

fn reason_payload_problems(state: &SessionState, registry: &ReasonRegistry) -> Vec<String> {
    let mut problems = Vec::new();
    for code in referenced_codes(state) {
        let Ok(parsed) = code.parse::<ReasonCode>() else {
            problems.push(format!("{code} is not a registered reason code"));
            continue;
        };
        match state.diagnostics.reason_payloads.get(&code) {
            None => problems.push(format!("{code} has no entry in Diagnostics.ReasonPayloads")),
            Some(payload) => {
                let missing = registry.missing_fields(parsed, payload);
                if !missing.is_empty() {
                    problems.push(format!("{code} payload is missing {}", missing.join(", ")));
                }
            }
        }
    }
    problems
}

/// A path must start at a known variable root, stay inside it and carry no
/// platform-specific syntax.
pub fn check_canonical_path(path: &str) -> Result<(), &'static str> {
    if path.contains('\\') {
        return Err("contains a backslash");
    }
    if has_drive_prefix(path) {
        return Err("contains drive syntax");
    }
    let Some(root) = CANONICAL_ROOTS.iter().find(|r| path.starts_with(*r)) else {
        return Err("is not rooted at a canonical variable");
    };
    let rest = &path[root.len()..];
    if rest.is_empty() {
        return Ok(());
    }
    let Some(rest) = rest.strip_prefix('/') else {
        return Err("does not separate the root with '/'");
    };
    for segment in rest.split('/') {
        match segment {
            "" => return Err("has an empty segment"),
            "." => return Err("has a '.' segment"),
            ".." => return Err("traverses with '..'"),
            s if s.contains("${") => return Err("nests a variable"),
            _ => {}
        }
    }
    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.split('/').any(|seg| {
        let b = seg.as_bytes();
        b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
    }) || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}
