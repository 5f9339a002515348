//! The bounded output envelope every operation ends with.
//!
//! An envelope carries one status, the phase and gate it applies to, at most
//! one primary reason code and exactly one next action. Free-text fields are
//! bounded so the envelope always fits a terminal line or a CI annotation.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use phaseguard_reason::{Category, ReasonCode, ReasonEmission, ReasonPayload, ReasonRegistry, RenderContext};
use phaseguard_state::SessionState;
use phaseguard_utils::error::UserFriendlyError;
use phaseguard_utils::exit_codes::ExitCode;
use phaseguard_utils::types::{GateName, GateStatus, Mode, PhaseId, PhaseKind, SessionKey};

use crate::error::EngineError;

/// Longest value any free-text envelope field may hold, in characters.
pub const MAX_FIELD_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeStatus {
    Ok,
    Warn,
    NotVerified,
    Blocked,
    NeedsHuman,
    AwaitingDecision,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextActionKind {
    Command,
    ReplyWithOneNumber,
    ManualStep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextAction {
    #[serde(rename = "type")]
    pub kind: NextActionKind,
    pub value: String,
}

impl NextAction {
    fn command(value: impl Into<String>) -> Self {
        Self {
            kind: NextActionKind::Command,
            value: value.into(),
        }
    }

    fn manual(value: impl Into<String>) -> Self {
        Self {
            kind: NextActionKind::ManualStep,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEnvelope {
    pub status: EnvelopeStatus,
    /// Phase token, or `none` when no run applies
    pub phase: String,
    /// Gate governing the phase, or `none`
    pub gate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
}

/// Cut `text` to [`MAX_FIELD_CHARS`] characters, marking the cut.
#[must_use]
pub fn bound(text: &str) -> String {
    if text.chars().count() <= MAX_FIELD_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_FIELD_CHARS - 3).collect();
    out.push_str("...");
    out
}

/// The single reason an envelope reports for `state`.
///
/// A blocking `Next` wins. Otherwise a non-blocking reason offered by the
/// caller, then the first not-verified code still active in diagnostics.
#[must_use]
pub fn primary_reason(
    state: &SessionState,
    offered: Option<(ReasonCode, ReasonPayload)>,
) -> Option<(ReasonCode, ReasonPayload)> {
    let recorded = |code: ReasonCode| {
        state
            .diagnostics
            .reason_payloads
            .get(code.as_str())
            .cloned()
            .unwrap_or_default()
    };
    if state.is_blocked() {
        return ReasonCode::from_str(&state.next).ok().map(|code| (code, recorded(code)));
    }
    if let Some((code, payload)) = offered
        && !code.is_blocking()
    {
        return Some((code, payload));
    }
    state
        .diagnostics
        .active_reasons
        .iter()
        .filter_map(|c| ReasonCode::from_str(c).ok())
        .find(|c| c.category() == Category::NotVerified)
        .map(|code| (code, recorded(code)))
}

fn run_args(key: &SessionKey) -> String {
    format!("--repo {} --run {}", key.repo_fingerprint, key.run_id)
}

/// Next action for a run that is not blocked: what the awaited phase needs.
fn continuation(state: &SessionState, key: &SessionKey) -> NextAction {
    let args = run_args(key);
    // a rejected gate parks Next on its authoring phase while the run stays put
    if let Some(gate) = state.current_phase().gate()
        && state.gate_status(gate) == GateStatus::Rejected
    {
        return if gate == GateName::Architecture {
            NextAction::manual(format!(
                "Revise the plan, then resubmit with `phaseguard review {args} --gate {gate} <review.json>`"
            ))
        } else {
            NextAction::manual(format!(
                "Record fresh evidence for the {gate} claims, then run `phaseguard advance {args}`"
            ))
        };
    }
    let Some(phase) = PhaseId::from_token(&state.next) else {
        return NextAction::command(format!("phaseguard status {args}"));
    };
    if phase.kind() == PhaseKind::Terminal {
        return NextAction::manual("Workflow complete; no phase is left to run");
    }
    if let Some(gate) = phase.gate()
        && !matches!(state.gate_status(gate), GateStatus::Approved | GateStatus::NotApplicable)
    {
        return if gate == GateName::Architecture {
            NextAction::command(format!("phaseguard review {args} --gate {gate} <review.json>"))
        } else {
            NextAction::command(format!("phaseguard advance {args}"))
        };
    }
    let missing: Vec<&str> = phase
        .required_artifacts()
        .iter()
        .copied()
        .filter(|a| !state.has_artifact(a))
        .collect();
    if missing.is_empty() {
        NextAction::command(format!("phaseguard advance {args}"))
    } else {
        NextAction::manual(format!(
            "Record evidence for {} ({}), then run `phaseguard evidence add {args} <evidence.json>`",
            missing.join(", "),
            phase.as_str()
        ))
    }
}

impl OutputEnvelope {
    /// Envelope for `state`, reporting `reason` (already rendered) if any.
    #[must_use]
    pub fn for_state(state: &SessionState, key: &SessionKey, reason: Option<&ReasonEmission>) -> Self {
        let phase = state.current_phase();
        let gate = phase
            .gate()
            .map_or_else(|| "none".to_string(), |g| g.as_str().to_string());
        let mut envelope = Self {
            status: EnvelopeStatus::Ok,
            phase: phase.token().to_string(),
            gate,
            reason_code: None,
            next_action: continuation(state, key),
            recovery: None,
        };

        if let Some(emission) = reason {
            envelope.reason_code = Some(emission.code.as_str().to_string());
            envelope.recovery = Some(emission.recovery_action.clone());
            envelope.status = match emission.code.category() {
                Category::Blocked if emission.code == ReasonCode::EscalatedToHuman => EnvelopeStatus::NeedsHuman,
                Category::Blocked => EnvelopeStatus::Blocked,
                Category::NotVerified => EnvelopeStatus::NotVerified,
                Category::Warn => EnvelopeStatus::Warn,
            };
            if emission.code.category() != Category::Warn {
                envelope.next_action = NextAction::command(emission.next_command.clone());
            }
        } else if phase.kind() == PhaseKind::Terminal {
            envelope.status = EnvelopeStatus::Complete;
        } else if state.mode == Mode::Architect
            && let Some(surface) = state.decision_surface.as_ref().filter(|s| s.is_populated())
        {
            let options: Vec<String> = surface
                .options
                .iter()
                .enumerate()
                .map(|(i, o)| format!("{}) {o}", i + 1))
                .collect();
            envelope.status = EnvelopeStatus::AwaitingDecision;
            envelope.next_action = NextAction {
                kind: NextActionKind::ReplyWithOneNumber,
                value: format!("{} {}", surface.question, options.join(" ")),
            };
        }
        envelope.bounded()
    }

    /// Envelope for a refused operation.
    #[must_use]
    pub fn for_error(
        err: &EngineError,
        registry: Option<&ReasonRegistry>,
        phase: Option<PhaseId>,
        ctx: &RenderContext,
    ) -> Self {
        let phase_token = phase.map_or_else(|| "none".to_string(), |p| p.token().to_string());
        let gate = phase
            .and_then(|p| p.gate())
            .map_or_else(|| "none".to_string(), |g| g.as_str().to_string());
        let emission = match (err.reason(), registry) {
            (Some((code, payload)), Some(registry)) => Some(registry.emit(code, payload, ctx)),
            _ => None,
        };
        let envelope = match emission {
            Some(emission) => Self {
                status: if emission.code == ReasonCode::EscalatedToHuman {
                    EnvelopeStatus::NeedsHuman
                } else if emission.is_block() {
                    EnvelopeStatus::Blocked
                } else {
                    EnvelopeStatus::Error
                },
                phase: phase_token,
                gate,
                reason_code: Some(emission.code.as_str().to_string()),
                next_action: NextAction::command(emission.next_command),
                recovery: Some(emission.recovery_action),
            },
            None => Self {
                status: EnvelopeStatus::Error,
                phase: phase_token,
                gate,
                reason_code: None,
                next_action: NextAction::manual(
                    err.suggestions()
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| "Re-run with --verbose for details".to_string()),
                ),
                recovery: Some(err.user_message()),
            },
        };
        envelope.bounded()
    }

    /// Envelope for an engine-level operation, which has no run phase.
    #[must_use]
    pub fn for_engine(reason: Option<&ReasonEmission>, next_command: impl Into<String>) -> Self {
        let next_command = next_command.into();
        let next_action = if next_command.starts_with("phaseguard ") {
            NextAction::command(next_command)
        } else {
            NextAction::manual(next_command)
        };
        let status = match reason.map(ReasonEmission::category) {
            None => EnvelopeStatus::Ok,
            Some(Category::Blocked) => EnvelopeStatus::Blocked,
            Some(Category::Warn) => EnvelopeStatus::Warn,
            Some(Category::NotVerified) => EnvelopeStatus::NotVerified,
        };
        Self {
            status,
            phase: "none".to_string(),
            gate: "none".to_string(),
            reason_code: reason.map(|r| r.code.as_str().to_string()),
            next_action,
            recovery: reason.map(|r| r.recovery_action.clone()),
        }
        .bounded()
    }

    fn bounded(mut self) -> Self {
        self.phase = bound(&self.phase);
        self.gate = bound(&self.gate);
        self.reason_code = self.reason_code.as_deref().map(bound);
        self.next_action.value = bound(&self.next_action.value);
        self.recovery = self.recovery.as_deref().map(bound);
        self
    }

    /// Process exit code implied by the envelope.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        let integrity = matches!(
            self.reason_code.as_deref(),
            Some("BLOCKED-HASH-MISMATCH" | "BLOCKED-BUNDLE-INCOMPATIBLE" | "BLOCKED-ROLLBACK-UNAVAILABLE")
        );
        match self.status {
            EnvelopeStatus::Blocked if integrity => ExitCode::INTEGRITY,
            EnvelopeStatus::Blocked => match self.reason_code.as_deref() {
                Some("BLOCKED-LOCK-CONTENTION") => ExitCode::LOCK_HELD,
                _ => ExitCode::BLOCKED,
            },
            EnvelopeStatus::NeedsHuman => ExitCode::NEEDS_HUMAN,
            EnvelopeStatus::Error => ExitCode::INTERNAL,
            _ => ExitCode::SUCCESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseguard_evidence::RepoIdentity;
    use phaseguard_reason::payload_of;
    use phaseguard_state::DecisionSurface;
    use phaseguard_utils::test_support::{fixed_now, test_key};

    fn fresh() -> SessionState {
        let identity = RepoIdentity {
            repo_fingerprint: test_key().repo_fingerprint,
            repo_root: None,
        };
        SessionState::new(&test_key(), &identity, "id-1", fixed_now())
    }

    #[test]
    fn test_bound_cuts_on_char_boundary() {
        let long = "é".repeat(300);
        let cut = bound(&long);
        assert_eq!(cut.chars().count(), MAX_FIELD_CHARS);
        assert!(cut.ends_with("..."));
        assert_eq!(bound("short"), "short");
    }

    #[test]
    fn test_blocked_state_reports_its_code_and_command() {
        let registry = ReasonRegistry::builtin().unwrap();
        let mut state = fresh();
        state.block(
            ReasonCode::HashMismatch,
            payload_of([("changed_categories", "pack_hash")]),
        );
        let (code, payload) = primary_reason(&state, None).unwrap();
        let emission = registry.emit(code, payload, &RenderContext::for_key(&test_key()));
        let envelope = OutputEnvelope::for_state(&state, &test_key(), Some(&emission));

        assert_eq!(envelope.status, EnvelopeStatus::Blocked);
        assert_eq!(envelope.reason_code.as_deref(), Some("BLOCKED-HASH-MISMATCH"));
        assert_eq!(envelope.next_action.kind, NextActionKind::Command);
        assert!(envelope.next_action.value.contains("rollback-engine"));
        assert_eq!(envelope.exit_code(), ExitCode::INTEGRITY);
    }

    #[test]
    fn test_missing_artifact_is_a_manual_step() {
        let mut state = fresh();
        state.phase = PhaseId::Discovery.into();
        state.next = PhaseId::Discovery.token().to_string();
        let envelope = OutputEnvelope::for_state(&state, &test_key(), None);
        assert_eq!(envelope.status, EnvelopeStatus::Ok);
        assert_eq!(envelope.next_action.kind, NextActionKind::ManualStep);
        assert!(envelope.next_action.value.contains("repo_signals"));
        assert_eq!(envelope.exit_code(), ExitCode::SUCCESS);
    }

    #[test]
    fn test_rejected_review_points_back_at_the_plan() {
        let mut state = fresh();
        state.phase = PhaseId::ArchitectureReview.into();
        state.next = PhaseId::Planning.token().to_string();
        state.gate_mut(GateName::Architecture).status = GateStatus::Rejected;
        let envelope = OutputEnvelope::for_state(&state, &test_key(), None);
        assert_eq!(envelope.next_action.kind, NextActionKind::ManualStep);
        assert!(envelope.next_action.value.starts_with("Revise the plan"));
        assert!(envelope.next_action.value.contains("--gate P5-Architecture"));
    }

    #[test]
    fn test_decision_surface_asks_for_one_number() {
        let mut state = fresh();
        state.mode = Mode::Architect;
        state.confidence_level = 80;
        state.decision_surface = Some(DecisionSurface {
            question: "Which store?".to_string(),
            options: vec!["sqlite".to_string(), "files".to_string()],
        });
        let envelope = OutputEnvelope::for_state(&state, &test_key(), None);
        assert_eq!(envelope.status, EnvelopeStatus::AwaitingDecision);
        assert_eq!(envelope.next_action.kind, NextActionKind::ReplyWithOneNumber);
        assert_eq!(envelope.next_action.value, "Which store? 1) sqlite 2) files");
    }

    #[test]
    fn test_escalation_is_needs_human() {
        let registry = ReasonRegistry::builtin().unwrap();
        let mut state = fresh();
        state.phase = PhaseId::ArchitectureReview.into();
        state.block(
            ReasonCode::EscalatedToHuman,
            payload_of([("gate", "P5-Architecture"), ("iteration", "3")]),
        );
        let (code, payload) = primary_reason(&state, None).unwrap();
        let emission = registry.emit(code, payload, &RenderContext::for_key(&test_key()));
        let envelope = OutputEnvelope::for_state(&state, &test_key(), Some(&emission));
        assert_eq!(envelope.status, EnvelopeStatus::NeedsHuman);
        assert_eq!(envelope.gate, "P5-Architecture");
        assert_eq!(envelope.exit_code(), ExitCode::NEEDS_HUMAN);
    }

    #[test]
    fn test_envelope_serializes_kebab_status() {
        let envelope = OutputEnvelope::for_state(&fresh(), &test_key(), None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["phase"], "0");
        assert!(json.get("reason_code").is_none());
        assert!(json["next_action"]["type"].is_string());
    }
}
