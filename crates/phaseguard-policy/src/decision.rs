use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use phaseguard_evidence::{Evidence, EvidenceClass, FreshnessContext};
use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_utils::types::{ExecutionMode, GateName, GateStatus, PhaseId};

/// The only operator input that authorizes a workspace-memory write.
pub const CONFIRMATION_PHRASE: &str = "Persist to workspace memory";

/// Payload field of an `operator_provided` record holding the phrase.
pub const CONFIRMATION_FIELD: &str = "confirmation";

/// Every artifact the engine may write durably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    SessionState,
    RepoCache,
    RepoMapDigest,
    DecisionPack,
    BusinessRulesInventory,
    WorkspaceMemory,
}

/// How an artifact kind is governed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    /// Owned by the state repository; invariant-checked elsewhere
    EngineState,
    /// Discovery output; allowed once its phase is reached and content exists
    Observational,
    /// Decisions and defaults that outlive the run
    Durable,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        Self::SessionState,
        Self::RepoCache,
        Self::RepoMapDigest,
        Self::DecisionPack,
        Self::BusinessRulesInventory,
        Self::WorkspaceMemory,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionState => "session-state",
            Self::RepoCache => "repo-cache",
            Self::RepoMapDigest => "repo-map-digest",
            Self::DecisionPack => "decision-pack",
            Self::BusinessRulesInventory => "business-rules-inventory",
            Self::WorkspaceMemory => "workspace-memory",
        }
    }

    #[must_use]
    pub const fn class(&self) -> ArtifactClass {
        match self {
            Self::SessionState => ArtifactClass::EngineState,
            Self::WorkspaceMemory => ArtifactClass::Durable,
            Self::RepoCache
            | Self::RepoMapDigest
            | Self::DecisionPack
            | Self::BusinessRulesInventory => ArtifactClass::Observational,
        }
    }

    /// Earliest phase in which the artifact may be written.
    #[must_use]
    pub const fn earliest_phase(&self) -> PhaseId {
        match self {
            Self::SessionState => PhaseId::Bootstrap,
            Self::RepoCache => PhaseId::Discovery,
            Self::RepoMapDigest | Self::BusinessRulesInventory => PhaseId::RepoDiscovery,
            Self::DecisionPack => PhaseId::DecisionPack,
            Self::WorkspaceMemory => PhaseId::ArchitectureReview,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "Unknown artifact '{s}'. Valid artifacts: {}",
                    Self::ALL.map(|k| k.as_str()).join(", ")
                )
            })
    }
}

/// Everything a persistence decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceRequest<'a> {
    pub artifact: ArtifactKind,
    pub phase: PhaseId,
    pub execution_mode: ExecutionMode,
    /// Gate governing the current phase and its recorded status
    pub gate: GateName,
    pub gate_status: GateStatus,
    /// Operator record offered as confirmation, if any
    pub confirmation: Option<&'a Evidence>,
    pub freshness: FreshnessContext,
    pub content_len: usize,
}

/// The run's own record of where it stands.
///
/// Requests built through [`PersistenceRequest::for_run`] read the phase and
/// gate status from here rather than from the caller.
pub trait GovernedRun {
    fn current_phase(&self) -> PhaseId;
    fn governing_gate(&self) -> GateName;
    fn gate_status(&self, gate: GateName) -> GateStatus;
    fn session_started_at(&self) -> DateTime<Utc>;
}

impl<'a> PersistenceRequest<'a> {
    /// Request for `artifact` with phase, gate and session start taken from `run`.
    #[must_use]
    pub fn for_run(
        run: &impl GovernedRun,
        artifact: ArtifactKind,
        execution_mode: ExecutionMode,
        now: DateTime<Utc>,
        invocation_started_at: DateTime<Utc>,
        confirmation: Option<&'a Evidence>,
        content_len: usize,
    ) -> Self {
        let gate = run.governing_gate();
        Self {
            artifact,
            phase: run.current_phase(),
            execution_mode,
            gate,
            gate_status: run.gate_status(gate),
            confirmation,
            freshness: FreshnessContext {
                now,
                invocation_started_at,
                session_started_at: run.session_started_at(),
            },
            content_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allowed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceDecision {
    pub artifact: ArtifactKind,
    pub phase: PhaseId,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "ReasonPayload::is_empty")]
    pub payload: ReasonPayload,
}

impl PersistenceDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allowed
    }

    fn allowed(req: &PersistenceRequest<'_>) -> Self {
        Self {
            artifact: req.artifact,
            phase: req.phase,
            verdict: Verdict::Allowed,
            reason_code: None,
            payload: ReasonPayload::new(),
        }
    }

    fn blocked(req: &PersistenceRequest<'_>, code: ReasonCode, payload: ReasonPayload) -> Self {
        Self {
            artifact: req.artifact,
            phase: req.phase,
            verdict: Verdict::Blocked,
            reason_code: Some(code),
            payload,
        }
    }
}

/// Decide whether `req` may be written. Pure and deterministic.
#[must_use]
pub fn decide(req: &PersistenceRequest<'_>) -> PersistenceDecision {
    let artifact = req.artifact.as_str();
    match req.artifact.class() {
        ArtifactClass::EngineState => PersistenceDecision::allowed(req),
        ArtifactClass::Observational => {
            if req.phase < req.artifact.earliest_phase() {
                return PersistenceDecision::blocked(
                    req,
                    ReasonCode::PersistencePhaseNotAllowed,
                    payload_of([("artifact", artifact), ("phase", req.phase.as_str())]),
                );
            }
            if req.content_len == 0 {
                return PersistenceDecision::blocked(
                    req,
                    ReasonCode::PersistenceThresholdNotMet,
                    payload_of([("artifact", artifact), ("gate", "none")]),
                );
            }
            PersistenceDecision::allowed(req)
        }
        ArtifactClass::Durable => {
            // pipeline runs can never confirm, whatever the gate says
            if req.execution_mode == ExecutionMode::Pipeline {
                return PersistenceDecision::blocked(
                    req,
                    ReasonCode::PersistencePipelineMode,
                    payload_of([("artifact", artifact)]),
                );
            }
            if req.gate_status != GateStatus::Approved {
                return PersistenceDecision::blocked(
                    req,
                    ReasonCode::PersistenceThresholdNotMet,
                    payload_of([("artifact", artifact), ("gate", req.gate.as_str())]),
                );
            }
            if !is_confirmed(req.confirmation, &req.freshness) {
                return PersistenceDecision::blocked(
                    req,
                    ReasonCode::PersistenceConfirmationRequired,
                    payload_of([("artifact", artifact)]),
                );
            }
            PersistenceDecision::allowed(req)
        }
    }
}

/// Exact phrase, in a trusted and fresh operator record. Nothing else counts.
#[must_use]
pub fn is_confirmed(confirmation: Option<&Evidence>, freshness: &FreshnessContext) -> bool {
    confirmation.is_some_and(|e| {
        e.evidence_class == EvidenceClass::OperatorProvided
            && e.verify_integrity()
            && e.freshness(freshness).is_fresh()
            && e.payload_str(CONFIRMATION_FIELD) == Some(CONFIRMATION_PHRASE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use phaseguard_utils::test_support::fixed_now;
    use serde_json::json;

    fn fresh() -> FreshnessContext {
        FreshnessContext::starting_now(fixed_now(), fixed_now() - Duration::hours(1))
    }

    fn phrase(text: &str) -> Evidence {
        Evidence::seal(
            "op-confirm",
            EvidenceClass::OperatorProvided,
            fixed_now(),
            json!({ CONFIRMATION_FIELD: text }),
        )
        .unwrap()
    }

    fn memory_request(confirmation: Option<&Evidence>) -> PersistenceRequest<'_> {
        PersistenceRequest {
            artifact: ArtifactKind::WorkspaceMemory,
            phase: PhaseId::ArchitectureReview,
            execution_mode: ExecutionMode::Interactive,
            gate: GateName::Architecture,
            gate_status: GateStatus::Approved,
            confirmation,
            freshness: fresh(),
            content_len: 42,
        }
    }

    #[test]
    fn test_workspace_memory_with_exact_phrase_is_allowed() {
        let e = phrase(CONFIRMATION_PHRASE);
        assert!(decide(&memory_request(Some(&e))).is_allowed());
    }

    #[test]
    fn test_approximate_phrase_is_not_confirmation() {
        for text in [
            "persist to workspace memory",
            "Persist to workspace memory.",
            " Persist to workspace memory",
            "yes",
        ] {
            let e = phrase(text);
            let d = decide(&memory_request(Some(&e)));
            assert_eq!(d.reason_code, Some(ReasonCode::PersistenceConfirmationRequired), "{text}");
        }
        let d = decide(&memory_request(None));
        assert_eq!(d.reason_code, Some(ReasonCode::PersistenceConfirmationRequired));
    }

    #[test]
    fn test_pipeline_mode_always_refused() {
        let e = phrase(CONFIRMATION_PHRASE);
        let mut req = memory_request(Some(&e));
        req.execution_mode = ExecutionMode::Pipeline;
        let d = decide(&req);
        assert_eq!(d.verdict, Verdict::Blocked);
        assert_eq!(d.reason_code, Some(ReasonCode::PersistencePipelineMode));
        assert_eq!(d.payload["artifact"], "workspace-memory");
    }

    #[test]
    fn test_unapproved_gate_blocks_memory() {
        let e = phrase(CONFIRMATION_PHRASE);
        let mut req = memory_request(Some(&e));
        req.gate_status = GateStatus::Rejected;
        let d = decide(&req);
        assert_eq!(d.reason_code, Some(ReasonCode::PersistenceThresholdNotMet));
        assert_eq!(d.payload["gate"], "P5-Architecture");
    }

    #[test]
    fn test_stale_or_wrong_class_confirmation_rejected() {
        let old = Evidence::seal(
            "op-old",
            EvidenceClass::OperatorProvided,
            fixed_now() - Duration::hours(2),
            json!({ CONFIRMATION_FIELD: CONFIRMATION_PHRASE }),
        )
        .unwrap();
        assert!(!decide(&memory_request(Some(&old))).is_allowed());

        let probe = Evidence::seal(
            "probe",
            EvidenceClass::PreflightProbe,
            fixed_now(),
            json!({ CONFIRMATION_FIELD: CONFIRMATION_PHRASE }),
        )
        .unwrap();
        assert!(!decide(&memory_request(Some(&probe))).is_allowed());
    }

    #[test]
    fn test_observational_artifacts_follow_phase_and_content() {
        let mut req = memory_request(None);
        req.artifact = ArtifactKind::DecisionPack;
        req.phase = PhaseId::Discovery;
        req.execution_mode = ExecutionMode::Pipeline;
        assert_eq!(decide(&req).reason_code, Some(ReasonCode::PersistencePhaseNotAllowed));

        req.phase = PhaseId::DecisionPack;
        assert!(decide(&req).is_allowed());

        req.content_len = 0;
        assert_eq!(decide(&req).reason_code, Some(ReasonCode::PersistenceThresholdNotMet));
    }

    #[test]
    fn test_artifact_kind_parsing() {
        assert_eq!("workspace_memory".parse::<ArtifactKind>().unwrap(), ArtifactKind::WorkspaceMemory);
        assert_eq!("Repo-Cache".parse::<ArtifactKind>().unwrap(), ArtifactKind::RepoCache);
        assert!("notes".parse::<ArtifactKind>().is_err());
    }
}
