use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use thiserror::Error;

use phaseguard_evidence::Evidence;
use phaseguard_utils::atomic_write::{AtomicWriteResult, write_bytes_atomic};
use phaseguard_utils::error::{ErrorCategory, FsError, UserFriendlyError};
use phaseguard_utils::paths::{Layout, ensure_dir_all};
use phaseguard_utils::types::{ExecutionMode, SessionKey};

use crate::decision::{ArtifactKind, GovernedRun, PersistenceDecision, PersistenceRequest, decide};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Write of {} refused by persistence policy", .0.artifact)]
    Blocked(PersistenceDecision),

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl UserFriendlyError for PolicyError {
    fn user_message(&self) -> String {
        match self {
            Self::Blocked(d) => format!("The persistence policy refused to write {}", d.artifact),
            Self::Fs(e) => e.user_message(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Blocked(d) => d.reason_code.map(|c| format!("Reason: {c}")),
            Self::Fs(e) => e.context(),
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Blocked(_) => vec!["Run `phaseguard status` to see the recovery command".to_string()],
            Self::Fs(e) => e.suggestions(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Blocked(_) => ErrorCategory::Workflow,
            Self::Fs(_) => ErrorCategory::FileSystem,
        }
    }
}

/// Where each artifact kind lives for a session.
#[must_use]
pub fn artifact_path(layout: &Layout, key: &SessionKey, kind: ArtifactKind) -> Utf8PathBuf {
    match kind {
        ArtifactKind::SessionState => layout.state_file(key),
        ArtifactKind::RepoCache => layout.repo_cache_dir(&key.repo_fingerprint).join("cache.json"),
        ArtifactKind::RepoMapDigest => layout.run_dir(key).join("repo-map-digest.json"),
        ArtifactKind::DecisionPack => layout.run_dir(key).join("decision-pack.json"),
        ArtifactKind::BusinessRulesInventory => layout.run_dir(key).join("business-rules.json"),
        ArtifactKind::WorkspaceMemory => layout.workspace_memory_file(&key.repo_fingerprint),
    }
}

/// What the caller says about one write.
///
/// Phase, gate status and confirmation are not part of it: the writer reads
/// those from the run and its evidence log.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub artifact: ArtifactKind,
    pub execution_mode: ExecutionMode,
    pub now: DateTime<Utc>,
    pub invocation_started_at: DateTime<Utc>,
    /// Id of a logged `operator_provided` record offered as confirmation
    pub confirmation_id: Option<&'a str>,
}

impl WriteContext<'_> {
    /// Context for an invocation that starts at `now` with no confirmation.
    #[must_use]
    pub fn new(artifact: ArtifactKind, execution_mode: ExecutionMode, now: DateTime<Utc>) -> Self {
        Self {
            artifact,
            execution_mode,
            now,
            invocation_started_at: now,
            confirmation_id: None,
        }
    }
}

/// The only path to a durable write.
///
/// The writer rebuilds the policy request from the run and the evidence
/// log, so a caller cannot talk it into a write the policy forbids.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedWriter;

impl GuardedWriter {
    pub fn write(
        &self,
        run: &impl GovernedRun,
        evidence: &[Evidence],
        ctx: &WriteContext<'_>,
        path: &Utf8Path,
        bytes: &[u8],
    ) -> Result<AtomicWriteResult, PolicyError> {
        let confirmation = ctx
            .confirmation_id
            .and_then(|id| evidence.iter().find(|e| e.evidence_id == id));
        let request = PersistenceRequest::for_run(
            run,
            ctx.artifact,
            ctx.execution_mode,
            ctx.now,
            ctx.invocation_started_at,
            confirmation,
            bytes.len(),
        );
        let decision = decide(&request);
        if !decision.is_allowed() {
            tracing::warn!(
                artifact = %decision.artifact,
                phase = decision.phase.as_str(),
                reason_code = ?decision.reason_code,
                "write refused by persistence policy"
            );
            return Err(PolicyError::Blocked(decision));
        }
        if let Some(parent) = path.parent() {
            ensure_dir_all(parent).map_err(|source| FsError::CreateDir {
                path: parent.to_string(),
                source,
            })?;
        }
        let result = write_bytes_atomic(path, bytes)?;
        tracing::debug!(artifact = %ctx.artifact, path = %path, "artifact written");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{CONFIRMATION_FIELD, CONFIRMATION_PHRASE};
    use chrono::Duration;
    use phaseguard_evidence::EvidenceClass;
    use phaseguard_reason::ReasonCode;
    use phaseguard_utils::paths::with_isolated_home;
    use phaseguard_utils::test_support::{fixed_now, test_key};
    use phaseguard_utils::types::{GateName, GateStatus, PhaseId};
    use serde_json::json;

    struct Run {
        phase: PhaseId,
        gate: GateName,
        status: GateStatus,
    }

    impl GovernedRun for Run {
        fn current_phase(&self) -> PhaseId {
            self.phase
        }

        fn governing_gate(&self) -> GateName {
            self.gate
        }

        fn gate_status(&self, gate: GateName) -> GateStatus {
            if gate == self.gate { self.status } else { GateStatus::Pending }
        }

        fn session_started_at(&self) -> DateTime<Utc> {
            fixed_now() - Duration::hours(1)
        }
    }

    fn approved_run() -> Run {
        Run {
            phase: PhaseId::RollbackSafety,
            gate: GateName::TestQuality,
            status: GateStatus::Approved,
        }
    }

    fn confirmation(id: &str, text: &str) -> Evidence {
        Evidence::seal(
            id,
            EvidenceClass::OperatorProvided,
            fixed_now(),
            json!({ CONFIRMATION_FIELD: text }),
        )
        .unwrap()
    }

    fn memory(mode: ExecutionMode, confirmation_id: Option<&str>) -> WriteContext<'_> {
        WriteContext {
            confirmation_id,
            ..WriteContext::new(ArtifactKind::WorkspaceMemory, mode, fixed_now())
        }
    }

    #[test]
    fn test_writer_rechecks_policy_before_writing() {
        let home = with_isolated_home();
        let path = artifact_path(&home.layout(), &test_key(), ArtifactKind::WorkspaceMemory);

        let err = GuardedWriter
            .write(&approved_run(), &[], &memory(ExecutionMode::Pipeline, None), &path, b"{\"default\":1}")
            .unwrap_err();
        assert!(matches!(err, PolicyError::Blocked(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_writer_writes_when_allowed() {
        let home = with_isolated_home();
        let path = artifact_path(&home.layout(), &test_key(), ArtifactKind::WorkspaceMemory);
        let log = [confirmation("op", CONFIRMATION_PHRASE)];

        GuardedWriter
            .write(&approved_run(), &log, &memory(ExecutionMode::Interactive, Some("op")), &path, b"{\"default\":1}")
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"default\":1}");
    }

    #[test]
    fn test_gate_status_comes_from_the_run() {
        let home = with_isolated_home();
        let path = artifact_path(&home.layout(), &test_key(), ArtifactKind::WorkspaceMemory);
        let log = [confirmation("op", CONFIRMATION_PHRASE)];
        let run = Run {
            status: GateStatus::Pending,
            ..approved_run()
        };

        let err = GuardedWriter
            .write(&run, &log, &memory(ExecutionMode::Interactive, Some("op")), &path, b"{}")
            .unwrap_err();
        let PolicyError::Blocked(decision) = err else {
            panic!("expected a policy refusal");
        };
        assert_eq!(decision.reason_code, Some(ReasonCode::PersistenceThresholdNotMet));
        assert!(!path.exists());
    }

    #[test]
    fn test_confirmation_must_be_in_the_evidence_log() {
        let home = with_isolated_home();
        let path = artifact_path(&home.layout(), &test_key(), ArtifactKind::WorkspaceMemory);
        let log = [confirmation("op", "persist to workspace memory")];

        for id in ["op", "unlogged"] {
            let err = GuardedWriter
                .write(&approved_run(), &log, &memory(ExecutionMode::Interactive, Some(id)), &path, b"{}")
                .unwrap_err();
            let PolicyError::Blocked(decision) = err else {
                panic!("expected a policy refusal");
            };
            assert_eq!(decision.reason_code, Some(ReasonCode::PersistenceConfirmationRequired), "{id}");
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_observational_write_refused() {
        let home = with_isolated_home();
        let ctx = WriteContext::new(ArtifactKind::RepoCache, ExecutionMode::Interactive, fixed_now());
        let path = artifact_path(&home.layout(), &test_key(), ArtifactKind::RepoCache);
        assert!(GuardedWriter.write(&approved_run(), &[], &ctx, &path, b"").is_err());
    }
}
