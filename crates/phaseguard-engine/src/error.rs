use thiserror::Error;

use phaseguard_config::ConfigError;
use phaseguard_evidence::EvidenceError;
use phaseguard_gate::GateError;
use phaseguard_integrity::IntegrityError;
use phaseguard_lock::LockError;
use phaseguard_policy::PolicyError;
use phaseguard_reason::{ReasonCode, ReasonPayload, RegistryError, payload_of};
use phaseguard_router::RouterError;
use phaseguard_state::StateError;
use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use phaseguard_utils::exit_codes::ExitCode;

/// Every failure an engine operation can surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("Run has no session state; the first record must be an identity_signal (got '{evidence_id}')")]
    NoSession { evidence_id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Primary reason code for the failure, when it has one.
    #[must_use]
    pub fn reason(&self) -> Option<(ReasonCode, ReasonPayload)> {
        match self {
            Self::Lock(LockError::Contention { waited_ms, .. }) => Some((
                ReasonCode::LockContention,
                payload_of([("waited_ms", waited_ms.to_string())]),
            )),
            Self::Evidence(EvidenceError::Integrity { evidence_id }) => Some((
                ReasonCode::EvidenceIntegrity,
                payload_of([("evidence_id", evidence_id.as_str())]),
            )),
            Self::Evidence(EvidenceError::Duplicate { evidence_id }) => Some((
                ReasonCode::InvariantViolation,
                payload_of([
                    ("invariant", "evidence-immutable".to_string()),
                    ("detail", format!("evidence '{evidence_id}' is already recorded")),
                ]),
            )),
            Self::Evidence(EvidenceError::CorruptLog { path, line, reason }) => Some((
                ReasonCode::StateSchemaInvalid,
                payload_of([("detail", format!("{path}:{line}: {reason}"))]),
            )),
            Self::State(e) => e.reason(),
            Self::Gate(e) => Some(e.reason()),
            Self::Router(e) => Some(e.reason()),
            Self::Policy(PolicyError::Blocked(decision)) => decision
                .reason_code
                .map(|code| (code, decision.payload.clone())),
            Self::Integrity(e) => Some(e.reason()),
            Self::NoSession { evidence_id } => Some((
                ReasonCode::RepoIdentityMissing,
                payload_of([("evidence_id", evidence_id.as_str())]),
            )),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) | Self::Registry(_) | Self::InvalidInput(_) => ExitCode::CLI_ARGS,
            Self::Lock(e) if e.is_retryable() => ExitCode::LOCK_HELD,
            Self::Gate(GateError::AwaitingHuman { .. }) => ExitCode::NEEDS_HUMAN,
            Self::Integrity(IntegrityError::Fs(_) | IntegrityError::Canonical(_)) => {
                ExitCode::INTERNAL
            }
            Self::Integrity(_) => ExitCode::INTEGRITY,
            Self::State(StateError::Fs(_) | StateError::Canonical(_))
            | Self::Evidence(EvidenceError::Fs(_))
            | Self::Policy(PolicyError::Fs(_))
            | Self::Lock(_)
            | Self::Io(_) => ExitCode::INTERNAL,
            Self::Evidence(_)
            | Self::State(_)
            | Self::Gate(_)
            | Self::Router(_)
            | Self::Policy(_)
            | Self::NoSession { .. } => ExitCode::BLOCKED,
        }
    }
}

impl UserFriendlyError for EngineError {
    fn user_message(&self) -> String {
        match self {
            Self::Config(e) => e.user_message(),
            Self::Registry(e) => e.user_message(),
            Self::Lock(e) => e.user_message(),
            Self::Evidence(e) => e.user_message(),
            Self::State(e) => e.user_message(),
            Self::Gate(e) => e.user_message(),
            Self::Router(e) => e.user_message(),
            Self::Policy(e) => e.user_message(),
            Self::Integrity(e) => e.user_message(),
            Self::NoSession { .. } => "This run has not been started".to_string(),
            Self::InvalidInput(detail) => format!("Invalid input: {detail}"),
            Self::Io(e) => format!("IO error: {e}"),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Config(e) => e.context(),
            Self::Registry(e) => e.context(),
            Self::Lock(e) => e.context(),
            Self::Evidence(e) => e.context(),
            Self::State(e) => e.context(),
            Self::Gate(e) => e.context(),
            Self::Router(e) => e.context(),
            Self::Policy(e) => e.context(),
            Self::Integrity(e) => e.context(),
            Self::NoSession { .. } => {
                Some("A run starts from an identity_signal record naming the repository".to_string())
            }
            Self::InvalidInput(_) | Self::Io(_) => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Config(e) => e.suggestions(),
            Self::Registry(e) => e.suggestions(),
            Self::Lock(e) => e.suggestions(),
            Self::Evidence(e) => e.suggestions(),
            Self::State(e) => e.suggestions(),
            Self::Gate(e) => e.suggestions(),
            Self::Router(e) => e.suggestions(),
            Self::Policy(e) => e.suggestions(),
            Self::Integrity(e) => e.suggestions(),
            Self::NoSession { .. } => vec![
                "Record an identity_signal with `phaseguard evidence add` first".to_string(),
            ],
            Self::InvalidInput(_) => vec!["Check the command arguments with --help".to_string()],
            Self::Io(_) => vec!["Check permissions on the phaseguard home directory".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Registry(_) => ErrorCategory::Configuration,
            Self::Lock(_) => ErrorCategory::Concurrency,
            Self::Evidence(_) | Self::InvalidInput(_) => ErrorCategory::Validation,
            Self::State(e) => e.category(),
            Self::Gate(_) | Self::Router(_) | Self::Policy(_) | Self::NoSession { .. } => {
                ErrorCategory::Workflow
            }
            Self::Integrity(e) => e.category(),
            Self::Io(_) => ErrorCategory::FileSystem,
        }
    }
}
