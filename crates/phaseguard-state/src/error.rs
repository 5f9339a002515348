use thiserror::Error;

use phaseguard_policy::PolicyError;
use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_utils::error::{CanonicalError, ErrorCategory, FsError, UserFriendlyError};
use phaseguard_utils::types::RolloutPhase;

use crate::invariants::Violation;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("No session state at {path}")]
    NotFound { path: String },

    #[error("Session state already exists at {path}")]
    AlreadyExists { path: String },

    #[error("Session state does not match the schema: {detail}")]
    SchemaInvalid { detail: String },

    #[error("Legacy field '{field}' is not accepted during {rollout} (use '{canonical}')")]
    LegacyFieldRejected {
        field: String,
        canonical: String,
        rollout: RolloutPhase,
    },

    #[error("Session state violates {} invariant(s): {}", .0.len(), join_violations(.0))]
    InvariantViolations(Vec<Violation>),

    #[error("Evidence '{evidence_id}' does not resolve a repository identity")]
    IdentityMissing { evidence_id: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StateError {
    /// Primary reason code and payload for reporting this failure.
    #[must_use]
    pub fn reason(&self) -> Option<(ReasonCode, ReasonPayload)> {
        match self {
            Self::SchemaInvalid { detail } => Some((
                ReasonCode::StateSchemaInvalid,
                payload_of([("detail", detail.as_str())]),
            )),
            Self::NotFound { path } => Some((
                ReasonCode::StateSchemaInvalid,
                payload_of([("detail", format!("no session state at {path}"))]),
            )),
            Self::LegacyFieldRejected {
                field, canonical, ..
            } => Some((
                ReasonCode::LegacyFieldRejected,
                payload_of([("field", field.as_str()), ("canonical", canonical.as_str())]),
            )),
            Self::InvariantViolations(violations) => {
                let names: Vec<&str> = violations.iter().map(|v| v.invariant.as_str()).collect();
                let detail = violations
                    .first()
                    .map(|v| v.detail.clone())
                    .unwrap_or_default();
                Some((
                    ReasonCode::InvariantViolation,
                    payload_of([("invariant", names.join(",")), ("detail", detail)]),
                ))
            }
            Self::IdentityMissing { evidence_id } => Some((
                ReasonCode::RepoIdentityMissing,
                payload_of([("evidence_id", evidence_id.as_str())]),
            )),
            Self::Policy(PolicyError::Blocked(decision)) => {
                decision.reason_code.map(|code| (code, decision.payload.clone()))
            }
            _ => None,
        }
    }
}

impl UserFriendlyError for StateError {
    fn user_message(&self) -> String {
        match self {
            Self::NotFound { .. } => "This run has no session state yet".to_string(),
            Self::AlreadyExists { .. } => "This run already has session state".to_string(),
            Self::SchemaInvalid { detail } => format!("Session state is malformed: {detail}"),
            Self::LegacyFieldRejected { field, canonical, .. } => {
                format!("Legacy field '{field}' must be renamed to '{canonical}'")
            }
            Self::InvariantViolations(v) => {
                format!("Session state refused: {} invariant violation(s)", v.len())
            }
            Self::IdentityMissing { evidence_id } => {
                format!("Evidence '{evidence_id}' cannot start a session")
            }
            Self::Policy(e) => e.user_message(),
            Self::Fs(e) => e.user_message(),
            Self::Canonical(e) => format!("Could not canonicalize session state: {e}"),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::InvariantViolations(v) => Some(join_violations(v)),
            Self::LegacyFieldRejected { rollout, .. } => {
                Some(format!("Rollout phase is {rollout}"))
            }
            Self::NotFound { path } | Self::AlreadyExists { path } => Some(path.clone()),
            Self::Policy(e) => e.context(),
            Self::Fs(e) => e.context(),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::NotFound { .. } => vec![
                "Record an identity_signal evidence record to start the run".to_string(),
            ],
            Self::LegacyFieldRejected { .. } => {
                vec!["Run `phaseguard migrate-state` to rewrite legacy fields".to_string()]
            }
            Self::IdentityMissing { .. } => vec![
                "Supply an identity_signal record whose payload has repo_fingerprint".to_string(),
            ],
            Self::Policy(e) => e.suggestions(),
            Self::Fs(e) => e.suggestions(),
            _ => Vec::new(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fs(_) => ErrorCategory::FileSystem,
            Self::Policy(_) => ErrorCategory::Workflow,
            Self::Canonical(_) => ErrorCategory::Integrity,
            _ => ErrorCategory::Validation,
        }
    }
}
