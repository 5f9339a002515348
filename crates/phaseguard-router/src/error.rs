use thiserror::Error;

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use phaseguard_utils::types::PhaseId;

/// A phase request the router refuses. The state is left untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Cannot move from {current} back to {requested} without an authorized rollback")]
    MonotonicityViolation { current: PhaseId, requested: PhaseId },

    #[error("Rollback to {target} needs an operator name, a reason and a matching target")]
    RollbackNotAuthorized { target: PhaseId },

    #[error("Cannot enter {requested}: preconditions of {unsatisfied} are not met")]
    PhaseMismatch {
        unsatisfied: PhaseId,
        requested: PhaseId,
    },
}

impl RouterError {
    #[must_use]
    pub fn reason(&self) -> (ReasonCode, ReasonPayload) {
        match self {
            Self::MonotonicityViolation { current, requested } => (
                ReasonCode::MonotonicityViolation,
                payload_of([("current", current.as_str()), ("requested", requested.as_str())]),
            ),
            Self::RollbackNotAuthorized { target } => (
                ReasonCode::RollbackNotAuthorized,
                payload_of([("target", target.as_str())]),
            ),
            Self::PhaseMismatch {
                unsatisfied,
                requested,
            } => (
                ReasonCode::PhaseMismatch,
                payload_of([("expected", unsatisfied.as_str()), ("actual", requested.as_str())]),
            ),
        }
    }
}

impl UserFriendlyError for RouterError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::MonotonicityViolation { .. } => {
                Some("Phase ordinals never decrease except through a recorded rollback".to_string())
            }
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::MonotonicityViolation { requested, .. }
            | Self::RollbackNotAuthorized { target: requested } => vec![format!(
                "Run `phaseguard rollback-phase --to {requested} --authorized-by <operator> --reason <text>`"
            )],
            Self::PhaseMismatch { unsatisfied, .. } => vec![format!(
                "Provide the artifacts or gate approval {unsatisfied} requires, then run `phaseguard advance`"
            )],
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Workflow
    }
}
