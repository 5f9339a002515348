use thiserror::Error;

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use phaseguard_utils::types::{GateName, PhaseId};

/// Requests a gate refuses to evaluate at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Gate {gate} cannot be evaluated during phase {phase}")]
    WrongPhase { gate: GateName, phase: PhaseId },

    #[error("Gate {gate} is waiting for a human after {iteration} iteration(s)")]
    AwaitingHuman { gate: GateName, iteration: u32 },

    #[error("Gate {gate} takes review feedback, not evidence")]
    NotEvidenceBacked { gate: GateName },

    #[error("Gate {gate} is decided from evidence, not review feedback")]
    NotIterative { gate: GateName },
}

impl GateError {
    #[must_use]
    pub fn reason(&self) -> (ReasonCode, ReasonPayload) {
        match self {
            Self::WrongPhase { gate, phase } => (
                ReasonCode::PhaseMismatch,
                payload_of([("expected", gate.phase().token()), ("actual", phase.token())]),
            ),
            Self::AwaitingHuman { gate, iteration } => (
                ReasonCode::EscalatedToHuman,
                payload_of([("gate", gate.as_str().to_string()), ("iteration", iteration.to_string())]),
            ),
            Self::NotEvidenceBacked { gate } | Self::NotIterative { gate } => (
                ReasonCode::PhaseMismatch,
                payload_of([("expected", gate.phase().token()), ("actual", gate.as_str())]),
            ),
        }
    }
}

impl UserFriendlyError for GateError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::WrongPhase { gate, .. } => {
                Some(format!("{gate} belongs to phase {}", gate.phase()))
            }
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::WrongPhase { .. } => {
                vec!["Run `phaseguard status` to see which phase is current".to_string()]
            }
            Self::AwaitingHuman { .. } => vec![
                "An operator must decide; use `phaseguard rollback-phase` with an authorization to rework"
                    .to_string(),
            ],
            Self::NotEvidenceBacked { .. } => {
                vec!["Submit review feedback with `phaseguard review`".to_string()]
            }
            Self::NotIterative { .. } => {
                vec!["Record evidence and run `phaseguard advance`".to_string()]
            }
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Workflow
    }
}
