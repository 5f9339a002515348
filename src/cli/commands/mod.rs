//! CLI command implementations.
//!
//! Every `execute_*` function returns the envelope to print. Failures carry
//! enough context (run key, current phase) for `run.rs` to render an error
//! envelope against the right phase.

mod engine;
mod input;
mod registry;
mod session;

use crate::{EngineError, PhaseId, SessionKey};

pub use engine::{execute_activate_command, execute_rollback_engine_command};
pub use registry::execute_registry_check_command;
pub use session::{
    execute_assess_command, execute_claim_add_command, execute_evidence_add_command,
    execute_explain_change_command, execute_migrate_state_command, execute_persist_command,
    execute_review_command, execute_rollback_phase_command, execute_status_command,
    execute_advance_command,
};

/// A refused command and where it was refused.
#[derive(Debug)]
pub struct CommandError {
    pub error: EngineError,
    pub key: Option<SessionKey>,
    pub phase: Option<PhaseId>,
}

impl CommandError {
    pub(crate) fn in_run(error: EngineError, key: SessionKey, phase: Option<PhaseId>) -> Self {
        Self {
            error,
            key: Some(key),
            phase,
        }
    }
}

impl From<EngineError> for CommandError {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            key: None,
            phase: None,
        }
    }
}
