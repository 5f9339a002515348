//! Engine-level commands: bundle activation and rollback.

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use super::CommandError;
use super::session::session_key;
use crate::cli::args::RunArgs;
use crate::integrity::{ActivationOutcome, RollbackTrigger};
use crate::{Config, EngineError, OutputEnvelope, activate_bundle, rollback_engine};

pub fn execute_activate_command(
    config: &Config,
    bundle: &Utf8Path,
    repo: Option<&str>,
    run: Option<&str>,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let session = match (repo, run) {
        (Some(repo), Some(run)) => Some(session_key(&RunArgs {
            repo: repo.to_string(),
            run: run.to_string(),
        })?),
        _ => None,
    };
    let report = activate_bundle(config, bundle, session.as_ref(), now)?;
    match &report.outcome {
        ActivationOutcome::Activated { record, .. } => {
            tracing::info!(bundle = %record.label(), staged = %report.staged_dir, "bundle active");
        }
        ActivationOutcome::RolledBack { rollback, .. } => {
            tracing::warn!(restored = %rollback.restored, "bundle refused, previous bundle kept");
        }
    }
    Ok(report.envelope)
}

pub fn execute_rollback_engine_command(
    config: &Config,
    trigger: &str,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let trigger: RollbackTrigger = trigger.parse().map_err(EngineError::InvalidInput)?;
    let report = rollback_engine(config, trigger, now)?;
    Ok(report.envelope)
}
