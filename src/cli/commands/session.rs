//! Commands scoped to one run: each opens an [`EngineHandle`], runs one
//! operation and releases the run lock.

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use super::CommandError;
use super::input::{ClaimInput, EvidenceInput, read_json};
use crate::cli::args::RunArgs;
use crate::gate::ReviewInput;
use crate::integrity::ChangeCause;
use crate::policy::ArtifactKind;
use crate::state::{DecisionSurface, RollbackAuthorization};
use crate::{Config, EngineError, EngineHandle, GateName, OperationReport, OutputEnvelope, PhaseId, SessionKey};

pub(crate) fn session_key(run: &RunArgs) -> Result<SessionKey, EngineError> {
    SessionKey::new(run.repo.trim(), run.run.trim()).map_err(|e| EngineError::InvalidInput(e.to_string()))
}

/// Open the run, apply `op`, close. A refusal is reported against the
/// phase the run is in.
fn with_handle<F>(config: &Config, run: &RunArgs, now: DateTime<Utc>, op: F) -> Result<OutputEnvelope, CommandError>
where
    F: FnOnce(&mut EngineHandle) -> Result<OperationReport, EngineError>,
{
    let key = session_key(run)?;
    let mut handle = match EngineHandle::open_at(config.clone(), key.clone(), now) {
        Ok(handle) => handle,
        Err(e) => return Err(CommandError::in_run(e, key, None)),
    };
    let result = op(&mut handle);
    let outcome = match result {
        Ok(report) => {
            tracing::debug!(
                session = %key,
                transitions = report.transitions.len(),
                unchanged = report.state_unchanged,
                "operation complete"
            );
            Ok(report.envelope)
        }
        Err(error) => {
            let phase = handle.status().ok().map(|r| r.state.current_phase());
            Err(CommandError::in_run(error, key, phase))
        }
    };
    if let Err(e) = handle.close() {
        tracing::warn!(error = %e, "run lock was not released cleanly");
    }
    outcome
}

pub fn execute_status_command(config: &Config, run: &RunArgs, now: DateTime<Utc>) -> Result<OutputEnvelope, CommandError> {
    with_handle(config, run, now, |handle| handle.status())
}

pub fn execute_evidence_add_command(
    config: &Config,
    run: &RunArgs,
    file: &Utf8Path,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let evidence = read_json::<EvidenceInput>(file, "evidence")?.seal(now)?;
    with_handle(config, run, now, |handle| handle.record_evidence(evidence, now))
}

pub fn execute_claim_add_command(
    config: &Config,
    run: &RunArgs,
    file: &Utf8Path,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let (claim_id, entry) = read_json::<ClaimInput>(file, "claim")?.into_entry()?;
    with_handle(config, run, now, |handle| handle.assert_claim(&claim_id, entry, now))
}

pub fn execute_review_command(
    config: &Config,
    run: &RunArgs,
    gate: &str,
    review: &Utf8Path,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let gate: GateName = gate.parse().map_err(EngineError::InvalidInput)?;
    let review: ReviewInput = read_json(review, "review")?;
    with_handle(config, run, now, |handle| handle.submit_review(gate, &review, now))
}

pub fn execute_advance_command(config: &Config, run: &RunArgs, now: DateTime<Utc>) -> Result<OutputEnvelope, CommandError> {
    with_handle(config, run, now, |handle| handle.advance(now))
}

pub fn execute_rollback_phase_command(
    config: &Config,
    run: &RunArgs,
    to: &str,
    authorized_by: Option<&str>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let target: PhaseId = to.parse().map_err(EngineError::InvalidInput)?;
    let authorization = authorized_by.map(|by| RollbackAuthorization {
        target,
        authorized_by: by.to_string(),
        reason: reason.unwrap_or_default().to_string(),
    });
    with_handle(config, run, now, |handle| {
        handle.request_phase(target, authorization.as_ref(), now)
    })
}

pub fn execute_persist_command(
    config: &Config,
    run: &RunArgs,
    artifact: &str,
    content: &Utf8Path,
    confirm: Option<&str>,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let artifact: ArtifactKind = artifact.parse().map_err(EngineError::InvalidInput)?;
    let bytes = std::fs::read(content).map_err(EngineError::from)?;
    with_handle(config, run, now, |handle| handle.persist(artifact, &bytes, confirm, now))
}

pub fn execute_assess_command(
    config: &Config,
    run: &RunArgs,
    confidence: u8,
    question: Option<&str>,
    options: &[String],
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let surface = question.map(|question| DecisionSurface {
        question: question.to_string(),
        options: options.to_vec(),
    });
    with_handle(config, run, now, |handle| handle.assess(confidence, surface, now))
}

pub fn execute_explain_change_command(
    config: &Config,
    run: &RunArgs,
    causes: &Utf8Path,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    let causes: Vec<ChangeCause> = read_json(causes, "change causes")?;
    with_handle(config, run, now, |handle| handle.explain_change(&causes, now))
}

pub fn execute_migrate_state_command(
    config: &Config,
    run: &RunArgs,
    now: DateTime<Utc>,
) -> Result<OutputEnvelope, CommandError> {
    with_handle(config, run, now, |handle| handle.migrate_state(now))
}
