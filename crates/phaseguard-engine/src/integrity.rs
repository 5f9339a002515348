//! Session-side integrity guard and the activation smoke test.
//!
//! Each run pins the activation hash it was last governed by. On every
//! commit the guard recomputes it from the active bundle and the run's own
//! inputs; a change with a logged cause is re-pinned, anything else blocks
//! the run with `BLOCKED-HASH-MISMATCH`.

use phaseguard_integrity::{
    ActivationInputs, ActivationPointer, ActivationRecord, ChangeCause, HashVerdict, IntegrityError,
    SmokeTest, StagedBundle, compare,
};
use phaseguard_reason::{ReasonCode, ReasonPayload, ReasonRegistry};
use phaseguard_state::{SCHEMA_VERSION, SessionState, invariants};

/// Fact key under which a run contributes its repository to the hash.
const REPO_FACT: &str = "repo_fingerprint";

/// Manifest compatibility flag for the state schema this engine writes.
#[must_use]
pub fn state_schema_flag() -> String {
    format!("state-schema-v{SCHEMA_VERSION}")
}

/// Activation-hash inputs as seen by one run.
#[must_use]
pub fn session_inputs(
    state: &SessionState,
    active: Option<&ActivationRecord>,
    engine_version: &str,
) -> ActivationInputs {
    let mut capabilities = active.map(|a| a.capabilities.clone()).unwrap_or_default();
    capabilities
        .repo_facts
        .insert(REPO_FACT.to_string(), state.repo_fingerprint.clone());
    ActivationInputs {
        engine_version: engine_version.to_string(),
        pack_hash: active.map(|a| a.ruleset_hash.clone()).unwrap_or_default(),
        lockfile: active.map(|a| a.lock_hash.clone()).unwrap_or_default(),
        capabilities,
        resolved_paths: state.paths.clone(),
    }
}

/// Compare the run's pinned hashes with the current ones and act on it.
///
/// Returns the warning to report when a change was explained.
pub fn guard_session(
    state: &mut SessionState,
    pointer: &ActivationPointer,
    engine_version: &str,
    extra_causes: &[ChangeCause],
) -> Result<Option<(ReasonCode, ReasonPayload)>, IntegrityError> {
    let active = pointer.active.as_ref();
    let current = session_inputs(state, active, engine_version).hashes()?;
    let mut causes: Vec<ChangeCause> = active.map(|a| a.causes.clone()).unwrap_or_default();
    causes.extend_from_slice(extra_causes);

    let verdict = compare(state.integrity_hashes.as_ref(), &current, &causes);
    match &verdict {
        HashVerdict::Unchanged => Ok(None),
        HashVerdict::FirstActivation | HashVerdict::Explained { .. } => {
            state.integrity_hashes = Some(current);
            if let Some(active) = active {
                state.loaded_rulebooks.clear();
                state.loaded_rulebooks.insert(
                    active.bundle.clone(),
                    format!("${{CONFIG_ROOT}}/bundles/{}", active.bundle),
                );
                state
                    .load_evidence
                    .insert(active.bundle.clone(), format!("activation:{}", active.ruleset_hash));
            }
            if let Some((code, payload)) = verdict.reason() {
                tracing::warn!(
                    repo = %state.repo_fingerprint,
                    run_id = %state.run_id,
                    reason_code = code.as_str(),
                    "activation hash change explained"
                );
                return Ok(Some((code, payload)));
            }
            Ok(None)
        }
        HashVerdict::Mismatch { .. } => {
            if let Some((code, payload)) = verdict.reason() {
                tracing::error!(
                    repo = %state.repo_fingerprint,
                    run_id = %state.run_id,
                    changed = ?verdict.changed(),
                    "activation hash changed without a cause"
                );
                state.block(code, payload);
            }
            Ok(None)
        }
    }
}

/// Refuses a bundle that disowns the state schema or that the given runs
/// would not load under.
pub struct StateSmokeTest<'a> {
    pub registry: &'a ReasonRegistry,
    pub sessions: Vec<SessionState>,
}

impl SmokeTest for StateSmokeTest<'_> {
    fn run(&self, bundle: &StagedBundle) -> Result<(), String> {
        let flag = state_schema_flag();
        if bundle.manifest.compatibility.get(&flag) == Some(&false) {
            return Err(format!("{} declares {flag} = false", bundle.label()));
        }
        for state in &self.sessions {
            let violations = invariants::check(state, self.registry);
            if let Some(first) = violations.first() {
                return Err(format!(
                    "run {}/{} fails {}: {}",
                    state.repo_fingerprint, state.run_id, first.invariant, first.detail
                ));
            }
        }
        Ok(())
    }
}
