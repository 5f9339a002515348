//! Engine-level bundle operations: activation and rollback.
//!
//! Neither is tied to a run. Both hold the engine lock, so two activations
//! never interleave their pointer writes.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use phaseguard_config::Config;
use phaseguard_integrity::{
    ActivationOutcome, LOCK_FILE, LifecycleManager, MANIFEST_FILE, RollbackRecord, RollbackTrigger,
    StagedBundle, stage,
};
use phaseguard_lock::{LockOptions, SessionLock};
use phaseguard_reason::{ReasonRegistry, RenderContext};
use phaseguard_state::{SessionRepository, StateOptions};
use phaseguard_utils::paths::{Layout, ensure_dir_all};
use phaseguard_utils::types::SessionKey;

use crate::envelope::OutputEnvelope;
use crate::error::EngineError;
use crate::integrity::StateSmokeTest;

const ENGINE_HOLDER: &str = "engine";

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub envelope: OutputEnvelope,
    pub outcome: ActivationOutcome,
    /// Engine-owned copy the pointer refers to
    pub staged_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub envelope: OutputEnvelope,
    pub rollback: RollbackRecord,
}

pub(crate) fn lock_options(config: &Config) -> LockOptions {
    LockOptions {
        wait: config.lock.wait(),
        poll: config.lock.poll(),
        stale_after: config.lock.stale_after(),
    }
}

pub(crate) fn load_registry(config: &Config) -> Result<ReasonRegistry, EngineError> {
    Ok(match &config.registry.path {
        Some(path) => ReasonRegistry::from_path(path)?,
        None => ReasonRegistry::builtin()?,
    })
}

fn engine_lock(config: &Config, layout: &Layout) -> Result<SessionLock, EngineError> {
    Ok(SessionLock::acquire(
        &layout.engine_dir().join(".lock.d"),
        ENGINE_HOLDER,
        &lock_options(config),
    )?)
}

/// Copy a verified bundle under the engine's staging area so later edits to
/// the source cannot change what is active.
fn copy_to_staging(layout: &Layout, staged: &StagedBundle) -> Result<Utf8PathBuf, EngineError> {
    let short = staged.ruleset_hash.get(..12).unwrap_or(&staged.ruleset_hash);
    let dest = layout.staged_dir().join(format!(
        "{}-{}-{short}",
        staged.manifest.name, staged.manifest.version
    ));
    if dest.exists() {
        std::fs::remove_dir_all(&dest)?;
    }
    let files = [MANIFEST_FILE, LOCK_FILE]
        .into_iter()
        .map(str::to_string)
        .chain(staged.manifest.files.iter().map(|f| f.path.clone()));
    for rel in files {
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            ensure_dir_all(parent)?;
        }
        std::fs::copy(staged.dir.join(&rel), &target)?;
    }
    Ok(dest)
}

/// Stage `source`, copy it into the engine area and make it active.
///
/// `session`, when given, is a run whose state must still pass its
/// invariants under the new bundle.
pub fn activate_bundle(
    config: &Config,
    source: &Utf8Path,
    session: Option<&SessionKey>,
    now: DateTime<Utc>,
) -> Result<ActivationReport, EngineError> {
    let layout = config.layout();
    let lock = engine_lock(config, &layout)?;
    let registry = load_registry(config)?;
    let lifecycle = LifecycleManager::new(layout.clone(), config.engine.version.clone(), config.execution_mode());

    let verified = lifecycle.stage(source)?;
    let staged_dir = copy_to_staging(&layout, &verified)?;
    let staged = stage(&staged_dir, &config.engine.version)?;

    let mut sessions = Vec::new();
    if let Some(key) = session {
        let repository = SessionRepository::new(
            layout.clone(),
            key.clone(),
            StateOptions {
                default_rollout: config.state.rollout,
                allow_legacy_fields: config.state.allow_legacy_fields,
                execution_mode: config.execution_mode(),
            },
        );
        sessions.push(repository.load(&registry)?.state);
    }
    let smoke = StateSmokeTest {
        registry: &registry,
        sessions,
    };
    let outcome = lifecycle.activate(&staged, &smoke, &[], now)?;
    lock.release()?;

    let ctx = RenderContext::engine();
    let envelope = match &outcome {
        ActivationOutcome::Activated { record, verdict } => {
            let warning = verdict.reason().map(|(code, payload)| registry.emit(code, payload, &ctx));
            tracing::info!(bundle = %record.label(), "activation complete");
            OutputEnvelope::for_engine(
                warning.as_ref(),
                format!("phaseguard status --repo {} --run {}", ctx.repo, ctx.run_id),
            )
        }
        ActivationOutcome::RolledBack { rollback, verdict } => {
            let refusal = verdict.reason().map(|(code, payload)| registry.emit(code, payload, &ctx));
            tracing::warn!(restored = %rollback.restored, "activation rolled back");
            OutputEnvelope::for_engine(
                refusal.as_ref(),
                "Bump the bundle version, regenerate bundle.lock, then run `phaseguard activate --bundle <dir>`",
            )
        }
    };
    Ok(ActivationReport {
        envelope,
        outcome,
        staged_dir,
    })
}

/// Restore the previous bundle on operator request.
pub fn rollback_engine(
    config: &Config,
    trigger: RollbackTrigger,
    now: DateTime<Utc>,
) -> Result<RollbackReport, EngineError> {
    let layout = config.layout();
    let lock = engine_lock(config, &layout)?;
    let registry = load_registry(config)?;
    let lifecycle = LifecycleManager::new(layout, config.engine.version.clone(), config.execution_mode());
    let rollback = lifecycle.rollback(trigger, now)?;
    lock.release()?;

    let (code, payload) = rollback.reason();
    let emission = registry.emit(code, payload, &RenderContext::engine());
    let envelope = OutputEnvelope::for_engine(Some(&emission), emission.next_command.clone());
    Ok(RollbackReport { envelope, rollback })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use phaseguard_integrity::lock_bundle;
    use phaseguard_utils::canonicalization::blake3_hex;

    /// Write a one-file bundle and lock it.
    pub(crate) fn write_bundle(dir: &Utf8Path, version: &str, rules: &str) {
        std::fs::create_dir_all(dir.join("rules")).unwrap();
        std::fs::write(dir.join("rules/core.md"), rules).unwrap();
        let manifest = format!(
            "name = \"core\"\nversion = \"{version}\"\nmin_engine_version = \"0.1.0\"\n\n\
             [compatibility]\nstate-schema-v1 = true\n\n\
             [[file]]\npath = \"rules/core.md\"\nblake3 = \"{}\"\n",
            blake3_hex(rules.as_bytes())
        );
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        lock_bundle(dir).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::write_bundle;
    use super::*;
    use crate::envelope::EnvelopeStatus;
    use phaseguard_utils::exit_codes::ExitCode;
    use phaseguard_utils::paths::with_isolated_home;
    use phaseguard_utils::test_support::fixed_now;

    fn config(home: &Utf8Path) -> Config {
        Config::builder()
            .home(home.to_path_buf())
            .engine_version("1.0.0")
            .build()
            .unwrap()
    }

    #[test]
    fn test_activation_copies_bundle_out_of_source() {
        let home = with_isolated_home();
        let cfg = config(&home.home());
        let source = home.home().join("src-bundle");
        write_bundle(&source, "1.0.0", "rule one");

        let report = activate_bundle(&cfg, &source, None, fixed_now()).unwrap();
        assert!(matches!(report.outcome, ActivationOutcome::Activated { .. }));
        assert!(report.staged_dir.starts_with(cfg.layout().staged_dir()));
        assert_eq!(report.envelope.status, EnvelopeStatus::Ok);

        // editing the source leaves the active copy intact
        std::fs::write(source.join("rules/core.md"), "edited").unwrap();
        let lifecycle = LifecycleManager::new(cfg.layout(), cfg.engine.version.clone(), cfg.execution_mode());
        assert!(lifecycle.verify_active(fixed_now()).unwrap().is_none());
    }

    #[test]
    fn test_same_version_new_content_is_an_integrity_refusal() {
        let home = with_isolated_home();
        let cfg = config(&home.home());
        let first = home.home().join("first");
        write_bundle(&first, "1.0.0", "rule one");
        activate_bundle(&cfg, &first, None, fixed_now()).unwrap();

        let second = home.home().join("second");
        write_bundle(&second, "1.0.0", "rule one, quietly changed");
        let report = activate_bundle(&cfg, &second, None, fixed_now()).unwrap();
        assert!(matches!(report.outcome, ActivationOutcome::RolledBack { .. }));
        assert_eq!(report.envelope.status, EnvelopeStatus::Blocked);
        assert_eq!(report.envelope.reason_code.as_deref(), Some("BLOCKED-HASH-MISMATCH"));
        assert_eq!(report.envelope.exit_code(), ExitCode::INTEGRITY);
    }

    #[test]
    fn test_rollback_without_previous_is_unavailable() {
        let home = with_isolated_home();
        let cfg = config(&home.home());
        let err = rollback_engine(&cfg, RollbackTrigger::BundleIncompatible, fixed_now()).unwrap_err();
        assert_eq!(err.to_exit_code(), ExitCode::INTEGRITY);
        assert_eq!(
            err.reason().unwrap().0,
            phaseguard_reason::ReasonCode::RollbackUnavailable
        );
    }

    #[test]
    fn test_rollback_restores_previous_bundle() {
        let home = with_isolated_home();
        let cfg = config(&home.home());
        for (i, version) in ["1.0.0", "1.1.0"].iter().enumerate() {
            let dir = home.home().join(format!("b{i}"));
            write_bundle(&dir, version, &format!("rules {version}"));
            activate_bundle(&cfg, &dir, None, fixed_now()).unwrap();
        }
        let report = rollback_engine(&cfg, RollbackTrigger::BundleIncompatible, fixed_now()).unwrap();
        assert_eq!(report.rollback.restored, "core@1.0.0");
        assert_eq!(report.envelope.status, EnvelopeStatus::Warn);
        assert_eq!(report.envelope.reason_code.as_deref(), Some("WARN-ROLLBACK-PERFORMED"));
    }
}
