//! Staged activation and rollback of the rule bundle.
//!
//! `activation.json` holds a two-slot pointer: the active bundle and at most
//! one previous known-good bundle. Every change to it is a whole-file atomic
//! replace. Rollbacks restore `previous` and leave that slot empty, and each
//! one appends a record to `audit.jsonl`.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_state::IntegrityHashes;
use phaseguard_utils::atomic_write::{append_line, read_optional, write_file_atomic};
use phaseguard_utils::canonicalization::emit_jcs;
use phaseguard_utils::paths::Layout;
use phaseguard_utils::types::ExecutionMode;

use crate::bundle::{StagedBundle, stage};
use crate::error::IntegrityError;
use crate::hash::{ActivationInputs, Capabilities, ChangeCause, HashVerdict, compare};

/// Consecutive failed starts that count as a crash loop.
pub const CRASH_LOOP_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackTrigger {
    StartupCrashLoop,
    BundleIncompatible,
    IntegrityMismatch,
}

impl RollbackTrigger {
    pub const ALL: [RollbackTrigger; 3] = [
        Self::StartupCrashLoop,
        Self::BundleIncompatible,
        Self::IntegrityMismatch,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StartupCrashLoop => "startup-crash-loop",
            Self::BundleIncompatible => "bundle-incompatible",
            Self::IntegrityMismatch => "integrity-mismatch",
        }
    }
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| {
                format!(
                    "Unknown rollback trigger '{s}'. Valid triggers: startup-crash-loop, bundle-incompatible, integrity-mismatch"
                )
            })
    }
}

/// One slot of the activation pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub bundle: String,
    pub version: String,
    pub dir: String,
    pub ruleset_hash: String,
    pub lock_hash: String,
    pub engine_version: String,
    /// Capability facts the activation hash was computed over
    #[serde(default)]
    pub capabilities: Capabilities,
    pub hashes: IntegrityHashes,
    pub activated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<ChangeCause>,
}

impl ActivationRecord {
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.bundle, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPointer {
    pub active: Option<ActivationRecord>,
    pub previous: Option<ActivationRecord>,
}

/// Deviation record for a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub trigger: RollbackTrigger,
    pub restored: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displaced: Option<String>,
    pub at: DateTime<Utc>,
}

impl RollbackRecord {
    #[must_use]
    pub fn reason(&self) -> (ReasonCode, ReasonPayload) {
        (
            ReasonCode::RollbackPerformed,
            payload_of([("trigger", self.trigger.as_str()), ("restored", self.restored.as_str())]),
        )
    }
}

/// Line in `audit.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuditEntry {
    Activation {
        at: DateTime<Utc>,
        bundle: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        replaced: Option<String>,
        changed_categories: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        causes: Vec<ChangeCause>,
    },
    Rollback {
        #[serde(flatten)]
        record: RollbackRecord,
        reason_code: ReasonCode,
        payload: ReasonPayload,
    },
    /// Operator-logged cause for a hash change seen by a session
    Cause {
        at: DateTime<Utc>,
        session: String,
        causes: Vec<ChangeCause>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActivationOutcome {
    Activated {
        record: ActivationRecord,
        verdict: HashVerdict,
    },
    /// The flip happened, the hash check failed, and the previous bundle is
    /// active again.
    RolledBack {
        rollback: RollbackRecord,
        verdict: HashVerdict,
    },
}

/// Check run against the current state before a staged bundle goes live.
pub trait SmokeTest {
    fn run(&self, bundle: &StagedBundle) -> Result<(), String>;
}

impl<F> SmokeTest for F
where
    F: Fn(&StagedBundle) -> Result<(), String>,
{
    fn run(&self, bundle: &StagedBundle) -> Result<(), String> {
        self(bundle)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StartupLog {
    consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    layout: Layout,
    engine_version: String,
    execution_mode: ExecutionMode,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(layout: Layout, engine_version: impl Into<String>, execution_mode: ExecutionMode) -> Self {
        Self {
            layout,
            engine_version: engine_version.into(),
            execution_mode,
        }
    }

    pub fn pointer(&self) -> Result<ActivationPointer, IntegrityError> {
        let path = self.layout.activation_file();
        match read_optional(&path)? {
            None => Ok(ActivationPointer::default()),
            Some(text) => serde_json::from_str(&text).map_err(|e| IntegrityError::Pointer {
                detail: format!("{path}: {e}"),
            }),
        }
    }

    fn write_pointer(&self, pointer: &ActivationPointer) -> Result<(), IntegrityError> {
        write_file_atomic(&self.layout.activation_file(), &emit_jcs(pointer)?)?;
        Ok(())
    }

    fn audit(&self, entry: &AuditEntry) -> Result<(), IntegrityError> {
        append_line(&self.layout.audit_file(), &emit_jcs(entry)?)?;
        Ok(())
    }

    /// Every audit record, oldest first.
    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>, IntegrityError> {
        let Some(text) = read_optional(&self.layout.audit_file())? else {
            return Ok(Vec::new());
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| IntegrityError::Pointer {
                    detail: format!("audit record: {e}"),
                })
            })
            .collect()
    }

    /// Append operator-supplied change causes for `session` to the audit trail.
    pub fn log_causes(
        &self,
        session: &str,
        causes: &[ChangeCause],
        now: DateTime<Utc>,
    ) -> Result<(), IntegrityError> {
        self.audit(&AuditEntry::Cause {
            at: now,
            session: session.to_string(),
            causes: causes.to_vec(),
        })?;
        tracing::info!(session, causes = causes.len(), "hash change causes logged");
        Ok(())
    }

    pub fn stage(&self, dir: &Utf8Path) -> Result<StagedBundle, IntegrityError> {
        stage(dir, &self.engine_version)
    }

    /// Activation-hash inputs for a staged bundle.
    #[must_use]
    pub fn activation_inputs(&self, staged: &StagedBundle) -> ActivationInputs {
        let name = &staged.manifest.name;
        let resolved_paths: BTreeMap<String, String> = staged
            .file_hashes
            .iter()
            .map(|(path, _)| (path.clone(), format!("${{CONFIG_ROOT}}/bundles/{name}/{path}")))
            .collect();
        ActivationInputs {
            engine_version: self.engine_version.clone(),
            pack_hash: staged.ruleset_hash.clone(),
            lockfile: staged.lock_hash.clone(),
            capabilities: Capabilities {
                repo_facts: BTreeMap::new(),
                signals: staged.manifest.capabilities.clone(),
                execution_mode: self.execution_mode,
            },
            resolved_paths,
        }
    }

    /// Smoke-test `staged`, flip the pointer to it, then check the new
    /// activation hash. An unexplained change rolls straight back.
    pub fn activate(
        &self,
        staged: &StagedBundle,
        smoke: &dyn SmokeTest,
        extra_causes: &[ChangeCause],
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, IntegrityError> {
        smoke.run(staged).map_err(|detail| IntegrityError::SmokeTestFailed {
            bundle: staged.label(),
            detail,
        })?;

        let mut pointer = self.pointer()?;
        let inputs = self.activation_inputs(staged);
        let hashes = inputs.hashes()?;
        let mut causes = extra_causes.to_vec();
        match &pointer.active {
            Some(active) => {
                if active.bundle != staged.manifest.name || active.version != staged.manifest.version {
                    causes.push(ChangeCause::BundleVersionBump {
                        bundle: staged.manifest.name.clone(),
                        from: active.version.clone(),
                        to: staged.manifest.version.clone(),
                    });
                    if active.capabilities.signals != inputs.capabilities.signals {
                        causes.push(ChangeCause::CapabilityChange {
                            detail: format!("{} declares different capabilities", staged.label()),
                        });
                    }
                }
                if active.engine_version != self.engine_version {
                    causes.push(ChangeCause::EngineUpgrade {
                        from: active.engine_version.clone(),
                        to: self.engine_version.clone(),
                    });
                }
                if active.capabilities.execution_mode != self.execution_mode {
                    causes.push(ChangeCause::CapabilityChange {
                        detail: format!(
                            "execution mode {} -> {}",
                            active.capabilities.execution_mode, self.execution_mode
                        ),
                    });
                }
            }
            // sessions pinned before any bundle was active see every bundle input change
            None => {
                causes.push(ChangeCause::BundleVersionBump {
                    bundle: staged.manifest.name.clone(),
                    from: "none".to_string(),
                    to: staged.manifest.version.clone(),
                });
                causes.push(ChangeCause::CapabilityChange {
                    detail: format!("{} is the first active bundle", staged.label()),
                });
            }
        }
        let verdict = compare(pointer.active.as_ref().map(|a| &a.hashes), &hashes, &causes);
        if verdict == HashVerdict::Unchanged
            && let Some(active) = &pointer.active
        {
            tracing::info!(bundle = %active.label(), "bundle already active");
            return Ok(ActivationOutcome::Activated {
                record: active.clone(),
                verdict,
            });
        }

        let record = ActivationRecord {
            bundle: staged.manifest.name.clone(),
            version: staged.manifest.version.clone(),
            dir: staged.dir.to_string(),
            ruleset_hash: staged.ruleset_hash.clone(),
            lock_hash: staged.lock_hash.clone(),
            engine_version: self.engine_version.clone(),
            capabilities: inputs.capabilities,
            hashes,
            activated_at: now,
            causes: causes.clone(),
        };
        let replaced = pointer.active.as_ref().map(ActivationRecord::label);
        pointer.previous = pointer.active.take();
        pointer.active = Some(record.clone());
        self.write_pointer(&pointer)?;
        self.audit(&AuditEntry::Activation {
            at: now,
            bundle: record.label(),
            replaced,
            changed_categories: verdict.changed().iter().map(|c| c.as_str().to_string()).collect(),
            causes,
        })?;
        tracing::info!(bundle = %record.label(), "bundle activated");

        if verdict.is_mismatch() {
            let rollback = self.rollback(RollbackTrigger::IntegrityMismatch, now)?;
            return Ok(ActivationOutcome::RolledBack { rollback, verdict });
        }
        Ok(ActivationOutcome::Activated { record, verdict })
    }

    /// Restore the previous bundle. The previous slot is empty afterwards.
    pub fn rollback(
        &self,
        trigger: RollbackTrigger,
        now: DateTime<Utc>,
    ) -> Result<RollbackRecord, IntegrityError> {
        let mut pointer = self.pointer()?;
        let Some(previous) = pointer.previous.take() else {
            tracing::error!(trigger = trigger.as_str(), "rollback requested with no previous bundle");
            return Err(IntegrityError::RollbackUnavailable { trigger });
        };
        let restored = previous.label();
        let displaced = pointer.active.replace(previous).map(|a| a.label());
        self.write_pointer(&pointer)?;

        let record = RollbackRecord {
            trigger,
            restored,
            displaced,
            at: now,
        };
        let (reason_code, payload) = record.reason();
        self.audit(&AuditEntry::Rollback {
            record: record.clone(),
            reason_code,
            payload,
        })?;
        tracing::warn!(
            trigger = trigger.as_str(),
            restored = %record.restored,
            reason_code = reason_code.as_str(),
            "engine bundle rolled back"
        );
        Ok(record)
    }

    /// Re-verify the active bundle on disk, rolling back if it no longer
    /// stages or its ruleset hash moved.
    pub fn verify_active(&self, now: DateTime<Utc>) -> Result<Option<RollbackRecord>, IntegrityError> {
        let Some(active) = self.pointer()?.active else {
            return Ok(None);
        };
        let trigger = match stage(Utf8Path::new(&active.dir), &self.engine_version) {
            Ok(staged) if staged.ruleset_hash == active.ruleset_hash => return Ok(None),
            Ok(_) => RollbackTrigger::IntegrityMismatch,
            Err(e) => match e.trigger() {
                Some(trigger) => {
                    tracing::warn!(bundle = %active.label(), error = %e, "active bundle failed verification");
                    trigger
                }
                None => return Err(e),
            },
        };
        self.rollback(trigger, now).map(Some)
    }

    fn startup_log(&self) -> Result<StartupLog, IntegrityError> {
        Ok(read_optional(&self.layout.startup_file())?
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default())
    }

    fn write_startup_log(&self, log: &StartupLog) -> Result<(), IntegrityError> {
        write_file_atomic(&self.layout.startup_file(), &emit_jcs(log)?)?;
        Ok(())
    }

    /// Count a failed start. The third consecutive one rolls back.
    pub fn record_start_failure(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<RollbackRecord>, IntegrityError> {
        let mut log = self.startup_log()?;
        log.consecutive_failures += 1;
        log.last_failure_at = Some(now);
        if log.consecutive_failures < CRASH_LOOP_THRESHOLD {
            self.write_startup_log(&log)?;
            return Ok(None);
        }
        self.write_startup_log(&StartupLog::default())?;
        self.rollback(RollbackTrigger::StartupCrashLoop, now).map(Some)
    }

    pub fn record_start_success(&self) -> Result<(), IntegrityError> {
        if self.startup_log()?.consecutive_failures > 0 {
            self.write_startup_log(&StartupLog::default())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::fixtures::write_bundle;
    use phaseguard_utils::paths::with_isolated_home;
    use phaseguard_utils::test_support::fixed_now;

    fn manager(layout: Layout) -> LifecycleManager {
        LifecycleManager::new(layout, "1.0.0", ExecutionMode::Interactive)
    }

    fn pass(_: &StagedBundle) -> Result<(), String> {
        Ok(())
    }

    #[test]
    fn test_activate_keeps_one_previous() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        for (i, version) in ["1.0.0", "1.1.0", "1.2.0"].iter().enumerate() {
            let dir = home.home().join(format!("b{i}"));
            write_bundle(&dir, version, &format!("rules {version}"));
            let staged = mgr.stage(&dir).unwrap();
            let outcome = mgr.activate(&staged, &pass, &[], fixed_now()).unwrap();
            assert!(matches!(outcome, ActivationOutcome::Activated { .. }));
        }
        let pointer = mgr.pointer().unwrap();
        assert_eq!(pointer.active.unwrap().version, "1.2.0");
        assert_eq!(pointer.previous.unwrap().version, "1.1.0");
    }

    #[test]
    fn test_rollback_restores_previous_and_empties_slot() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        for (i, version) in ["1.0.0", "1.1.0"].iter().enumerate() {
            let dir = home.home().join(format!("b{i}"));
            write_bundle(&dir, version, &format!("rules {version}"));
            mgr.activate(&mgr.stage(&dir).unwrap(), &pass, &[], fixed_now()).unwrap();
        }

        let record = mgr.rollback(RollbackTrigger::BundleIncompatible, fixed_now()).unwrap();
        assert_eq!(record.restored, "core@1.0.0");
        assert_eq!(record.displaced.as_deref(), Some("core@1.1.0"));
        let pointer = mgr.pointer().unwrap();
        assert_eq!(pointer.active.unwrap().version, "1.0.0");
        assert!(pointer.previous.is_none());

        let err = mgr.rollback(RollbackTrigger::BundleIncompatible, fixed_now()).unwrap_err();
        assert_eq!(err.reason().0, ReasonCode::RollbackUnavailable);

        let audit = mgr.audit_entries().unwrap();
        assert!(matches!(
            audit.last(),
            Some(AuditEntry::Rollback { reason_code: ReasonCode::RollbackPerformed, .. })
        ));
    }

    #[test]
    fn test_same_version_with_new_content_rolls_back() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        let first = home.home().join("first");
        write_bundle(&first, "1.0.0", "rules");
        mgr.activate(&mgr.stage(&first).unwrap(), &pass, &[], fixed_now()).unwrap();

        let second = home.home().join("second");
        write_bundle(&second, "1.0.0", "rules, quietly changed");
        let outcome = mgr.activate(&mgr.stage(&second).unwrap(), &pass, &[], fixed_now()).unwrap();
        match outcome {
            ActivationOutcome::RolledBack { rollback, verdict } => {
                assert_eq!(rollback.trigger, RollbackTrigger::IntegrityMismatch);
                let (_, payload) = verdict.reason().unwrap();
                assert_eq!(payload["changed_categories"], "lockfile,pack_hash");
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(mgr.pointer().unwrap().active.unwrap().dir, first.to_string());
    }

    #[test]
    fn test_smoke_failure_never_flips() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        let dir = home.home().join("b");
        write_bundle(&dir, "1.0.0", "rules");
        let fail = |_: &StagedBundle| -> Result<(), String> { Err("state does not load".to_string()) };
        let err = mgr.activate(&mgr.stage(&dir).unwrap(), &fail, &[], fixed_now()).unwrap_err();
        assert!(matches!(err, IntegrityError::SmokeTestFailed { .. }));
        assert!(mgr.pointer().unwrap().active.is_none());
    }

    #[test]
    fn test_crash_loop_triggers_rollback_on_third_failure() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        for (i, version) in ["1.0.0", "1.1.0"].iter().enumerate() {
            let dir = home.home().join(format!("b{i}"));
            write_bundle(&dir, version, &format!("rules {version}"));
            mgr.activate(&mgr.stage(&dir).unwrap(), &pass, &[], fixed_now()).unwrap();
        }
        assert!(mgr.record_start_failure(fixed_now()).unwrap().is_none());
        mgr.record_start_success().unwrap();
        assert!(mgr.record_start_failure(fixed_now()).unwrap().is_none());
        assert!(mgr.record_start_failure(fixed_now()).unwrap().is_none());
        let record = mgr.record_start_failure(fixed_now()).unwrap().unwrap();
        assert_eq!(record.trigger, RollbackTrigger::StartupCrashLoop);
        assert_eq!(record.restored, "core@1.0.0");
    }

    #[test]
    fn test_verify_active_rolls_back_tampered_bundle() {
        let home = with_isolated_home();
        let mgr = manager(home.layout());
        let mut last = None;
        for (i, version) in ["1.0.0", "1.1.0"].iter().enumerate() {
            let dir = home.home().join(format!("b{i}"));
            write_bundle(&dir, version, &format!("rules {version}"));
            mgr.activate(&mgr.stage(&dir).unwrap(), &pass, &[], fixed_now()).unwrap();
            last = Some(dir);
        }
        assert!(mgr.verify_active(fixed_now()).unwrap().is_none());

        std::fs::write(last.unwrap().join("rules.md"), "tampered").unwrap();
        let record = mgr.verify_active(fixed_now()).unwrap().unwrap();
        assert_eq!(record.trigger, RollbackTrigger::IntegrityMismatch);
    }

    #[test]
    fn test_trigger_names_parse() {
        for trigger in RollbackTrigger::ALL {
            assert_eq!(trigger.as_str().parse::<RollbackTrigger>().unwrap(), trigger);
        }
        assert!("panic".parse::<RollbackTrigger>().is_err());
    }
}
