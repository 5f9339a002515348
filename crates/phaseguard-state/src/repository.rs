use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use phaseguard_evidence::{Evidence, EvidenceClass};
use phaseguard_policy::{ArtifactKind, GuardedWriter, WriteContext};
use phaseguard_reason::{ReasonCode, ReasonPayload, ReasonRegistry, payload_of};
use phaseguard_utils::atomic_write::{read_optional, write_file_atomic};
use phaseguard_utils::canonicalization::emit_jcs;
use phaseguard_utils::paths::Layout;
use phaseguard_utils::types::{ExecutionMode, RolloutPhase, SessionKey};

use crate::aliases::{self, AliasPolicy, Rewrite};
use crate::error::StateError;
use crate::invariants;
use crate::model::{MigrationEvent, SCHEMA_VERSION, SessionState};

/// Repository settings taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateOptions {
    /// Rollout phase used when the run has no marker
    pub default_rollout: RolloutPhase,
    pub allow_legacy_fields: bool,
    pub execution_mode: ExecutionMode,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            default_rollout: RolloutPhase::DualRead,
            allow_legacy_fields: false,
            execution_mode: ExecutionMode::Interactive,
        }
    }
}

/// Non-blocking condition observed while loading or saving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateWarning {
    pub code: ReasonCode,
    pub payload: ReasonPayload,
}

#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: SessionState,
    pub rewrites: Vec<Rewrite>,
    pub warnings: Vec<StateWarning>,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub path: Utf8PathBuf,
    pub backup: Option<Utf8PathBuf>,
    pub retry_count: u32,
    pub warnings: Vec<StateWarning>,
    /// Legacy fields this save replaced
    pub migrated: Vec<MigrationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RolloutMarker {
    rollout: RolloutPhase,
}

/// Single-writer store for one run's session state.
///
/// Callers must hold the run's directory lock; the repository itself does
/// not lock.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    layout: Layout,
    key: SessionKey,
    options: StateOptions,
    writer: GuardedWriter,
}

impl SessionRepository {
    #[must_use]
    pub fn new(layout: Layout, key: SessionKey, options: StateOptions) -> Self {
        Self {
            layout,
            key,
            options,
            writer: GuardedWriter,
        }
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    #[must_use]
    pub fn path(&self) -> Utf8PathBuf {
        self.layout.state_file(&self.key)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Rollout phase from the run's marker, else the configured default.
    pub fn rollout(&self) -> Result<RolloutPhase, StateError> {
        let path = self.layout.rollout_file(&self.key);
        match read_optional(&path)? {
            None => Ok(self.options.default_rollout),
            Some(content) => serde_json::from_str::<RolloutMarker>(&content)
                .map(|m| m.rollout)
                .map_err(|e| StateError::SchemaInvalid {
                    detail: format!("rollout marker {path}: {e}"),
                }),
        }
    }

    pub fn set_rollout(&self, rollout: RolloutPhase) -> Result<(), StateError> {
        let path = self.layout.rollout_file(&self.key);
        let body = emit_jcs(&RolloutMarker { rollout })?;
        write_file_atomic(&path, &body)?;
        tracing::info!(repo = %self.key.repo_fingerprint, run_id = %self.key.run_id, rollout = %rollout, "rollout phase set");
        Ok(())
    }

    /// Start a run from a resolved repository identity.
    pub fn create(
        &self,
        identity: &Evidence,
        registry: &ReasonRegistry,
        now: DateTime<Utc>,
    ) -> Result<SessionState, StateError> {
        if self.exists() {
            return Err(StateError::AlreadyExists {
                path: self.path().to_string(),
            });
        }
        let missing = || StateError::IdentityMissing {
            evidence_id: identity.evidence_id.clone(),
        };
        if identity.evidence_class != EvidenceClass::IdentitySignal || !identity.verify_integrity() {
            return Err(missing());
        }
        let resolved = identity.repo_identity().ok_or_else(missing)?;
        if resolved.repo_fingerprint != self.key.repo_fingerprint {
            return Err(missing());
        }

        let state = SessionState::new(&self.key, &resolved, &identity.evidence_id, now);
        self.save(&state, registry, now)?;
        Ok(state)
    }

    /// Load, apply the rollout alias policy, deserialize and check invariants.
    ///
    /// Rewrites happen in memory only; migration events are recorded by the
    /// save that replaces the legacy document.
    pub fn load(&self, registry: &ReasonRegistry) -> Result<LoadedState, StateError> {
        let policy = AliasPolicy {
            rollout: self.rollout()?,
            allow_legacy_fields: self.options.allow_legacy_fields,
        };
        let mut doc = self.read_document()?;
        let rewrites = aliases::normalize(&mut doc, policy).map_err(|r| {
            tracing::warn!(field = r.field, rollout = %r.rollout, "legacy field rejected");
            StateError::LegacyFieldRejected {
                field: r.field.to_string(),
                canonical: r.canonical.to_string(),
                rollout: r.rollout,
            }
        })?;
        let state = self.finish_load(doc, registry)?;

        let warnings = if policy.warns() {
            rewrites
                .iter()
                .map(|r| StateWarning {
                    code: ReasonCode::LegacyFieldCompat,
                    payload: payload_of([("field", r.field), ("canonical", r.canonical)]),
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(LoadedState {
            state,
            rewrites,
            warnings,
        })
    }

    /// Operator-requested rewrite of every legacy field, in any rollout phase.
    pub fn migrate_legacy(
        &self,
        registry: &ReasonRegistry,
        now: DateTime<Utc>,
    ) -> Result<(LoadedState, SaveReport), StateError> {
        let mut doc = self.read_document()?;
        let rewrites = aliases::force_normalize(&mut doc);
        let mut state = self.finish_load(doc, registry)?;
        let report = self.save(&state, registry, now)?;
        state.migration_events.extend(report.migrated.iter().cloned());
        Ok((
            LoadedState {
                state,
                rewrites,
                warnings: Vec::new(),
            },
            report,
        ))
    }

    /// Check invariants and write `state` canonically.
    ///
    /// The file on disk is copied aside before the first canonicalizing write
    /// of a run, and before any write that replaces a document still carrying
    /// legacy field names. Each legacy field replaced this way is recorded as
    /// a migration event in the written document and in [`SaveReport::migrated`].
    pub fn save(
        &self,
        state: &SessionState,
        registry: &ReasonRegistry,
        now: DateTime<Utc>,
    ) -> Result<SaveReport, StateError> {
        if state.repo_fingerprint != self.key.repo_fingerprint || state.run_id != self.key.run_id {
            return Err(StateError::SchemaInvalid {
                detail: format!(
                    "state belongs to {}/{}, not {}",
                    state.repo_fingerprint, state.run_id, self.key
                ),
            });
        }
        let migrated = self.pending_migrations(now)?;
        let mut state = state.clone();
        state.migration_events.extend(migrated.iter().cloned());
        let state = &state;

        let violations = invariants::check(state, registry);
        if !violations.is_empty() {
            tracing::warn!(
                repo = %self.key.repo_fingerprint,
                run_id = %self.key.run_id,
                count = violations.len(),
                "save refused by invariant check"
            );
            return Err(StateError::InvariantViolations(violations));
        }

        let body = emit_jcs(state)?;
        let ctx = WriteContext::new(ArtifactKind::SessionState, self.options.execution_mode, now);

        let backup = self.backup_if_needed(state, &ctx)?;
        let path = self.path();
        let result = self.writer.write(state, &[], &ctx, &path, body.as_bytes())?;

        let mut warnings = Vec::new();
        if result.retry_count > 0 {
            warnings.push(StateWarning {
                code: ReasonCode::IoRetry,
                payload: payload_of([
                    ("path", path.to_string()),
                    ("attempts", result.retry_count.to_string()),
                ]),
            });
        }
        tracing::debug!(
            repo = %self.key.repo_fingerprint,
            run_id = %self.key.run_id,
            phase = state.current_phase().as_str(),
            "session state saved"
        );
        Ok(SaveReport {
            path,
            backup,
            retry_count: result.retry_count,
            warnings,
            migrated,
        })
    }

    /// Events for the legacy fields the next save will replace on disk.
    fn pending_migrations(&self, now: DateTime<Utc>) -> Result<Vec<MigrationEvent>, StateError> {
        let Some(current) = read_optional(&self.path())? else {
            return Ok(Vec::new());
        };
        let found = serde_json::from_str::<serde_json::Value>(&current)
            .map(|doc| aliases::legacy_fields(&doc))
            .unwrap_or_default();
        if found.is_empty() {
            return Ok(Vec::new());
        }
        let rollout = self.rollout()?;
        Ok(found
            .iter()
            .map(|a| MigrationEvent {
                field: a.legacy.to_string(),
                canonical: a.canonical.to_string(),
                rollout,
                at: now,
            })
            .collect())
    }

    fn read_document(&self) -> Result<serde_json::Value, StateError> {
        let path = self.path();
        let content = read_optional(&path)?.ok_or_else(|| StateError::NotFound {
            path: path.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| StateError::SchemaInvalid {
            detail: format!("not valid JSON: {e}"),
        })
    }

    fn finish_load(
        &self,
        doc: serde_json::Value,
        registry: &ReasonRegistry,
    ) -> Result<SessionState, StateError> {
        let state: SessionState =
            serde_json::from_value(doc).map_err(|e| StateError::SchemaInvalid {
                detail: e.to_string(),
            })?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateError::SchemaInvalid {
                detail: format!("unsupported SchemaVersion '{}'", state.schema_version),
            });
        }
        if state.repo_fingerprint != self.key.repo_fingerprint || state.run_id != self.key.run_id {
            return Err(StateError::SchemaInvalid {
                detail: format!("document is for {}/{}", state.repo_fingerprint, state.run_id),
            });
        }
        let violations = invariants::check(&state, registry);
        if !violations.is_empty() {
            return Err(StateError::InvariantViolations(violations));
        }
        Ok(state)
    }

    fn backup_if_needed(
        &self,
        state: &SessionState,
        ctx: &WriteContext<'_>,
    ) -> Result<Option<Utf8PathBuf>, StateError> {
        let Some(current) = read_optional(&self.path())? else {
            return Ok(None);
        };
        let dir = self.layout.backups_dir(&self.key);
        let has_backup = dir.is_dir()
            && std::fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_some());
        let carries_legacy = serde_json::from_str::<serde_json::Value>(&current)
            .map(|doc| !aliases::legacy_fields(&doc).is_empty())
            .unwrap_or(true);
        if has_backup && !carries_legacy {
            return Ok(None);
        }

        let stamp = ctx.now.format("%Y%m%dT%H%M%SZ");
        let mut target = dir.join(format!("session-state.{stamp}.json"));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("session-state.{stamp}.{n}.json"));
            n += 1;
        }
        self.writer.write(state, &[], ctx, &target, current.as_bytes())?;
        tracing::info!(backup = %target, "session state backed up before canonical write");
        Ok(Some(target))
    }
}
