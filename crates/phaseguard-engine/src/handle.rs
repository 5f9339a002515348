//! Per-run engine handle.
//!
//! [`EngineHandle`] holds the run lock for its whole life. Every mutating
//! operation loads state fresh, applies its change, routes, runs the
//! integrity guard and saves once. A refused operation writes nothing.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use phaseguard_config::Config;
use phaseguard_evidence::{Evidence, EvidenceClass, EvidenceStore, FreshnessContext};
use phaseguard_gate::{GateError, ReviewInput, evaluate_architecture, evaluate_evidence_gate};
use phaseguard_integrity::{ChangeCause, LifecycleManager, RollbackRecord};
use phaseguard_lock::SessionLock;
use phaseguard_policy::{
    ArtifactKind, CONFIRMATION_FIELD, GuardedWriter, PersistenceRequest, PolicyError, WriteContext, artifact_path,
    decide,
};
use phaseguard_reason::{ReasonCode, ReasonEmission, ReasonPayload, ReasonRegistry, RenderContext};
use phaseguard_router::{RouteDecision, request_phase, route};
use phaseguard_state::{
    ClaimEntry, DecisionSurface, RollbackAuthorization, SessionRepository, SessionState, StateOptions,
    StateWarning, Transition,
};
use phaseguard_utils::logging::phase_span;
use phaseguard_utils::paths::Layout;
use phaseguard_utils::types::{
    ApplicabilitySignal, ExecutionMode, GateName, GateStatus, Mode, PhaseId, SessionKey,
};

use crate::bundle::{load_registry, lock_options};
use crate::envelope::{OutputEnvelope, primary_reason};
use crate::error::EngineError;
use crate::integrity::guard_session;

/// What an operation did, ready to render.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub envelope: OutputEnvelope,
    /// Primary reason behind the envelope, fully rendered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emission: Option<ReasonEmission>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ReasonEmission>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    pub state_unchanged: bool,
    /// Artifact written by `persist`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<Utf8PathBuf>,
    /// Legacy fields rewritten by `migrate_state`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub migrated_fields: Vec<String>,
    #[serde(skip)]
    pub state: SessionState,
}

pub struct EngineHandle {
    config: Config,
    key: SessionKey,
    layout: Layout,
    registry: ReasonRegistry,
    repository: SessionRepository,
    evidence: EvidenceStore,
    lifecycle: LifecycleManager,
    invocation_started_at: DateTime<Utc>,
    startup_rollback: Option<RollbackRecord>,
    lock: SessionLock,
}

impl EngineHandle {
    /// Open the run `key`, taking its lock.
    pub fn open(config: Config, key: SessionKey) -> Result<Self, EngineError> {
        Self::open_at(config, key, Utc::now())
    }

    /// [`open`](Self::open) with an explicit invocation time.
    ///
    /// A start that fails after the lock is held counts towards the crash
    /// loop; the third consecutive one rolls the engine bundle back.
    pub fn open_at(config: Config, key: SessionKey, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let layout = config.layout();
        let lock = SessionLock::acquire(&layout.lock_dir(&key), &key.to_string(), &lock_options(&config))?;
        let lifecycle = LifecycleManager::new(layout.clone(), config.engine.version.clone(), config.execution_mode());

        let started = load_registry(&config).and_then(|registry| {
            let evidence = EvidenceStore::open(&layout.evidence_file(&key))?;
            Ok((registry, evidence))
        });
        let (registry, evidence) = match started {
            Ok(parts) => parts,
            Err(e) => {
                match lifecycle.record_start_failure(now) {
                    Ok(Some(record)) => {
                        tracing::warn!(restored = %record.restored, "crash loop rolled the engine bundle back");
                    }
                    Ok(None) => {}
                    Err(log_err) => tracing::error!(error = %log_err, "failed start was not recorded"),
                }
                return Err(e);
            }
        };
        lifecycle.record_start_success()?;
        let startup_rollback = lifecycle.verify_active(now)?;

        let repository = SessionRepository::new(
            layout.clone(),
            key.clone(),
            StateOptions {
                default_rollout: config.state.rollout,
                allow_legacy_fields: config.state.allow_legacy_fields,
                execution_mode: config.execution_mode(),
            },
        );
        tracing::debug!(session = %key, "engine handle opened");
        Ok(Self {
            config,
            key,
            layout,
            registry,
            repository,
            evidence,
            lifecycle,
            invocation_started_at: now,
            startup_rollback,
            lock,
        })
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    #[must_use]
    pub fn registry(&self) -> &ReasonRegistry {
        &self.registry
    }

    /// Release the run lock explicitly. Dropping the handle does the same.
    pub fn close(self) -> Result<(), EngineError> {
        self.lock.release()?;
        Ok(())
    }

    fn freshness(&self, state: &SessionState, now: DateTime<Utc>) -> FreshnessContext {
        FreshnessContext {
            now,
            invocation_started_at: self.invocation_started_at,
            session_started_at: state.session_started_at,
        }
    }

    fn load(&self) -> Result<(SessionState, Vec<StateWarning>), EngineError> {
        let loaded = self.repository.load(&self.registry)?;
        Ok((loaded.state, loaded.warnings))
    }

    /// Guard, save if anything changed, and build the report.
    fn commit(
        &self,
        before: &SessionState,
        decision: RouteDecision,
        offered: Option<(ReasonCode, ReasonPayload)>,
        mut warnings: Vec<StateWarning>,
        extra_causes: &[ChangeCause],
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        let RouteDecision {
            mut state,
            transitions,
            ..
        } = decision;
        let pointer = self.lifecycle.pointer()?;
        if let Some((code, payload)) =
            guard_session(&mut state, &pointer, &self.config.engine.version, extra_causes)?
        {
            warnings.push(StateWarning { code, payload });
        }

        let state_unchanged = state == *before;
        if !state_unchanged {
            let saved = self.repository.save(&state, &self.registry, now)?;
            state.migration_events.extend(saved.migrated);
            warnings.extend(saved.warnings);
        }
        Ok(self.report(state, transitions, offered, warnings, state_unchanged))
    }

    fn report(
        &self,
        state: SessionState,
        transitions: Vec<Transition>,
        offered: Option<(ReasonCode, ReasonPayload)>,
        warnings: Vec<StateWarning>,
        state_unchanged: bool,
    ) -> OperationReport {
        let ctx = RenderContext::for_key(&self.key);
        let mut rendered: Vec<ReasonEmission> = warnings
            .into_iter()
            .map(|w| self.registry.emit(w.code, w.payload, &ctx))
            .collect();
        if let Some(rollback) = &self.startup_rollback {
            let (code, payload) = rollback.reason();
            rendered.insert(0, self.registry.emit(code, payload, &ctx));
        }
        let emission = primary_reason(&state, offered)
            .map(|(code, payload)| self.registry.emit(code, payload, &ctx))
            .or_else(|| rendered.first().cloned());
        let envelope = OutputEnvelope::for_state(&state, &self.key, emission.as_ref());
        OperationReport {
            envelope,
            emission,
            warnings: rendered,
            transitions,
            state_unchanged,
            written: None,
            migrated_fields: Vec::new(),
            state,
        }
    }

    /// Read-only view: routes and guards a copy, never saves.
    pub fn status(&self) -> Result<OperationReport, EngineError> {
        let (state, warnings) = self.load()?;
        let _span = phase_span(&self.key, state.current_phase()).entered();
        let mut decision = route(&state, None);
        let mut warnings = warnings;
        let pointer = self.lifecycle.pointer()?;
        if let Some((code, payload)) =
            guard_session(&mut decision.state, &pointer, &self.config.engine.version, &[])?
        {
            warnings.push(StateWarning { code, payload });
        }
        let state_unchanged = decision.state == state;
        Ok(self.report(decision.state, decision.transitions, None, warnings, state_unchanged))
    }

    /// Append one evidence record and fold what it says into the run.
    ///
    /// The first record of a run must be an `identity_signal`; it creates
    /// the session state. Payload conventions:
    ///
    /// - `"artifact": <name>` (with optional `"present": bool`) records a
    ///   phase artifact
    /// - `"signal": <applicability signal>` with `"present": bool` records
    ///   whether a conditional phase applies
    pub fn record_evidence(&mut self, evidence: Evidence, now: DateTime<Utc>) -> Result<OperationReport, EngineError> {
        if !self.repository.exists() {
            if evidence.evidence_class != EvidenceClass::IdentitySignal {
                return Err(EngineError::NoSession {
                    evidence_id: evidence.evidence_id,
                });
            }
            self.evidence.check_appendable(&evidence)?;
            let created = self.repository.create(&evidence, &self.registry, now)?;
            tracing::info!(session = %self.key, evidence_id = %evidence.evidence_id, "run started");
            self.evidence.append(evidence)?;
            let decision = route(&created, None);
            return self.commit(&created, decision, None, Vec::new(), &[], now);
        }

        let (mut state, warnings) = self.load()?;
        let _span = phase_span(&self.key, state.current_phase()).entered();
        self.evidence.check_appendable(&evidence)?;
        let before = state.clone();
        fold_evidence(&mut state, &evidence)?;
        let decision = route(&state, None);
        // the log only takes records whose effect on the run was saved
        let report = self.commit(&before, decision, None, warnings, &[], now)?;
        self.evidence.append(evidence)?;
        Ok(report)
    }

    /// Register a claim that an evidence-backed gate must verify.
    pub fn assert_claim(
        &mut self,
        claim_id: &str,
        mut entry: ClaimEntry,
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        if entry.gate == GateName::Architecture {
            return Err(GateError::NotEvidenceBacked { gate: entry.gate }.into());
        }
        if claim_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("claim_id must not be empty".to_string()));
        }
        let (mut state, warnings) = self.load()?;
        let before = state.clone();
        entry.resolution = None;
        state.build_evidence.claims.insert(claim_id.trim().to_string(), entry);
        let decision = route(&state, None);
        self.commit(&before, decision, None, warnings, &[], now)
    }

    /// Submit one iteration of architecture review feedback.
    pub fn submit_review(
        &mut self,
        gate: GateName,
        review: &ReviewInput,
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        if gate != GateName::Architecture {
            return Err(GateError::NotIterative { gate }.into());
        }
        let (mut state, warnings) = self.load()?;
        let _span = phase_span(&self.key, state.current_phase()).entered();
        let before = state.clone();

        for decision in &review.decisions {
            match state.architecture_decisions.iter_mut().find(|d| d.id == decision.id) {
                Some(existing) => *existing = decision.clone(),
                None => state.architecture_decisions.push(decision.clone()),
            }
        }
        state
            .gate_artifacts
            .entry(gate)
            .or_default()
            .provided
            .extend(review.artifacts.iter().map(|(k, v)| (k.clone(), *v)));

        let outcome = evaluate_architecture(&state, review)?;
        let offered = outcome.reason_code.map(|code| (code, outcome.payload.clone()));
        let decision = route(&state, Some(&outcome));
        self.commit(&before, decision, offered, warnings, &[], now)
    }

    /// Evaluate the current evidence-backed gate, if one is pending, and
    /// advance as far as preconditions allow.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<OperationReport, EngineError> {
        let (state, warnings) = self.load()?;
        let _span = phase_span(&self.key, state.current_phase()).entered();
        let pending_gate = state.current_phase().gate().filter(|gate| {
            *gate != GateName::Architecture
                && !matches!(
                    state.gate_status(*gate),
                    GateStatus::Approved | GateStatus::NeedsHuman | GateStatus::NotApplicable
                )
        });
        let outcome = match pending_gate {
            Some(gate) => Some(evaluate_evidence_gate(
                &state,
                gate,
                self.evidence.records(),
                &self.freshness(&state, now),
            )?),
            None => None,
        };
        let offered = outcome
            .as_ref()
            .and_then(|o| o.reason_code.map(|code| (code, o.payload.clone())));
        let decision = route(&state, outcome.as_ref());
        self.commit(&state, decision, offered, warnings, &[], now)
    }

    /// Move the run to `target`. Backward moves need an authorization.
    pub fn request_phase(
        &mut self,
        target: PhaseId,
        authorization: Option<&RollbackAuthorization>,
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        let (state, warnings) = self.load()?;
        let decision = request_phase(&state, target, authorization)?;
        self.commit(&state, decision, None, warnings, &[], now)
    }

    /// Record the operator's confidence and decision surface, and derive the mode.
    pub fn assess(
        &mut self,
        confidence: u8,
        surface: Option<DecisionSurface>,
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        if confidence > 100 {
            return Err(EngineError::InvalidInput(format!(
                "confidence {confidence} is outside 0..=100"
            )));
        }
        let (mut state, warnings) = self.load()?;
        let before = state.clone();
        state.confidence_level = i64::from(confidence);
        if let Some(surface) = surface {
            state.decision_surface = surface.is_populated().then_some(surface);
        }
        state.mode = derive_mode(&state);
        let decision = route(&state, None);
        self.commit(&before, decision, None, warnings, &[], now)
    }

    /// Write a governed artifact through the persistence policy.
    ///
    /// In interactive mode `confirmation` is sealed as an `operator_provided`
    /// record and logged only once the policy allows the write. Pipeline runs
    /// never seal one.
    pub fn persist(
        &mut self,
        artifact: ArtifactKind,
        content: &[u8],
        confirmation: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        if artifact == ArtifactKind::SessionState {
            return Err(EngineError::InvalidInput(
                "session state is written by the engine only".to_string(),
            ));
        }
        let (state, warnings) = self.load()?;
        let execution_mode = self.config.execution_mode();

        let record = match (confirmation, execution_mode) {
            (Some(phrase), ExecutionMode::Interactive) => Some(Evidence::seal(
                format!("confirm-{artifact}-{}", self.evidence.len() + 1),
                EvidenceClass::OperatorProvided,
                now,
                json!({ CONFIRMATION_FIELD: phrase }),
            )?),
            _ => None,
        };
        let request = PersistenceRequest::for_run(
            &state,
            artifact,
            execution_mode,
            now,
            self.invocation_started_at,
            record.as_ref(),
            content.len(),
        );
        let decision = decide(&request);
        if !decision.is_allowed() {
            return Err(PolicyError::Blocked(decision).into());
        }
        if state.is_blocked() {
            tracing::warn!(session = %self.key, artifact = %artifact, "persist refused while the run is blocked");
            return Ok(self.report(state, Vec::new(), None, warnings, true));
        }

        let confirmation_id = record.as_ref().map(|r| r.evidence_id.clone());
        if let Some(record) = record {
            self.evidence.append(record)?;
        }
        let ctx = WriteContext {
            invocation_started_at: self.invocation_started_at,
            confirmation_id: confirmation_id.as_deref(),
            ..WriteContext::new(artifact, execution_mode, now)
        };
        let path = artifact_path(&self.layout, &self.key, artifact);
        GuardedWriter.write(&state, self.evidence.records(), &ctx, &path, content)?;
        tracing::info!(session = %self.key, artifact = %artifact, path = %path, "artifact persisted");
        let mut report = self.report(state, Vec::new(), None, warnings, true);
        report.written = Some(path);
        Ok(report)
    }

    /// Rewrite every legacy field of the run to its canonical name.
    pub fn migrate_state(&mut self, now: DateTime<Utc>) -> Result<OperationReport, EngineError> {
        let (loaded, saved) = self.repository.migrate_legacy(&self.registry, now)?;
        let migrated_fields: Vec<String> = loaded.rewrites.iter().map(|r| r.field.to_string()).collect();
        tracing::info!(session = %self.key, fields = migrated_fields.len(), "state migrated");
        let mut report = self.report(loaded.state, Vec::new(), None, saved.warnings, migrated_fields.is_empty());
        report.migrated_fields = migrated_fields;
        Ok(report)
    }

    /// Log causes for an activation-hash change and re-check the run with them.
    pub fn explain_change(
        &mut self,
        causes: &[ChangeCause],
        now: DateTime<Utc>,
    ) -> Result<OperationReport, EngineError> {
        if causes.is_empty() {
            return Err(EngineError::InvalidInput("at least one cause is required".to_string()));
        }
        self.lifecycle.log_causes(&self.key.to_string(), causes, now)?;
        let (state, warnings) = self.load()?;
        let decision = route(&state, None);
        self.commit(&state, decision, None, warnings, causes, now)
    }
}

/// Mode implied by confidence, the decision surface and the phase.
#[must_use]
pub fn derive_mode(state: &SessionState) -> Mode {
    state.derived_mode()
}

fn payload_bool(evidence: &Evidence, field: &str) -> Option<bool> {
    evidence.payload.get(field).and_then(Value::as_bool)
}

fn fold_evidence(state: &mut SessionState, evidence: &Evidence) -> Result<(), EngineError> {
    if let Some(name) = evidence.payload_str("artifact") {
        let present = payload_bool(evidence, "present").unwrap_or(true);
        state.artifacts.insert(name.to_string(), present);
        if present {
            state
                .load_evidence
                .insert(name.to_string(), evidence.evidence_id.clone());
        }
    }
    if let Some(signal) = evidence.payload_str("signal") {
        let signal: ApplicabilitySignal = signal.parse().map_err(EngineError::InvalidInput)?;
        let present = payload_bool(evidence, "present").ok_or_else(|| {
            EngineError::InvalidInput(format!("signal '{signal}' needs a boolean 'present'"))
        })?;
        state.applicability.insert(signal.as_str().to_string(), present);
    }
    if matches!(
        evidence.evidence_class,
        EvidenceClass::GateEvidence | EvidenceClass::RuntimeDiagnostic
    ) && !state.build_evidence.evidence_ids.contains(&evidence.evidence_id)
    {
        state.build_evidence.evidence_ids.push(evidence.evidence_id.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeStatus, NextActionKind};
    use chrono::Duration;
    use phaseguard_evidence::ClaimKind;
    use phaseguard_policy::CONFIRMATION_PHRASE;
    use phaseguard_state::{ArchitectureDecision, DecisionStatus, Presence};
    use phaseguard_utils::exit_codes::ExitCode;
    use phaseguard_utils::paths::with_isolated_home;
    use phaseguard_utils::test_support::{fixed_now, test_key};

    fn config(home: &camino::Utf8Path, mode: ExecutionMode) -> Config {
        Config::builder()
            .home(home.to_path_buf())
            .execution_mode(mode)
            .engine_version("1.0.0")
            .build()
            .unwrap()
    }

    fn identity(id: &str) -> Evidence {
        Evidence::seal(
            id,
            EvidenceClass::IdentitySignal,
            fixed_now(),
            json!({"repo_fingerprint": test_key().repo_fingerprint, "repo_root": "${REPO_ROOT}"}),
        )
        .unwrap()
    }

    fn observed(id: &str, payload: Value) -> Evidence {
        Evidence::seal(id, EvidenceClass::PreflightProbe, fixed_now(), payload).unwrap()
    }

    fn started(home: &camino::Utf8Path, mode: ExecutionMode) -> EngineHandle {
        let mut handle = EngineHandle::open_at(config(home, mode), test_key(), fixed_now()).unwrap();
        handle.record_evidence(identity("id-1"), fixed_now()).unwrap();
        handle
    }

    /// Walk a fresh run up to the architecture review.
    fn to_review(handle: &mut EngineHandle) -> OperationReport {
        let mut last = None;
        for (i, payload) in [
            json!({"artifact": "repo_signals"}),
            json!({"artifact": "repo_map"}),
            json!({"signal": "api-artifacts-detected", "present": false}),
            json!({"signal": "business-rules-present", "present": false}),
            json!({"artifact": "decision_pack"}),
            json!({"artifact": "plan"}),
        ]
        .into_iter()
        .enumerate()
        {
            last = Some(handle.record_evidence(observed(&format!("ev-{i}"), payload), fixed_now()).unwrap());
        }
        last.unwrap()
    }

    fn adr(status: DecisionStatus) -> ArchitectureDecision {
        ArchitectureDecision {
            id: "ADR-1".to_string(),
            title: "Single writer per run".to_string(),
            status,
        }
    }

    #[test]
    fn test_first_record_must_be_identity() {
        let home = with_isolated_home();
        let mut handle =
            EngineHandle::open_at(config(&home.home(), ExecutionMode::Interactive), test_key(), fixed_now()).unwrap();
        let err = handle
            .record_evidence(observed("probe-1", json!({"artifact": "repo_signals"})), fixed_now())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSession { .. }));

        let report = handle.record_evidence(identity("id-1"), fixed_now()).unwrap();
        assert_eq!(report.state.current_phase(), PhaseId::Discovery);
        assert_eq!(report.envelope.next_action.kind, NextActionKind::ManualStep);
        assert!(report.state.integrity_hashes.is_some());
    }

    #[test]
    fn test_artifacts_and_signals_route_to_review() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let report = to_review(&mut handle);
        assert_eq!(report.state.current_phase(), PhaseId::ArchitectureReview);
        assert_eq!(report.envelope.status, EnvelopeStatus::Ok);
        assert!(report.envelope.next_action.value.contains("phaseguard review"));
        assert_eq!(
            report.state.gate_status(GateName::BusinessRules),
            GateStatus::Pending,
            "business rules is decided when reached, not before"
        );
    }

    #[test]
    fn test_unknown_signal_is_refused_without_writing() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let before = handle.status().unwrap().state;
        let err = handle
            .record_evidence(observed("ev-x", json!({"signal": "weather", "present": true})), fixed_now())
            .unwrap_err();
        assert_eq!(err.to_exit_code(), ExitCode::CLI_ARGS);
        assert_eq!(handle.status().unwrap().state, before);
    }

    #[test]
    fn test_review_loop_escalates_on_third_rejection() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        to_review(&mut handle);

        let rejected = ReviewInput {
            issues: vec!["no rollback story".to_string()],
            decisions: vec![adr(DecisionStatus::Approved)],
            artifacts: [("architecture_doc".to_string(), Presence::Present)].into(),
            ..ReviewInput::default()
        };
        for _ in 0..2 {
            let report = handle.submit_review(GateName::Architecture, &rejected, fixed_now()).unwrap();
            assert_eq!(report.state.gate_status(GateName::Architecture), GateStatus::Rejected);
        }
        let report = handle.submit_review(GateName::Architecture, &rejected, fixed_now()).unwrap();
        assert_eq!(report.envelope.status, EnvelopeStatus::NeedsHuman);
        assert_eq!(report.envelope.exit_code(), ExitCode::NEEDS_HUMAN);

        let err = handle
            .submit_review(GateName::Architecture, &ReviewInput::default(), fixed_now())
            .unwrap_err();
        assert_eq!(err.to_exit_code(), ExitCode::NEEDS_HUMAN);
    }

    #[test]
    fn test_evidence_gate_needs_fresh_passing_run() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        to_review(&mut handle);
        let approve = ReviewInput {
            decisions: vec![adr(DecisionStatus::Approved)],
            artifacts: [("architecture_doc".to_string(), Presence::Present)].into(),
            ..ReviewInput::default()
        };
        let report = handle.submit_review(GateName::Architecture, &approve, fixed_now()).unwrap();
        assert_eq!(report.state.current_phase(), PhaseId::TestQuality);

        handle
            .assert_claim(
                "tests-green",
                ClaimEntry {
                    label: "tests green".to_string(),
                    kind: ClaimKind::TestsPass,
                    required_class: EvidenceClass::GateEvidence,
                    gate: GateName::TestQuality,
                    evidence_ids: Vec::new(),
                    resolution: None,
                },
                fixed_now(),
            )
            .unwrap();

        let stale = Evidence::seal(
            "run-old",
            EvidenceClass::GateEvidence,
            fixed_now() - Duration::hours(30),
            json!({"claim_id": "tests-green", "kind": "test_run", "passed": 10, "failed": 0, "exit_code": 0}),
        )
        .unwrap();
        handle.record_evidence(stale, fixed_now()).unwrap();
        let report = handle.advance(fixed_now()).unwrap();
        assert_eq!(report.envelope.status, EnvelopeStatus::NotVerified);
        assert_ne!(report.state.gate_status(GateName::TestQuality), GateStatus::Approved);

        let fresh = Evidence::seal(
            "run-new",
            EvidenceClass::GateEvidence,
            fixed_now(),
            json!({"claim_id": "tests-green", "kind": "test_run", "passed": 10, "failed": 0, "exit_code": 0}),
        )
        .unwrap();
        handle.record_evidence(fresh, fixed_now()).unwrap();
        let report = handle.advance(fixed_now()).unwrap();
        assert_eq!(report.state.gate_status(GateName::TestQuality), GateStatus::Approved);
        assert!(report.state.current_phase() > PhaseId::TestQuality);
    }

    #[test]
    fn test_pipeline_persist_is_refused_before_anything_else() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Pipeline);
        let err = handle
            .persist(ArtifactKind::WorkspaceMemory, b"defaults", Some(CONFIRMATION_PHRASE), fixed_now())
            .unwrap_err();
        assert_eq!(err.reason().unwrap().0, ReasonCode::PersistencePipelineMode);
        assert_eq!(err.to_exit_code(), ExitCode::BLOCKED);
        assert!(!artifact_path(&handle.layout, &test_key(), ArtifactKind::WorkspaceMemory).exists());
    }

    #[test]
    fn test_refused_persist_logs_no_confirmation() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let logged = handle.evidence.len();

        let err = handle
            .persist(ArtifactKind::WorkspaceMemory, b"defaults", Some(CONFIRMATION_PHRASE), fixed_now())
            .unwrap_err();
        assert_eq!(err.reason().unwrap().0, ReasonCode::PersistenceThresholdNotMet);
        assert_eq!(handle.evidence.len(), logged);
        assert_eq!(
            EvidenceStore::open(&handle.layout.evidence_file(&test_key())).unwrap().len(),
            logged
        );
    }

    #[test]
    fn test_evidence_is_logged_only_after_the_run_saves() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let logged = handle.evidence.len();
        let pointer = handle.layout.activation_file();
        std::fs::create_dir_all(pointer.parent().unwrap()).unwrap();
        std::fs::write(&pointer, "{not json").unwrap();

        let record = observed("ev-signals", json!({"artifact": "repo_signals"}));
        assert!(handle.record_evidence(record.clone(), fixed_now()).is_err());
        assert_eq!(handle.evidence.len(), logged);
        assert!(handle.evidence.get("ev-signals").is_none());

        std::fs::remove_file(&pointer).unwrap();
        let report = handle.record_evidence(record, fixed_now()).unwrap();
        assert!(report.state.has_artifact("repo_signals"));
        assert_eq!(handle.evidence.len(), logged + 1);
    }

    #[test]
    fn test_observational_artifact_is_written_once_phase_allows() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let report = handle
            .persist(ArtifactKind::RepoCache, b"{\"files\": 12}", None, fixed_now())
            .unwrap();
        let written = report.written.unwrap();
        assert_eq!(std::fs::read(&written).unwrap(), b"{\"files\": 12}");

        let err = handle
            .persist(ArtifactKind::DecisionPack, b"{}", None, fixed_now())
            .unwrap_err();
        assert_eq!(err.reason().unwrap().0, ReasonCode::PersistencePhaseNotAllowed);
    }

    #[test]
    fn test_assess_derives_mode() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        let report = handle.assess(40, None, fixed_now()).unwrap();
        assert_eq!(report.state.mode, Mode::Draft);

        let surface = DecisionSurface {
            question: "Which store?".to_string(),
            options: vec!["sqlite".to_string(), "files".to_string()],
        };
        let report = handle.assess(85, Some(surface), fixed_now()).unwrap();
        assert_eq!(report.state.mode, Mode::Architect);
        assert_eq!(report.envelope.status, EnvelopeStatus::AwaitingDecision);
        assert!(handle.assess(101, None, fixed_now()).is_err());
    }

    #[test]
    fn test_backward_request_needs_authorization() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);
        to_review(&mut handle);

        let err = handle.request_phase(PhaseId::Discovery, None, fixed_now()).unwrap_err();
        assert_eq!(err.reason().unwrap().0, ReasonCode::MonotonicityViolation);

        let auth = RollbackAuthorization {
            target: PhaseId::Discovery,
            authorized_by: "lead".to_string(),
            reason: "repo was re-split".to_string(),
        };
        let report = handle.request_phase(PhaseId::Discovery, Some(&auth), fixed_now()).unwrap();
        assert_eq!(report.state.current_phase(), PhaseId::Discovery);
        assert!(!report.state.has_artifact("repo_signals"));
    }

    #[test]
    fn test_pinned_hash_drift_blocks_until_explained() {
        let home = with_isolated_home();
        let mut handle = started(&home.home(), ExecutionMode::Interactive);

        let (mut state, _) = handle.load().unwrap();
        let mut tampered = state.integrity_hashes.clone().unwrap();
        tampered.categories.insert("pack_hash".to_string(), "0".repeat(64));
        tampered.activation_hash = "0".repeat(64);
        state.integrity_hashes = Some(tampered);
        handle.repository.save(&state, &handle.registry, fixed_now()).unwrap();

        let report = handle.status().unwrap();
        assert_eq!(report.envelope.reason_code.as_deref(), Some("BLOCKED-HASH-MISMATCH"));
        assert_eq!(report.envelope.exit_code(), ExitCode::INTEGRITY);
        let emission = report.emission.unwrap();
        assert_eq!(emission.payload["changed_categories"], "pack_hash");

        let cause = ChangeCause::BundleVersionBump {
            bundle: "core".to_string(),
            from: "1.0.0".to_string(),
            to: "1.0.1".to_string(),
        };
        let report = handle.explain_change(&[cause], fixed_now()).unwrap();
        assert!(!report.state.is_blocked());
        assert_eq!(report.envelope.status, EnvelopeStatus::Warn);
        assert!(handle.status().unwrap().warnings.is_empty());
    }

    #[test]
    fn test_second_handle_sees_lock_contention() {
        let home = with_isolated_home();
        let cfg = Config::builder()
            .home(home.home())
            .lock_wait_ms(50)
            .lock_poll_ms(10)
            .build()
            .unwrap();
        let _first = EngineHandle::open_at(cfg.clone(), test_key(), fixed_now()).unwrap();
        let err = match EngineHandle::open_at(cfg, test_key(), fixed_now()) {
            Err(e) => e,
            Ok(_) => panic!("second handle acquired a held lock"),
        };
        assert_eq!(err.to_exit_code(), ExitCode::LOCK_HELD);
        assert_eq!(err.reason().unwrap().0, ReasonCode::LockContention);
    }
}
