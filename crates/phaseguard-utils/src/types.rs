use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Confidence below this level forces `Mode` into `DRAFT` or `BLOCKED`.
pub const CONFIDENCE_THRESHOLD: u8 = 70;

/// Maximum review iterations per gate before escalating to a human.
pub const MAX_GATE_ITERATIONS: u32 = 3;

/// Phase identifiers for the governed workflow.
///
/// Phases carry a stable ordinal that the router uses for monotonicity checks.
/// The workflow is a partial order rather than a plain chain: conditional phases
/// may be skipped (with a recorded `not-applicable` marker) and gated phases only
/// advance on an approved gate outcome.
///
/// ```text
/// 0 → 1 → 2 → 2.1 → [3A → 3B] → 4 → 5 → 5.3 → [5.4] → 5.6 → 6 → 7
/// ```
///
/// # Example
///
/// ```rust
/// use phaseguard_utils::types::PhaseId;
///
/// assert_eq!(PhaseId::ArchitectureReview.token(), "5");
/// assert!(PhaseId::Planning.ordinal() < PhaseId::ArchitectureReview.ordinal());
/// assert_eq!(PhaseId::from_token("2.1"), Some(PhaseId::DecisionPack));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseId {
    /// Session bootstrap: repository identity resolved.
    Bootstrap,
    /// Observational discovery of repository signals.
    Discovery,
    /// Repository map and structure discovery.
    RepoDiscovery,
    /// Decision-pack distillation.
    DecisionPack,
    /// API surface inventory (conditional on API artifacts).
    ApiInventory,
    /// API surface validation (conditional on API artifacts).
    ApiValidation,
    /// Plan authoring. Rejected reviews route back here.
    Planning,
    /// Iterative architecture review.
    ArchitectureReview,
    /// Test-quality review.
    TestQuality,
    /// Business-rules compliance (conditional on business rules).
    BusinessRules,
    /// Rollback-safety review.
    RollbackSafety,
    /// Code-producing implementation step with QA gate.
    Implementation,
    /// Workflow finished.
    Complete,
}

/// Structural kind of a phase, used by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Plain,
    Conditional,
    Authoring,
    Gated,
    Terminal,
}

/// Signal that decides whether a conditional phase applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicabilitySignal {
    ApiArtifactsDetected,
    BusinessRulesPresent,
}

impl ApplicabilitySignal {
    pub const ALL: [ApplicabilitySignal; 2] = [Self::ApiArtifactsDetected, Self::BusinessRulesPresent];

    /// Key under `Applicability` in session state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApiArtifactsDetected => "api-artifacts-detected",
            Self::BusinessRulesPresent => "business-rules-present",
        }
    }
}

impl fmt::Display for ApplicabilitySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicabilitySignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown applicability signal '{s}'"))
    }
}

impl PhaseId {
    /// All phases in ordinal order.
    pub const ALL: [PhaseId; 13] = [
        Self::Bootstrap,
        Self::Discovery,
        Self::RepoDiscovery,
        Self::DecisionPack,
        Self::ApiInventory,
        Self::ApiValidation,
        Self::Planning,
        Self::ArchitectureReview,
        Self::TestQuality,
        Self::BusinessRules,
        Self::RollbackSafety,
        Self::Implementation,
        Self::Complete,
    ];

    #[must_use]
    pub const fn ordinal(&self) -> u8 {
        match self {
            Self::Bootstrap => 0,
            Self::Discovery => 1,
            Self::RepoDiscovery => 2,
            Self::DecisionPack => 3,
            Self::ApiInventory => 4,
            Self::ApiValidation => 5,
            Self::Planning => 6,
            Self::ArchitectureReview => 7,
            Self::TestQuality => 8,
            Self::BusinessRules => 9,
            Self::RollbackSafety => 10,
            Self::Implementation => 11,
            Self::Complete => 12,
        }
    }

    /// Step token written into `Next` and the persisted `Phase.Token`.
    #[must_use]
    pub const fn token(&self) -> &'static str {
        match self {
            Self::Bootstrap => "0",
            Self::Discovery => "1",
            Self::RepoDiscovery => "2",
            Self::DecisionPack => "2.1",
            Self::ApiInventory => "3A",
            Self::ApiValidation => "3B",
            Self::Planning => "4",
            Self::ArchitectureReview => "5",
            Self::TestQuality => "5.3",
            Self::BusinessRules => "5.4",
            Self::RollbackSafety => "5.6",
            Self::Implementation => "6",
            Self::Complete => "7",
        }
    }

    /// Canonical lowercase name used in logs and the CLI.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Discovery => "discovery",
            Self::RepoDiscovery => "repo-discovery",
            Self::DecisionPack => "decision-pack",
            Self::ApiInventory => "api-inventory",
            Self::ApiValidation => "api-validation",
            Self::Planning => "planning",
            Self::ArchitectureReview => "architecture-review",
            Self::TestQuality => "test-quality",
            Self::BusinessRules => "business-rules",
            Self::RollbackSafety => "rollback-safety",
            Self::Implementation => "implementation",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PhaseKind {
        match self {
            Self::Bootstrap | Self::Discovery | Self::RepoDiscovery | Self::DecisionPack => {
                PhaseKind::Plain
            }
            Self::ApiInventory | Self::ApiValidation => PhaseKind::Conditional,
            Self::Planning => PhaseKind::Authoring,
            Self::ArchitectureReview
            | Self::TestQuality
            | Self::BusinessRules
            | Self::RollbackSafety
            | Self::Implementation => PhaseKind::Gated,
            Self::Complete => PhaseKind::Terminal,
        }
    }

    /// Gate attached to this phase, if any.
    #[must_use]
    pub const fn gate(&self) -> Option<GateName> {
        match self {
            Self::ArchitectureReview => Some(GateName::Architecture),
            Self::TestQuality => Some(GateName::TestQuality),
            Self::BusinessRules => Some(GateName::BusinessRules),
            Self::RollbackSafety => Some(GateName::RollbackSafety),
            Self::Implementation => Some(GateName::ImplementationQa),
            _ => None,
        }
    }

    /// Precondition signal for phases that may be skipped as `not-applicable`.
    #[must_use]
    pub const fn applicability(&self) -> Option<ApplicabilitySignal> {
        match self {
            Self::ApiInventory | Self::ApiValidation => {
                Some(ApplicabilitySignal::ApiArtifactsDetected)
            }
            Self::BusinessRules => Some(ApplicabilitySignal::BusinessRulesPresent),
            _ => None,
        }
    }

    /// Minimum artifact set that lets a non-gate phase advance.
    #[must_use]
    pub const fn required_artifacts(&self) -> &'static [&'static str] {
        match self {
            Self::Bootstrap => &["repo_identity"],
            Self::Discovery => &["repo_signals"],
            Self::RepoDiscovery => &["repo_map"],
            Self::DecisionPack => &["decision_pack"],
            Self::ApiInventory => &["api_inventory"],
            Self::ApiValidation => &["api_validation"],
            Self::Planning => &["plan"],
            Self::Implementation => &["change_set"],
            _ => &[],
        }
    }

    /// Phase that produces code. Requires every upstream gate to be allowed.
    #[must_use]
    pub const fn is_code_producing(&self) -> bool {
        matches!(self, Self::Implementation)
    }

    /// Phase a rejected gate routes back to for rework.
    #[must_use]
    pub const fn authoring_phase(&self) -> Option<PhaseId> {
        match self {
            Self::ArchitectureReview
            | Self::TestQuality
            | Self::BusinessRules
            | Self::RollbackSafety => Some(Self::Planning),
            Self::Implementation => Some(Self::Implementation),
            _ => None,
        }
    }

    /// Successor in ordinal order.
    #[must_use]
    pub fn successor(&self) -> Option<PhaseId> {
        Self::ALL.get(usize::from(self.ordinal()) + 1).copied()
    }

    /// Immediate predecessor in ordinal order.
    #[must_use]
    pub fn predecessor(&self) -> Option<PhaseId> {
        usize::from(self.ordinal())
            .checked_sub(1)
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    #[must_use]
    pub fn from_ordinal(ordinal: u8) -> Option<PhaseId> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<PhaseId> {
        Self::ALL.iter().copied().find(|p| p.token() == token)
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == lowered || p.token().eq_ignore_ascii_case(&lowered))
            .ok_or_else(|| format!("Unknown phase '{s}'"))
    }
}

/// Named checkpoints attached to gated phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateName {
    #[serde(rename = "P5-Architecture")]
    Architecture,
    #[serde(rename = "P5.3-TestQuality")]
    TestQuality,
    #[serde(rename = "P5.4-BusinessRules")]
    BusinessRules,
    #[serde(rename = "P5.6-RollbackSafety")]
    RollbackSafety,
    #[serde(rename = "P6-ImplementationQA")]
    ImplementationQa,
}

impl GateName {
    pub const ALL: [GateName; 5] = [
        Self::Architecture,
        Self::TestQuality,
        Self::BusinessRules,
        Self::RollbackSafety,
        Self::ImplementationQa,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "P5-Architecture",
            Self::TestQuality => "P5.3-TestQuality",
            Self::BusinessRules => "P5.4-BusinessRules",
            Self::RollbackSafety => "P5.6-RollbackSafety",
            Self::ImplementationQa => "P6-ImplementationQA",
        }
    }

    #[must_use]
    pub const fn phase(&self) -> PhaseId {
        match self {
            Self::Architecture => PhaseId::ArchitectureReview,
            Self::TestQuality => PhaseId::TestQuality,
            Self::BusinessRules => PhaseId::BusinessRules,
            Self::RollbackSafety => PhaseId::RollbackSafety,
            Self::ImplementationQa => PhaseId::Implementation,
        }
    }

    /// Gates whose phases precede this gate's phase.
    #[must_use]
    pub fn upstream(&self) -> Vec<GateName> {
        let ordinal = self.phase().ordinal();
        Self::ALL
            .iter()
            .copied()
            .filter(|g| g.phase().ordinal() < ordinal)
            .collect()
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "Unknown gate '{s}'. Valid gates: {}",
                    Self::ALL.map(|g| g.as_str()).join(", ")
                )
            })
    }
}

/// Status of a gate as recorded in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    NeedsHuman,
    NotApplicable,
}

impl GateStatus {
    /// Whether a downstream code-producing step may rely on this gate.
    #[must_use]
    pub const fn is_allowed_upstream(&self) -> bool {
        matches!(self, Self::Approved | Self::NotApplicable)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::NeedsHuman => "needs-human",
            Self::NotApplicable => "not-applicable",
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow mode recorded in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Draft,
    Standard,
    Blocked,
    Architect,
    Implement,
}

impl Mode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Standard => "STANDARD",
            Self::Blocked => "BLOCKED",
            Self::Architect => "ARCHITECT",
            Self::Implement => "IMPLEMENT",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine is being driven.
///
/// `Pipeline` can never supply an operator confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Interactive,
    Pipeline,
}

impl ExecutionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "pipeline" | "ci" | "non-interactive" => Ok(Self::Pipeline),
            other => Err(format!(
                "Unknown execution mode '{other}'. Valid modes: interactive, pipeline"
            )),
        }
    }
}

/// Migration stage for legacy session-state field names.
///
/// - `dual-read`: legacy aliases are read and rewritten to canonical names on save.
/// - `engine-only`: legacy aliases are rejected unless explicitly allowed.
/// - `legacy-removed`: legacy aliases are always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutPhase {
    #[default]
    DualRead,
    EngineOnly,
    LegacyRemoved,
}

impl RolloutPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DualRead => "dual-read",
            Self::EngineOnly => "engine-only",
            Self::LegacyRemoved => "legacy-removed",
        }
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dual-read" => Ok(Self::DualRead),
            "engine-only" => Ok(Self::EngineOnly),
            "legacy-removed" => Ok(Self::LegacyRemoved),
            other => Err(format!(
                "Unknown rollout phase '{other}'. Valid phases: dual-read, engine-only, legacy-removed"
            )),
        }
    }
}

/// Identity of one governed workflow run.
///
/// Every engine call receives the key explicitly; there is no ambient
/// "current session".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub repo_fingerprint: String,
    pub run_id: String,
}

/// Validation failure for a session key component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {component} '{value}': {reason}")]
pub struct SessionKeyError {
    pub component: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl SessionKey {
    /// Build a key, rejecting components that are unsafe as path segments.
    pub fn new(
        repo_fingerprint: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self, SessionKeyError> {
        let repo_fingerprint = repo_fingerprint.into();
        let run_id = run_id.into();
        validate_component("repo fingerprint", &repo_fingerprint)?;
        validate_component("run id", &run_id)?;
        Ok(Self {
            repo_fingerprint,
            run_id,
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo_fingerprint, self.run_id)
    }
}

fn validate_component(component: &'static str, value: &str) -> Result<(), SessionKeyError> {
    let fail = |reason| SessionKeyError {
        component,
        value: value.to_string(),
        reason,
    };
    if value.is_empty() || value.len() > 64 {
        return Err(fail("must be 1-64 characters"));
    }
    if value.starts_with('.') {
        return Err(fail("must not start with '.'"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(fail("only [A-Za-z0-9._-] allowed"));
    }
    Ok(())
}
