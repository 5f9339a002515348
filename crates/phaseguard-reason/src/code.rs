use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use strum::{EnumString, IntoStaticStr, VariantArray};

/// Category of a reason code, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Hard stop that needs an operator or recovery action
    Blocked,
    /// Degraded but non-blocking
    Warn,
    /// A claim could not be backed by fresh, matching evidence
    NotVerified,
}

impl Category {
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED-",
            Self::Warn => "WARN-",
            Self::NotVerified => "NOT_VERIFIED-",
        }
    }

    /// Category implied by a code string's prefix.
    #[must_use]
    pub fn of(code: &str) -> Option<Self> {
        [Self::Blocked, Self::Warn, Self::NotVerified]
            .into_iter()
            .find(|c| code.starts_with(c.prefix()) && code.len() > c.prefix().len())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blocked => "BLOCKED",
            Self::Warn => "WARN",
            Self::NotVerified => "NOT_VERIFIED",
        })
    }
}

/// Every reason the engine can emit. The set is closed; free-form strings
/// are parsed through [`std::str::FromStr`] and rejected when unknown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, IntoStaticStr, VariantArray,
)]
pub enum ReasonCode {
    #[strum(serialize = "BLOCKED-MISSING-EVIDENCE")]
    MissingEvidence,
    #[strum(serialize = "BLOCKED-INVARIANT-VIOLATION")]
    InvariantViolation,
    #[strum(serialize = "BLOCKED-REASON-CODE-UNREGISTERED")]
    ReasonCodeUnregistered,
    #[strum(serialize = "BLOCKED-REASON-PAYLOAD-INCOMPLETE")]
    ReasonPayloadIncomplete,
    #[strum(serialize = "BLOCKED-HASH-MISMATCH")]
    HashMismatch,
    #[strum(serialize = "BLOCKED-LEGACY-FIELD-REJECTED")]
    LegacyFieldRejected,
    #[strum(serialize = "BLOCKED-PHASE-MISMATCH")]
    PhaseMismatch,
    #[strum(serialize = "BLOCKED-MONOTONICITY-VIOLATION")]
    MonotonicityViolation,
    #[strum(serialize = "BLOCKED-GATE-ARTIFACT-MISSING")]
    GateArtifactMissing,
    #[strum(serialize = "BLOCKED-ARCHITECTURE-DECISION-MISSING")]
    ArchitectureDecisionMissing,
    #[strum(serialize = "BLOCKED-UPSTREAM-GATE-NOT-APPROVED")]
    UpstreamGateNotApproved,
    #[strum(serialize = "BLOCKED-ESCALATED-TO-HUMAN")]
    EscalatedToHuman,
    #[strum(serialize = "BLOCKED-PERSISTENCE-CONFIRMATION-REQUIRED")]
    PersistenceConfirmationRequired,
    #[strum(serialize = "BLOCKED-PERSISTENCE-PIPELINE-MODE")]
    PersistencePipelineMode,
    #[strum(serialize = "BLOCKED-PERSISTENCE-PHASE-NOT-ALLOWED")]
    PersistencePhaseNotAllowed,
    #[strum(serialize = "BLOCKED-PERSISTENCE-THRESHOLD-NOT-MET")]
    PersistenceThresholdNotMet,
    #[strum(serialize = "BLOCKED-LOCK-CONTENTION")]
    LockContention,
    #[strum(serialize = "BLOCKED-STATE-SCHEMA-INVALID")]
    StateSchemaInvalid,
    #[strum(serialize = "BLOCKED-BUNDLE-INCOMPATIBLE")]
    BundleIncompatible,
    #[strum(serialize = "BLOCKED-ROLLBACK-UNAVAILABLE")]
    RollbackUnavailable,
    #[strum(serialize = "BLOCKED-ROLLBACK-NOT-AUTHORIZED")]
    RollbackNotAuthorized,
    #[strum(serialize = "BLOCKED-REPO-IDENTITY-MISSING")]
    RepoIdentityMissing,
    #[strum(serialize = "BLOCKED-EVIDENCE-INTEGRITY")]
    EvidenceIntegrity,
    #[strum(serialize = "WARN-LEGACY-FIELD-COMPAT")]
    LegacyFieldCompat,
    #[strum(serialize = "WARN-OPTIONAL-TOOL-MISSING")]
    OptionalToolMissing,
    #[strum(serialize = "WARN-IO-RETRY")]
    IoRetry,
    #[strum(serialize = "WARN-HASH-CHANGE-EXPLAINED")]
    HashChangeExplained,
    #[strum(serialize = "WARN-ROLLBACK-PERFORMED")]
    RollbackPerformed,
    #[strum(serialize = "NOT_VERIFIED-MISSING-EVIDENCE")]
    NotVerifiedMissingEvidence,
    #[strum(serialize = "NOT_VERIFIED-EVIDENCE-STALE")]
    EvidenceStale,
    #[strum(serialize = "NOT_VERIFIED-EVIDENCE-TYPE-MISMATCH")]
    EvidenceTypeMismatch,
    #[strum(serialize = "NOT_VERIFIED-EVIDENCE-CONTRADICTS")]
    EvidenceContradicts,
}

impl ReasonCode {
    /// Wire form, e.g. `BLOCKED-MISSING-EVIDENCE`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub fn category(&self) -> Category {
        let s = self.as_str();
        if s.starts_with(Category::Blocked.prefix()) {
            Category::Blocked
        } else if s.starts_with(Category::Warn.prefix()) {
            Category::Warn
        } else {
            Category::NotVerified
        }
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.category() == Category::Blocked
    }

    /// All codes, in declaration order.
    #[must_use]
    pub fn all() -> &'static [ReasonCode] {
        Self::VARIANTS
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReasonCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReasonCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("unregistered reason code '{raw}'")))
    }
}
