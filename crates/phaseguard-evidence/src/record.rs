use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use phaseguard_utils::canonicalization::sha256_jcs;

use crate::error::EvidenceError;

/// Future-dated evidence within this tolerance is accepted as clock skew.
pub const FUTURE_SKEW_TOLERANCE_SECS: i64 = 300;

/// Trust tier of an evidence record. Each tier carries its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceClass {
    IdentitySignal,
    PreflightProbe,
    GateEvidence,
    RuntimeDiagnostic,
    OperatorProvided,
}

/// How long a record of a class stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Zero TTL: only valid when observed during the current invocation
    Invocation,
    /// Fixed window measured back from "now"
    Window(Duration),
    /// Valid for the lifetime of the session
    Session,
}

impl EvidenceClass {
    #[must_use]
    pub fn ttl(&self) -> Ttl {
        match self {
            Self::IdentitySignal | Self::PreflightProbe => Ttl::Invocation,
            Self::GateEvidence | Self::RuntimeDiagnostic => Ttl::Window(Duration::hours(24)),
            Self::OperatorProvided => Ttl::Session,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IdentitySignal => "identity_signal",
            Self::PreflightProbe => "preflight_probe",
            Self::GateEvidence => "gate_evidence",
            Self::RuntimeDiagnostic => "runtime_diagnostic",
            Self::OperatorProvided => "operator_provided",
        }
    }
}

impl fmt::Display for EvidenceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference instants for freshness decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessContext {
    pub now: DateTime<Utc>,
    pub invocation_started_at: DateTime<Utc>,
    pub session_started_at: DateTime<Utc>,
}

impl FreshnessContext {
    /// Context where the invocation starts at `now`.
    #[must_use]
    pub fn starting_now(now: DateTime<Utc>, session_started_at: DateTime<Utc>) -> Self {
        Self {
            now,
            invocation_started_at: now,
            session_started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(String),
}

impl Freshness {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// One observed fact. Records are immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: String,
    /// Lowercase hex SHA-256 of the JCS form of `payload`
    pub sha256: String,
    pub evidence_class: EvidenceClass,
    pub observed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Evidence {
    /// Build a record and compute its integrity hash.
    pub fn seal(
        evidence_id: impl Into<String>,
        evidence_class: EvidenceClass,
        observed_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Self, EvidenceError> {
        let evidence_id = evidence_id.into();
        if evidence_id.trim().is_empty() {
            return Err(EvidenceError::Invalid("evidence_id must not be empty".to_string()));
        }
        let sha256 = sha256_jcs(&payload).map_err(|e| EvidenceError::Invalid(e.to_string()))?;
        Ok(Self {
            evidence_id,
            sha256,
            evidence_class,
            observed_at,
            payload,
        })
    }

    /// Whether `sha256` matches the payload. Untrusted records never back a claim.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        sha256_jcs(&self.payload).is_ok_and(|h| h == self.sha256)
    }

    #[must_use]
    pub fn freshness(&self, ctx: &FreshnessContext) -> Freshness {
        let skew = Duration::seconds(FUTURE_SKEW_TOLERANCE_SECS);
        if self.observed_at > ctx.now + skew {
            return Freshness::Stale(format!(
                "observed_at {} is in the future",
                self.observed_at.to_rfc3339()
            ));
        }
        match self.evidence_class.ttl() {
            Ttl::Invocation if self.observed_at < ctx.invocation_started_at => Freshness::Stale(
                format!("{} must be probed during this invocation", self.evidence_class),
            ),
            Ttl::Window(window) if ctx.now - self.observed_at > window => Freshness::Stale(format!(
                "older than {}h",
                window.num_hours()
            )),
            Ttl::Session if self.observed_at < ctx.session_started_at => {
                Freshness::Stale("recorded before this session started".to_string())
            }
            _ => Freshness::Fresh,
        }
    }

    /// String field of the payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(serde_json::Value::as_str)
    }

    /// Repository identity carried by an `identity_signal` record.
    #[must_use]
    pub fn repo_identity(&self) -> Option<RepoIdentity> {
        if self.evidence_class != EvidenceClass::IdentitySignal {
            return None;
        }
        let fingerprint = self.payload_str("repo_fingerprint")?.trim();
        if fingerprint.is_empty() {
            return None;
        }
        Some(RepoIdentity {
            repo_fingerprint: fingerprint.to_string(),
            repo_root: self.payload_str("repo_root").map(str::to_string),
        })
    }
}

/// Resolved repository identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    pub repo_fingerprint: String,
    pub repo_root: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseguard_utils::test_support::fixed_now;
    use serde_json::json;

    fn ctx() -> FreshnessContext {
        let now = fixed_now();
        FreshnessContext {
            now,
            invocation_started_at: now - Duration::seconds(5),
            session_started_at: now - Duration::hours(2),
        }
    }

    fn rec(class: EvidenceClass, observed_at: DateTime<Utc>) -> Evidence {
        Evidence::seal("e1", class, observed_at, json!({"kind": "build", "exit_code": 0})).unwrap()
    }

    #[test]
    fn test_seal_and_verify() {
        let mut e = rec(EvidenceClass::GateEvidence, fixed_now());
        assert!(e.verify_integrity());
        assert_eq!(e.sha256.len(), 64);
        e.payload = json!({"kind": "build", "exit_code": 1});
        assert!(!e.verify_integrity());
    }

    #[test]
    fn test_gate_evidence_window() {
        let c = ctx();
        assert!(rec(EvidenceClass::GateEvidence, c.now - Duration::hours(24)).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::GateEvidence, c.now - Duration::hours(25)).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::RuntimeDiagnostic, c.now - Duration::days(3)).freshness(&c).is_fresh());
    }

    #[test]
    fn test_zero_ttl_classes_need_this_invocation() {
        let c = ctx();
        assert!(rec(EvidenceClass::PreflightProbe, c.now).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::PreflightProbe, c.now - Duration::seconds(6)).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::IdentitySignal, c.now - Duration::minutes(1)).freshness(&c).is_fresh());
    }

    #[test]
    fn test_operator_evidence_is_session_scoped() {
        let c = ctx();
        assert!(rec(EvidenceClass::OperatorProvided, c.now - Duration::hours(1)).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::OperatorProvided, c.now - Duration::hours(3)).freshness(&c).is_fresh());
    }

    #[test]
    fn test_future_beyond_skew_is_stale() {
        let c = ctx();
        assert!(rec(EvidenceClass::GateEvidence, c.now + Duration::minutes(4)).freshness(&c).is_fresh());
        assert!(!rec(EvidenceClass::GateEvidence, c.now + Duration::minutes(6)).freshness(&c).is_fresh());
    }

    #[test]
    fn test_repo_identity_requires_identity_class() {
        let e = Evidence::seal(
            "id-1",
            EvidenceClass::IdentitySignal,
            fixed_now(),
            json!({"repo_fingerprint": "abc", "repo_root": "${REPO_ROOT}"}),
        )
        .unwrap();
        assert_eq!(e.repo_identity().unwrap().repo_fingerprint, "abc");

        let other = Evidence::seal("x", EvidenceClass::GateEvidence, fixed_now(), json!({"repo_fingerprint": "abc"})).unwrap();
        assert!(other.repo_identity().is_none());
    }
}
