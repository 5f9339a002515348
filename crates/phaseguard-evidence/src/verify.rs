//! Claim verification.
//!
//! A claim is verified only when a trusted, fresh record of the required
//! class backs it and the record's result agrees with the claim. Everything
//! else is a `NOT_VERIFIED-*` verdict (or `BLOCKED-EVIDENCE-INTEGRITY` when the
//! only matching records are tampered).

use serde::{Deserialize, Serialize};

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};

use crate::claim::{Claim, ClaimKind, RunResult};
use crate::record::{Evidence, EvidenceClass, Freshness, FreshnessContext};

/// Ask the caller to probe again before the claim can be re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprobeRequest {
    pub claim_id: String,
    pub evidence_class: EvidenceClass,
    pub previous_evidence_id: String,
}

/// Result of checking one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimVerdict {
    Verified {
        claim_id: String,
        evidence_id: String,
    },
    Missing {
        claim_id: String,
    },
    Stale {
        claim_id: String,
        evidence_id: String,
        reason: String,
        reprobe: ReprobeRequest,
    },
    TypeMismatch {
        claim_id: String,
        evidence_id: String,
        expected: EvidenceClass,
        actual: EvidenceClass,
    },
    Contradicted {
        claim_id: String,
        evidence_id: String,
    },
    /// Every candidate record failed its integrity check
    Untrusted {
        claim_id: String,
        evidence_id: String,
    },
}

impl ClaimVerdict {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    #[must_use]
    pub fn claim_id(&self) -> &str {
        match self {
            Self::Verified { claim_id, .. }
            | Self::Missing { claim_id }
            | Self::Stale { claim_id, .. }
            | Self::TypeMismatch { claim_id, .. }
            | Self::Contradicted { claim_id, .. }
            | Self::Untrusted { claim_id, .. } => claim_id,
        }
    }

    /// Code describing a failed verdict. `None` when verified.
    #[must_use]
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::Verified { .. } => None,
            Self::Missing { .. } => Some(ReasonCode::NotVerifiedMissingEvidence),
            Self::Stale { .. } => Some(ReasonCode::EvidenceStale),
            Self::TypeMismatch { .. } => Some(ReasonCode::EvidenceTypeMismatch),
            Self::Contradicted { .. } => Some(ReasonCode::EvidenceContradicts),
            Self::Untrusted { .. } => Some(ReasonCode::EvidenceIntegrity),
        }
    }

    /// Payload matching [`Self::reason_code`]'s required fields.
    #[must_use]
    pub fn payload(&self) -> ReasonPayload {
        match self {
            Self::Verified {
                claim_id,
                evidence_id,
            } => payload_of([("claim_id", claim_id.as_str()), ("evidence_id", evidence_id.as_str())]),
            Self::Missing { claim_id } => payload_of([("claim_id", claim_id.as_str())]),
            Self::Stale {
                claim_id,
                evidence_id,
                reason,
                ..
            } => payload_of([
                ("claim_id", claim_id.as_str()),
                ("evidence_id", evidence_id.as_str()),
                ("detail", reason.as_str()),
            ]),
            Self::TypeMismatch {
                claim_id,
                evidence_id,
                expected,
                actual,
            } => payload_of([
                ("claim_id", claim_id.as_str()),
                ("evidence_id", evidence_id.as_str()),
                ("expected", expected.as_str()),
                ("actual", actual.as_str()),
            ]),
            Self::Contradicted {
                claim_id,
                evidence_id,
            }
            | Self::Untrusted {
                claim_id,
                evidence_id,
            } => payload_of([("claim_id", claim_id.as_str()), ("evidence_id", evidence_id.as_str())]),
        }
    }

    #[must_use]
    pub fn reprobe(&self) -> Option<&ReprobeRequest> {
        match self {
            Self::Stale { reprobe, .. } => Some(reprobe),
            _ => None,
        }
    }
}

/// Check `claim` against `records`.
///
/// Records cited by id (or carrying the claim id) are preferred; a label
/// match is only used when nothing cites the claim. Among candidates the most
/// recent `observed_at` wins, ties going to the lexically smallest id.
#[must_use]
pub fn verify_claim(claim: &Claim, records: &[Evidence], ctx: &FreshnessContext) -> ClaimVerdict {
    let mut candidates: Vec<&Evidence> = records.iter().filter(|e| claim.cites(e)).collect();
    if candidates.is_empty() {
        candidates = records.iter().filter(|e| claim.matches_label(e)).collect();
    }
    if candidates.is_empty() {
        return ClaimVerdict::Missing {
            claim_id: claim.claim_id.clone(),
        };
    }

    let (mut trusted, untrusted): (Vec<&Evidence>, Vec<&Evidence>) =
        candidates.into_iter().partition(|e| e.verify_integrity());
    if trusted.is_empty() {
        let mut ids: Vec<&str> = untrusted.iter().map(|e| e.evidence_id.as_str()).collect();
        ids.sort_unstable();
        tracing::warn!(claim = %claim.claim_id, evidence = ?ids, "only tampered evidence matched claim");
        return ClaimVerdict::Untrusted {
            claim_id: claim.claim_id.clone(),
            evidence_id: ids.first().copied().unwrap_or_default().to_string(),
        };
    }
    trusted.sort_by(|a, b| {
        b.observed_at
            .cmp(&a.observed_at)
            .then_with(|| a.evidence_id.cmp(&b.evidence_id))
    });
    let chosen = trusted[0];

    let claim_id = claim.claim_id.clone();
    let evidence_id = chosen.evidence_id.clone();

    if chosen.evidence_class != claim.required_class {
        return ClaimVerdict::TypeMismatch {
            claim_id,
            evidence_id,
            expected: claim.required_class,
            actual: chosen.evidence_class,
        };
    }

    let result = RunResult::from_payload(&chosen.payload);
    if claim.kind != ClaimKind::Attested && !result.is_some_and(|r| r.answers(claim.kind)) {
        return ClaimVerdict::TypeMismatch {
            claim_id,
            evidence_id,
            expected: claim.required_class,
            actual: chosen.evidence_class,
        };
    }

    if let Freshness::Stale(reason) = chosen.freshness(ctx) {
        return ClaimVerdict::Stale {
            reprobe: ReprobeRequest {
                claim_id: claim_id.clone(),
                evidence_class: claim.required_class,
                previous_evidence_id: evidence_id.clone(),
            },
            claim_id,
            evidence_id,
            reason,
        };
    }

    if result.is_some_and(|r| !r.succeeded()) {
        return ClaimVerdict::Contradicted {
            claim_id,
            evidence_id,
        };
    }

    ClaimVerdict::Verified {
        claim_id,
        evidence_id,
    }
}
