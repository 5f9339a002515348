//! Gate outcome types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use phaseguard_evidence::ReprobeRequest;
use phaseguard_reason::{ReasonCode, ReasonPayload};
use phaseguard_state::{ClaimResolution, ReviewFeedback};
use phaseguard_utils::types::{GateName, GateStatus};

/// Individual condition evaluated by a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCondition {
    /// Name of condition
    pub name: String,

    /// Whether the condition passed
    pub passed: bool,

    /// Actual value observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    /// Expected value for passing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl GateCondition {
    pub(crate) fn check(
        name: impl Into<String>,
        passed: bool,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed,
            actual: Some(actual.into()),
            expected: Some(expected.into()),
        }
    }
}

/// Result of evaluating one gate once.
///
/// Evaluation is pure: nothing here has been applied to session state. The
/// router consumes the outcome, and only when `iteration` still matches the
/// gate's recorded iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: GateName,
    pub status: GateStatus,
    /// Iteration slot this evaluation consumed
    pub iteration: u32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub questions: Vec<String>,
    /// Primary code explaining a non-approved status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "ReasonPayload::is_empty")]
    pub payload: ReasonPayload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reprobe: Vec<ReprobeRequest>,
    pub conditions: Vec<GateCondition>,
    /// History record for the architecture review loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<ReviewFeedback>,
    /// Claim id -> verification result, for evidence-backed gates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolutions: BTreeMap<String, ClaimResolution>,
    /// Payload for every code referenced by `resolutions`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolution_payloads: BTreeMap<ReasonCode, ReasonPayload>,
    /// Evidence records that backed verified claims
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_ids: Vec<String>,
}

impl GateOutcome {
    pub(crate) fn new(gate: GateName, iteration: u32) -> Self {
        Self {
            gate,
            status: GateStatus::Pending,
            iteration,
            issues: Vec::new(),
            suggestions: Vec::new(),
            questions: Vec::new(),
            reason_code: None,
            payload: ReasonPayload::new(),
            reprobe: Vec::new(),
            conditions: Vec::new(),
            feedback: None,
            resolutions: BTreeMap::new(),
            resolution_payloads: BTreeMap::new(),
            evidence_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.status == GateStatus::Approved
    }

    /// Keep the first reason offered, except that a blocking code displaces a
    /// non-blocking one.
    pub(crate) fn offer_reason(&mut self, code: ReasonCode, payload: ReasonPayload) {
        let replace = match self.reason_code {
            None => true,
            Some(current) => !current.is_blocking() && code.is_blocking(),
        };
        if replace {
            self.reason_code = Some(code);
            self.payload = payload;
        }
    }
}
