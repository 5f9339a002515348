//! Claims and the run results that back them.

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::record::{Evidence, EvidenceClass};

/// What a claim asserts about the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// A test run passed
    TestsPass,
    /// A build succeeded
    BuildSucceeds,
    /// An operator attests to something; any matching record backs it
    Attested,
}

/// A statement the engine must not accept without evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub label: String,
    pub kind: ClaimKind,
    pub required_class: EvidenceClass,
    /// Records explicitly cited by the claimant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_ids: Vec<String>,
}

impl Claim {
    #[must_use]
    pub fn new(
        claim_id: impl Into<String>,
        label: impl Into<String>,
        kind: ClaimKind,
        required_class: EvidenceClass,
    ) -> Self {
        Self {
            claim_id: claim_id.into(),
            label: label.into(),
            kind,
            required_class,
            evidence_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn citing(mut self, evidence_id: impl Into<String>) -> Self {
        self.evidence_ids.push(evidence_id.into());
        self
    }

    /// Whether `evidence` is addressed to this claim by id.
    #[must_use]
    pub fn cites(&self, evidence: &Evidence) -> bool {
        self.evidence_ids.iter().any(|id| *id == evidence.evidence_id)
            || evidence.evidence_id == self.claim_id
            || evidence.payload_str("claim_id") == Some(self.claim_id.as_str())
    }

    /// Whether `evidence` carries a label that normalizes to this claim's label.
    #[must_use]
    pub fn matches_label(&self, evidence: &Evidence) -> bool {
        let own = slug(&self.label);
        !own.is_empty() && evidence.payload_str("label").map(slug).as_deref() == Some(own.as_str())
    }
}

/// Normalized matching key: NFKD, ASCII alphanumerics only, lowercase,
/// runs of anything else collapsed to a single `-`.
#[must_use]
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.nfkd() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else if !c.is_ascii() && !c.is_alphanumeric() {
            // combining marks left over from decomposition
            continue;
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Outcome carried by a `test_run` or `build` evidence payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunResult {
    TestRun {
        passed: u64,
        failed: u64,
        #[serde(default)]
        skipped: u64,
        exit_code: i32,
    },
    Build {
        exit_code: i32,
    },
}

impl RunResult {
    /// Parse the structured result from an evidence payload.
    #[must_use]
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        match self {
            Self::TestRun {
                failed, exit_code, ..
            } => *failed == 0 && *exit_code == 0,
            Self::Build { exit_code } => *exit_code == 0,
        }
    }

    /// Whether this result is the kind of outcome `kind` talks about.
    #[must_use]
    pub fn answers(&self, kind: ClaimKind) -> bool {
        matches!(
            (self, kind),
            (Self::TestRun { .. }, ClaimKind::TestsPass) | (Self::Build { .. }, ClaimKind::BuildSucceeds)
        )
    }
}
