//! JSON input files accepted by the run commands.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::EngineError;
use crate::evidence::{ClaimKind, Evidence, EvidenceClass, EvidenceError};
use crate::state::ClaimEntry;
use crate::types::GateName;

/// Read and parse a JSON file; `what` names it in error messages.
pub fn read_json<T: DeserializeOwned>(path: &Utf8Path, what: &str) -> Result<T, EngineError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| EngineError::InvalidInput(format!("{what} file {path}: {e}")))
}

/// An evidence record as a caller writes it. The engine seals it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceInput {
    pub evidence_id: String,
    pub evidence_class: EvidenceClass,
    /// Defaults to the invocation time
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Checked against the sealed hash when given
    #[serde(default)]
    pub sha256: Option<String>,
}

impl EvidenceInput {
    pub fn seal(self, now: DateTime<Utc>) -> Result<Evidence, EngineError> {
        let sealed = Evidence::seal(
            self.evidence_id,
            self.evidence_class,
            self.observed_at.unwrap_or(now),
            Value::Object(self.payload),
        )?;
        if let Some(claimed) = self.sha256
            && !claimed.trim().eq_ignore_ascii_case(&sealed.sha256)
        {
            return Err(EvidenceError::Integrity {
                evidence_id: sealed.evidence_id,
            }
            .into());
        }
        Ok(sealed)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimInput {
    pub claim_id: String,
    #[serde(default)]
    pub label: String,
    pub kind: ClaimKind,
    pub required_class: EvidenceClass,
    /// Gate name, e.g. `P5.3-TestQuality`
    pub gate: String,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

impl ClaimInput {
    pub fn into_entry(self) -> Result<(String, ClaimEntry), EngineError> {
        let gate: GateName = self.gate.parse().map_err(EngineError::InvalidInput)?;
        let label = if self.label.trim().is_empty() {
            self.claim_id.clone()
        } else {
            self.label
        };
        Ok((
            self.claim_id,
            ClaimEntry {
                label,
                kind: self.kind,
                required_class: self.required_class,
                gate,
                evidence_ids: self.evidence_ids,
                resolution: None,
            },
        ))
    }
}
