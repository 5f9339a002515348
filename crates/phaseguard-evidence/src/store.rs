use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashSet;

use phaseguard_utils::atomic_write::{append_line, read_optional};

use crate::error::EvidenceError;
use crate::record::Evidence;

/// Append-only evidence log, one JSON record per line.
///
/// Records are never rewritten. Re-recording an id is refused rather than
/// replacing the earlier observation.
#[derive(Debug, Default)]
pub struct EvidenceStore {
    path: Option<Utf8PathBuf>,
    records: Vec<Evidence>,
    ids: HashSet<String>,
}

impl EvidenceStore {
    /// Store with no backing file.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path`. A missing file is an empty store; a corrupt line is an error.
    pub fn open(path: &Utf8Path) -> Result<Self, EvidenceError> {
        let mut store = Self {
            path: Some(path.to_owned()),
            ..Self::default()
        };
        let Some(content) = read_optional(path)? else {
            return Ok(store);
        };
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Evidence =
                serde_json::from_str(line).map_err(|e| EvidenceError::CorruptLog {
                    path: path.to_string(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            if !store.ids.insert(record.evidence_id.clone()) {
                return Err(EvidenceError::CorruptLog {
                    path: path.to_string(),
                    line: idx + 1,
                    reason: format!("duplicate evidence_id '{}'", record.evidence_id),
                });
            }
            store.records.push(record);
        }
        tracing::debug!(path = %path, records = store.records.len(), "loaded evidence log");
        Ok(store)
    }

    /// Refusals [`append`](Self::append) would give for `record`, without
    /// touching the log.
    pub fn check_appendable(&self, record: &Evidence) -> Result<(), EvidenceError> {
        if self.ids.contains(&record.evidence_id) {
            return Err(EvidenceError::Duplicate {
                evidence_id: record.evidence_id.clone(),
            });
        }
        if !record.verify_integrity() {
            return Err(EvidenceError::Integrity {
                evidence_id: record.evidence_id.clone(),
            });
        }
        Ok(())
    }

    /// Append a sealed record.
    pub fn append(&mut self, record: Evidence) -> Result<(), EvidenceError> {
        self.check_appendable(&record)?;
        if let Some(path) = &self.path {
            let line = serde_json::to_string(&record)
                .map_err(|e| EvidenceError::Invalid(e.to_string()))?;
            append_line(path, &line)?;
        }
        tracing::info!(
            evidence_id = %record.evidence_id,
            class = %record.evidence_class,
            "evidence recorded"
        );
        self.ids.insert(record.evidence_id.clone());
        self.records.push(record);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, evidence_id: &str) -> Option<&Evidence> {
        self.records.iter().find(|r| r.evidence_id == evidence_id)
    }

    #[must_use]
    pub fn records(&self) -> &[Evidence] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
