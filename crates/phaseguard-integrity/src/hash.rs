//! Ruleset and activation hashes.
//!
//! Both hashes are BLAKE3 over JCS documents, so field order in the inputs
//! never changes a digest. The activation hash is built from one digest per
//! [`HashCategory`]; comparing two activations diffs those digests and names
//! exactly which categories moved.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_state::IntegrityHashes;
use phaseguard_utils::canonicalization::hash_jcs;
use phaseguard_utils::types::ExecutionMode;

use crate::bundle::BundleManifest;
use crate::error::IntegrityError;

/// Input category of the activation hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashCategory {
    EngineVersion,
    PackHash,
    Lockfile,
    Capabilities,
    ResolvedPaths,
}

impl HashCategory {
    pub const ALL: [HashCategory; 5] = [
        Self::EngineVersion,
        Self::PackHash,
        Self::Lockfile,
        Self::Capabilities,
        Self::ResolvedPaths,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EngineVersion => "engine_version",
            Self::PackHash => "pack_hash",
            Self::Lockfile => "lockfile",
            Self::Capabilities => "capabilities",
            Self::ResolvedPaths => "resolved_paths",
        }
    }
}

impl fmt::Display for HashCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown hash category '{s}'"))
    }
}

/// Logged reason for an intentional hash change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum ChangeCause {
    EngineUpgrade { from: String, to: String },
    BundleVersionBump { bundle: String, from: String, to: String },
    CapabilityChange { detail: String },
    PathChange { detail: String },
}

impl ChangeCause {
    /// Categories this cause accounts for.
    #[must_use]
    pub fn explains(&self) -> &'static [HashCategory] {
        match self {
            Self::EngineUpgrade { .. } => &[HashCategory::EngineVersion],
            Self::BundleVersionBump { .. } => &[HashCategory::PackHash, HashCategory::Lockfile],
            Self::CapabilityChange { .. } => &[HashCategory::Capabilities],
            Self::PathChange { .. } => &[HashCategory::ResolvedPaths],
        }
    }
}

#[derive(Serialize)]
struct RulesetDocument<'a> {
    manifests: Vec<&'a BundleManifest>,
    /// `(path, blake3)` in resolution order
    files: Vec<(&'a str, &'a str)>,
    compatibility: BTreeMap<&'a str, bool>,
}

/// Hash of the resolved rule bundles, in resolution order.
///
/// `file_hashes` are the digests actually observed on disk, one list per
/// manifest, aligned with `manifests`.
pub fn ruleset_hash(
    manifests: &[BundleManifest],
    file_hashes: &[Vec<(String, String)>],
) -> Result<String, IntegrityError> {
    let doc = RulesetDocument {
        manifests: manifests.iter().collect(),
        files: file_hashes
            .iter()
            .flatten()
            .map(|(path, digest)| (path.as_str(), digest.as_str()))
            .collect(),
        compatibility: manifests
            .iter()
            .flat_map(|m| m.compatibility.iter().map(|(k, v)| (k.as_str(), *v)))
            .collect(),
    };
    Ok(hash_jcs(&doc)?)
}

/// Capability facts that feed the `capabilities` category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub repo_facts: BTreeMap<String, String>,
    pub signals: BTreeMap<String, bool>,
    pub execution_mode: ExecutionMode,
}

/// Everything the activation hash covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInputs {
    pub engine_version: String,
    /// Ruleset hash of the selected bundle set
    pub pack_hash: String,
    /// BLAKE3 of the raw lock file bytes
    pub lockfile: String,
    pub capabilities: Capabilities,
    pub resolved_paths: BTreeMap<String, String>,
}

impl ActivationInputs {
    fn category_digests(&self) -> Result<BTreeMap<HashCategory, String>, IntegrityError> {
        let mut out = BTreeMap::new();
        out.insert(HashCategory::EngineVersion, hash_jcs(&self.engine_version)?);
        out.insert(HashCategory::PackHash, hash_jcs(&self.pack_hash)?);
        out.insert(HashCategory::Lockfile, hash_jcs(&self.lockfile)?);
        out.insert(HashCategory::Capabilities, hash_jcs(&self.capabilities)?);
        out.insert(HashCategory::ResolvedPaths, hash_jcs(&self.resolved_paths)?);
        Ok(out)
    }

    /// Compute the hashes persisted beside session state.
    pub fn hashes(&self) -> Result<IntegrityHashes, IntegrityError> {
        let digests = self.category_digests()?;
        let categories: BTreeMap<String, String> = digests
            .iter()
            .map(|(c, d)| (c.as_str().to_string(), d.clone()))
            .collect();
        Ok(IntegrityHashes {
            ruleset_hash: self.pack_hash.clone(),
            activation_hash: hash_jcs(&categories)?,
            categories,
        })
    }
}

/// One category whose digest moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDrift {
    pub category: HashCategory,
    pub previous: String,
    pub current: String,
}

/// Result of comparing an activation against the persisted one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum HashVerdict {
    /// Nothing persisted yet
    FirstActivation,
    Unchanged,
    /// Every changed category has a logged cause
    Explained { drift: Vec<CategoryDrift> },
    /// At least one changed category has no cause
    Mismatch {
        drift: Vec<CategoryDrift>,
        unexplained: Vec<HashCategory>,
    },
}

impl HashVerdict {
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }

    /// Changed categories, sorted.
    #[must_use]
    pub fn changed(&self) -> Vec<HashCategory> {
        match self {
            Self::Explained { drift } | Self::Mismatch { drift, .. } => {
                drift.iter().map(|d| d.category).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Reason to attach, if the verdict needs one.
    #[must_use]
    pub fn reason(&self) -> Option<(ReasonCode, ReasonPayload)> {
        let code = match self {
            Self::Mismatch { .. } => ReasonCode::HashMismatch,
            Self::Explained { .. } => ReasonCode::HashChangeExplained,
            Self::FirstActivation | Self::Unchanged => return None,
        };
        let joined = self
            .changed()
            .iter()
            .map(HashCategory::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Some((code, payload_of([("changed_categories", joined)])))
    }
}

/// Diff `current` against `previous` and check each change has a cause.
#[must_use]
pub fn compare(
    previous: Option<&IntegrityHashes>,
    current: &IntegrityHashes,
    causes: &[ChangeCause],
) -> HashVerdict {
    let Some(previous) = previous else {
        return HashVerdict::FirstActivation;
    };
    if previous.activation_hash == current.activation_hash
        && previous.ruleset_hash == current.ruleset_hash
    {
        return HashVerdict::Unchanged;
    }

    let mut drift = Vec::new();
    for category in HashCategory::ALL {
        let before = previous.categories.get(category.as_str());
        let after = current.categories.get(category.as_str());
        if before != after {
            drift.push(CategoryDrift {
                category,
                previous: before.cloned().unwrap_or_default(),
                current: after.cloned().unwrap_or_default(),
            });
        }
    }
    // A ruleset change that somehow left the category digests alone still counts.
    if previous.ruleset_hash != current.ruleset_hash
        && !drift.iter().any(|d| d.category == HashCategory::PackHash)
    {
        drift.push(CategoryDrift {
            category: HashCategory::PackHash,
            previous: previous.ruleset_hash.clone(),
            current: current.ruleset_hash.clone(),
        });
    }
    drift.sort_by(|a, b| a.category.as_str().cmp(b.category.as_str()));

    let explained: BTreeSet<HashCategory> =
        causes.iter().flat_map(|c| c.explains().iter().copied()).collect();
    let unexplained: Vec<HashCategory> = drift
        .iter()
        .map(|d| d.category)
        .filter(|c| !explained.contains(c))
        .collect();

    if drift.is_empty() {
        HashVerdict::Unchanged
    } else if unexplained.is_empty() {
        HashVerdict::Explained { drift }
    } else {
        tracing::warn!(
            unexplained = ?unexplained.iter().map(HashCategory::as_str).collect::<Vec<_>>(),
            "activation hash mismatch"
        );
        HashVerdict::Mismatch { drift, unexplained }
    }
}
