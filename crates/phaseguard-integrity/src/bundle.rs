//! Rule bundles and their lock files.
//!
//! A bundle directory holds `bundle.toml` (the manifest, listing every file
//! in resolution order with its BLAKE3 digest) and `bundle.lock`, which pins
//! the ruleset hash of the resolved set. Staging re-hashes every file and
//! refuses on any disagreement.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use phaseguard_utils::atomic_write::{read_optional, write_file_atomic};
use phaseguard_utils::canonicalization::blake3_hex;

use crate::error::IntegrityError;
use crate::hash::ruleset_hash;

pub const MANIFEST_FILE: &str = "bundle.toml";
pub const LOCK_FILE: &str = "bundle.lock";
pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub name: String,
    pub version: String,
    pub min_engine_version: String,
    #[serde(default)]
    pub compatibility: BTreeMap<String, bool>,
    /// Capability signals the bundle declares
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    /// Files in resolution order
    #[serde(default, rename = "file")]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestFile {
    pub path: String,
    pub blake3: String,
}

/// Pins the resolved bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleLock {
    pub lock_version: u32,
    pub bundle: String,
    pub version: String,
    pub ruleset_hash: String,
}

/// A bundle that passed every staging check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBundle {
    pub dir: Utf8PathBuf,
    pub manifest: BundleManifest,
    /// `(path, blake3)` as observed on disk, in resolution order
    pub file_hashes: Vec<(String, String)>,
    pub ruleset_hash: String,
    /// BLAKE3 of the raw lock file
    pub lock_hash: String,
}

impl StagedBundle {
    /// `name@version`, as written into audit records.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.manifest.name, self.manifest.version)
    }
}

/// Verify a bundle directory: file digests against the manifest, the
/// ruleset hash against the lock, and the engine version floor.
pub fn stage(dir: &Utf8Path, engine_version: &str) -> Result<StagedBundle, IntegrityError> {
    let (manifest, file_hashes) = resolve(dir)?;
    let bundle = manifest.name.clone();

    if !version_at_least(engine_version, &manifest.min_engine_version) {
        return Err(IntegrityError::EngineTooOld {
            bundle,
            required: manifest.min_engine_version.clone(),
            engine: engine_version.to_string(),
        });
    }

    for ((path, actual), declared) in file_hashes.iter().zip(&manifest.files) {
        if !actual.eq_ignore_ascii_case(&declared.blake3) {
            return Err(IntegrityError::FileHashMismatch {
                bundle,
                path: path.clone(),
                expected: declared.blake3.clone(),
                actual: actual.clone(),
            });
        }
    }

    let computed = ruleset_hash(std::slice::from_ref(&manifest), std::slice::from_ref(&file_hashes))?;

    let lock_path = dir.join(LOCK_FILE);
    let Some(lock_text) = read_optional(&lock_path)? else {
        return Err(IntegrityError::LockMismatch {
            bundle,
            detail: format!("{LOCK_FILE} is missing"),
        });
    };
    let lock: BundleLock = toml::from_str(&lock_text).map_err(|e| IntegrityError::LockMismatch {
        bundle: bundle.clone(),
        detail: format!("{LOCK_FILE} does not parse: {e}"),
    })?;
    let lock_problem = if lock.lock_version != LOCK_VERSION {
        Some(format!("lock_version {} is not {LOCK_VERSION}", lock.lock_version))
    } else if lock.bundle != manifest.name || lock.version != manifest.version {
        Some(format!(
            "lock pins {}@{}, manifest is {}@{}",
            lock.bundle, lock.version, manifest.name, manifest.version
        ))
    } else if lock.ruleset_hash != computed {
        Some("ruleset hash differs from the pinned value".to_string())
    } else {
        None
    };
    if let Some(detail) = lock_problem {
        return Err(IntegrityError::LockMismatch { bundle, detail });
    }

    tracing::info!(bundle = %manifest.name, version = %manifest.version, ruleset_hash = %computed, "bundle staged");
    Ok(StagedBundle {
        dir: dir.to_path_buf(),
        manifest,
        file_hashes,
        ruleset_hash: computed,
        lock_hash: blake3_hex(lock_text.as_bytes()),
    })
}

/// Write `bundle.lock` pinning the bundle as it is on disk now.
pub fn lock_bundle(dir: &Utf8Path) -> Result<BundleLock, IntegrityError> {
    let (manifest, file_hashes) = resolve(dir)?;
    let lock = BundleLock {
        lock_version: LOCK_VERSION,
        bundle: manifest.name.clone(),
        version: manifest.version.clone(),
        ruleset_hash: ruleset_hash(std::slice::from_ref(&manifest), std::slice::from_ref(&file_hashes))?,
    };
    let text = toml::to_string(&lock).map_err(|e| IntegrityError::Manifest {
        dir: dir.to_string(),
        detail: e.to_string(),
    })?;
    write_file_atomic(&dir.join(LOCK_FILE), &text)?;
    Ok(lock)
}

fn resolve(dir: &Utf8Path) -> Result<(BundleManifest, Vec<(String, String)>), IntegrityError> {
    let manifest_err = |detail: String| IntegrityError::Manifest {
        dir: dir.to_string(),
        detail,
    };
    let text = read_optional(&dir.join(MANIFEST_FILE))?
        .ok_or_else(|| manifest_err(format!("{MANIFEST_FILE} is missing")))?;
    let manifest: BundleManifest =
        toml::from_str(&text).map_err(|e| manifest_err(e.to_string()))?;
    if manifest.files.is_empty() {
        return Err(manifest_err("manifest lists no files".to_string()));
    }

    let mut hashes = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        if !is_contained(&file.path) {
            return Err(IntegrityError::UnsafePath {
                bundle: manifest.name.clone(),
                path: file.path.clone(),
            });
        }
        let bytes = std::fs::read(dir.join(&file.path))
            .map_err(|e| manifest_err(format!("cannot read {}: {e}", file.path)))?;
        hashes.push((file.path.clone(), blake3_hex(&bytes)));
    }
    Ok((manifest, hashes))
}

fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && Utf8Path::new(path)
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_) | Utf8Component::CurDir))
}

/// Dotted numeric comparison; missing components count as zero.
#[must_use]
pub fn version_at_least(have: &str, need: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .map_while(|p| p.parse().ok())
            .collect()
    }
    let (mut have, mut need) = (parts(have), parts(need));
    let len = have.len().max(need.len());
    have.resize(len, 0);
    need.resize(len, 0);
    have >= need
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Write a one-file bundle and lock it.
    pub(crate) fn write_bundle(dir: &Utf8Path, version: &str, rules: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("rules.md"), rules).unwrap();
        let manifest = format!(
            "name = \"core\"\nversion = \"{version}\"\nmin_engine_version = \"1.0.0\"\n\n\
             [capabilities]\nstructured-evidence = true\n\n\
             [[file]]\npath = \"rules.md\"\nblake3 = \"{}\"\n",
            blake3_hex(rules.as_bytes())
        );
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        lock_bundle(dir).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::write_bundle;
    use super::*;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("core")).unwrap()
    }

    #[test]
    fn test_stage_accepts_locked_bundle() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        write_bundle(&dir, "1.0.0", "rule one");
        let staged = stage(&dir, "1.0.0").unwrap();
        assert_eq!(staged.label(), "core@1.0.0");
        assert_eq!(staged.file_hashes.len(), 1);
        assert_eq!(staged.ruleset_hash.len(), 64);
    }

    #[test]
    fn test_stage_detects_edited_file() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        write_bundle(&dir, "1.0.0", "rule one");
        std::fs::write(dir.join("rules.md"), "rule one, edited").unwrap();
        let err = stage(&dir, "1.0.0").unwrap_err();
        assert!(matches!(err, IntegrityError::FileHashMismatch { .. }));
        assert_eq!(err.trigger(), Some(crate::lifecycle::RollbackTrigger::IntegrityMismatch));
    }

    #[test]
    fn test_stage_detects_stale_lock() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        write_bundle(&dir, "1.0.0", "rule one");
        let mut lock: BundleLock =
            toml::from_str(&std::fs::read_to_string(dir.join(LOCK_FILE)).unwrap()).unwrap();
        lock.ruleset_hash = "0".repeat(64);
        std::fs::write(dir.join(LOCK_FILE), toml::to_string(&lock).unwrap()).unwrap();
        assert!(matches!(stage(&dir, "1.0.0"), Err(IntegrityError::LockMismatch { .. })));
    }

    #[test]
    fn test_stage_enforces_engine_floor() {
        let tmp = TempDir::new().unwrap();
        let dir = utf8(&tmp);
        write_bundle(&dir, "1.0.0", "rule one");
        let err = stage(&dir, "0.9.4").unwrap_err();
        let (code, payload) = err.reason();
        assert_eq!(code, phaseguard_reason::ReasonCode::BundleIncompatible);
        assert_eq!(payload["bundle"], "core");
    }

    #[test]
    fn test_unsafe_paths_are_refused() {
        assert!(is_contained("rules/a.md"));
        assert!(!is_contained("../a.md"));
        assert!(!is_contained("/etc/passwd"));
        assert!(!is_contained("rules\\a.md"));
        assert!(!is_contained(""));
    }

    #[test]
    fn test_version_compare() {
        assert!(version_at_least("1.0.0", "1.0"));
        assert!(version_at_least("1.10.0", "1.9.9"));
        assert!(!version_at_least("1.0.0", "1.0.1"));
        assert!(version_at_least("v2.0.0-rc1", "2.0.0"));
    }
}
