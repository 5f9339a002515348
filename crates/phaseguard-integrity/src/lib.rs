//! Integrity of the rules a run is governed by.
//!
//! [`hash`] computes the ruleset and activation hashes and diffs them by
//! category. [`bundle`] stages a rule bundle against its manifest and lock.
//! [`lifecycle`] owns the two-slot activation pointer, automatic rollback and
//! the audit trail.

pub mod bundle;
pub mod error;
pub mod hash;
pub mod lifecycle;

pub use bundle::{
    BundleLock, BundleManifest, LOCK_FILE, MANIFEST_FILE, ManifestFile, StagedBundle, lock_bundle, stage,
    version_at_least,
};
pub use error::IntegrityError;
pub use hash::{
    ActivationInputs, Capabilities, CategoryDrift, ChangeCause, HashCategory, HashVerdict, compare,
    ruleset_hash,
};
pub use lifecycle::{
    ActivationOutcome, ActivationPointer, ActivationRecord, AuditEntry, CRASH_LOOP_THRESHOLD,
    LifecycleManager, RollbackRecord, RollbackTrigger, SmokeTest,
};
