use thiserror::Error;

use phaseguard_reason::{ReasonCode, ReasonPayload, payload_of};
use phaseguard_utils::error::{CanonicalError, ErrorCategory, FsError, UserFriendlyError};

use crate::hash::HashCategory;
use crate::lifecycle::RollbackTrigger;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Bundle manifest in {dir} is unusable: {detail}")]
    Manifest { dir: String, detail: String },

    #[error("Bundle {bundle}: file {path} does not match its manifest digest")]
    FileHashMismatch {
        bundle: String,
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Bundle {bundle}: file {path} escapes the bundle directory")]
    UnsafePath { bundle: String, path: String },

    #[error("Bundle {bundle} does not match its lock: {detail}")]
    LockMismatch { bundle: String, detail: String },

    #[error("Bundle {bundle} needs engine {required} or newer, running {engine}")]
    EngineTooOld {
        bundle: String,
        required: String,
        engine: String,
    },

    #[error("Bundle {bundle} failed its smoke test: {detail}")]
    SmokeTestFailed { bundle: String, detail: String },

    #[error("Activation hash changed without a recorded cause: {}", join(.unexplained))]
    HashMismatch { unexplained: Vec<HashCategory> },

    #[error("No previous bundle to roll back to after {trigger}")]
    RollbackUnavailable { trigger: RollbackTrigger },

    #[error("Activation pointer is unreadable: {detail}")]
    Pointer { detail: String },

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

fn join(categories: &[HashCategory]) -> String {
    categories
        .iter()
        .map(HashCategory::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl IntegrityError {
    /// Rollback trigger this failure corresponds to, when it has one.
    #[must_use]
    pub fn trigger(&self) -> Option<RollbackTrigger> {
        match self {
            Self::Manifest { .. }
            | Self::UnsafePath { .. }
            | Self::EngineTooOld { .. }
            | Self::SmokeTestFailed { .. } => Some(RollbackTrigger::BundleIncompatible),
            Self::FileHashMismatch { .. } | Self::LockMismatch { .. } | Self::HashMismatch { .. } => {
                Some(RollbackTrigger::IntegrityMismatch)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> (ReasonCode, ReasonPayload) {
        match self {
            Self::Manifest { dir, detail } => (
                ReasonCode::BundleIncompatible,
                payload_of([("bundle", dir.as_str()), ("detail", detail.as_str())]),
            ),
            Self::FileHashMismatch { bundle, path, .. } => (
                ReasonCode::BundleIncompatible,
                payload_of([("bundle", bundle.clone()), ("detail", format!("file {path} digest mismatch"))]),
            ),
            Self::UnsafePath { bundle, path } => (
                ReasonCode::BundleIncompatible,
                payload_of([("bundle", bundle.clone()), ("detail", format!("unsafe path {path}"))]),
            ),
            Self::LockMismatch { bundle, detail } | Self::SmokeTestFailed { bundle, detail } => (
                ReasonCode::BundleIncompatible,
                payload_of([("bundle", bundle.as_str()), ("detail", detail.as_str())]),
            ),
            Self::EngineTooOld {
                bundle,
                required,
                engine,
            } => (
                ReasonCode::BundleIncompatible,
                payload_of([
                    ("bundle", bundle.clone()),
                    ("detail", format!("requires engine {required}, running {engine}")),
                ]),
            ),
            Self::HashMismatch { unexplained } => (
                ReasonCode::HashMismatch,
                payload_of([("changed_categories", join(unexplained))]),
            ),
            Self::RollbackUnavailable { trigger } => (
                ReasonCode::RollbackUnavailable,
                payload_of([("trigger", trigger.as_str())]),
            ),
            Self::Pointer { detail } => (
                ReasonCode::StateSchemaInvalid,
                payload_of([("detail", detail.as_str())]),
            ),
            Self::Fs(e) => (
                ReasonCode::InvariantViolation,
                payload_of([("invariant", "filesystem".to_string()), ("detail", e.to_string())]),
            ),
            Self::Canonical(e) => (
                ReasonCode::InvariantViolation,
                payload_of([("invariant", "canonical-json".to_string()), ("detail", e.to_string())]),
            ),
        }
    }
}

impl UserFriendlyError for IntegrityError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::HashMismatch { .. } => Some(
                "Every change to the activation inputs needs a logged cause such as a version bump"
                    .to_string(),
            ),
            Self::RollbackUnavailable { .. } => {
                Some("Only one previous bundle is ever kept".to_string())
            }
            Self::Fs(e) => e.context(),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::HashMismatch { .. } => vec![
                "Bump the bundle version and regenerate its lock".to_string(),
                "Or run `phaseguard rollback-engine --trigger integrity-mismatch`".to_string(),
            ],
            Self::RollbackUnavailable { .. } => {
                vec!["Stage and activate a known-good bundle with `phaseguard activate --bundle <dir>`".to_string()]
            }
            Self::Fs(e) => e.suggestions(),
            _ => vec!["Rebuild the bundle and its lock, then run `phaseguard activate --bundle <dir>`".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fs(_) => ErrorCategory::FileSystem,
            _ => ErrorCategory::Integrity,
        }
    }
}
