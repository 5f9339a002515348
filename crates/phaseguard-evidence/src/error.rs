use thiserror::Error;

use phaseguard_utils::error::{ErrorCategory, FsError, UserFriendlyError};

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("Invalid evidence record: {0}")]
    Invalid(String),

    #[error("Evidence '{evidence_id}' already recorded")]
    Duplicate { evidence_id: String },

    #[error("Evidence '{evidence_id}' failed integrity check")]
    Integrity { evidence_id: String },

    #[error("Corrupt evidence log {path} at line {line}: {reason}")]
    CorruptLog {
        path: String,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl UserFriendlyError for EvidenceError {
    fn user_message(&self) -> String {
        match self {
            Self::Invalid(reason) => format!("Evidence record rejected: {reason}"),
            Self::Duplicate { evidence_id } => {
                format!("An evidence record with id '{evidence_id}' already exists")
            }
            Self::Integrity { evidence_id } => {
                format!("Evidence '{evidence_id}' does not match its sha256")
            }
            Self::CorruptLog { path, line, .. } => {
                format!("Evidence log '{path}' is corrupt at line {line}")
            }
            Self::Fs(e) => e.user_message(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Duplicate { .. } => {
                Some("Evidence records are immutable once recorded".to_string())
            }
            Self::CorruptLog { reason, .. } => Some(reason.clone()),
            Self::Fs(e) => e.context(),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Duplicate { .. } => vec!["Record the new observation under a fresh id".to_string()],
            Self::Integrity { .. } => {
                vec!["Re-run the probe that produced this evidence".to_string()]
            }
            Self::CorruptLog { .. } => vec![
                "Restore evidence.jsonl from a backup or start a new run".to_string(),
            ],
            Self::Fs(e) => e.suggestions(),
            Self::Invalid(_) => Vec::new(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Integrity { .. } | Self::CorruptLog { .. } => ErrorCategory::Integrity,
            Self::Fs(_) => ErrorCategory::FileSystem,
            _ => ErrorCategory::Validation,
        }
    }
}
