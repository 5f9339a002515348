use std::fmt;
use std::io;
use thiserror::Error;

/// Trait for errors that can render a message, context and actionable
/// suggestions for an operator.
///
/// Every crate-level error in the workspace implements this so the CLI can
/// print a consistent report regardless of which component refused.
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get contextual information about the error
    fn context(&self) -> Option<String>;

    /// Get suggested actions to resolve the error
    fn suggestions(&self) -> Vec<String>;

    /// Get the error category for grouping similar errors
    fn category(&self) -> ErrorCategory;

    /// Render message, context and suggestions as a single block of text.
    fn display_for_user(&self) -> String {
        let mut output = format!("Error: {}\n", self.user_message());
        if let Some(ctx) = self.context() {
            output.push_str(&format!("\nContext: {ctx}\n"));
        }
        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
            output.push_str("\nSuggestions:\n");
            for suggestion in suggestions {
                output.push_str(&format!("  • {suggestion}\n"));
            }
        }
        output
    }
}

/// Categories of errors for better organization and handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    FileSystem,
    Concurrency,
    Validation,
    Integrity,
    Workflow,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "Configuration"),
            Self::FileSystem => write!(f, "File System"),
            Self::Concurrency => write!(f, "Concurrency"),
            Self::Validation => write!(f, "Validation"),
            Self::Integrity => write!(f, "Integrity"),
            Self::Workflow => write!(f, "Workflow"),
        }
    }
}

/// Filesystem failures raised by the atomic write helpers.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Write to {path} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Path the failing operation targeted.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::CreateDir { path, .. }
            | Self::Write { path, .. }
            | Self::Read { path, .. }
            | Self::RetriesExhausted { path, .. } => path,
        }
    }
}

impl UserFriendlyError for FsError {
    fn user_message(&self) -> String {
        match self {
            Self::CreateDir { path, .. } => format!("Could not create directory '{path}'"),
            Self::Write { path, .. } => format!("Could not write '{path}'"),
            Self::Read { path, .. } => format!("Could not read '{path}'"),
            Self::RetriesExhausted { path, attempts, .. } => {
                format!("Writing '{path}' failed after {attempts} attempts")
            }
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::RetriesExhausted { .. } => Some(
                "Another process may be holding the file open or the disk may be full".to_string(),
            ),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        vec![
            "Check that the state directory is writable".to_string(),
            "Check available disk space".to_string(),
        ]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::FileSystem
    }
}

/// Failure to produce canonical JSON for a value.
#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("Failed to serialize value to JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to canonicalize JSON using JCS: {0}")]
    Canonicalize(String),

    #[error("JCS output contained invalid UTF-8")]
    InvalidUtf8,
}

impl UserFriendlyError for CanonicalError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        Some("Documents are hashed and emitted as RFC 8785 canonical JSON".to_string())
    }

    fn suggestions(&self) -> Vec<String> {
        vec!["Non-finite numbers cannot be represented in canonical JSON".to_string()]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_for_user_includes_suggestions() {
        let err = FsError::Write {
            path: "state.json".to_string(),
            source: io::Error::other("disk full"),
        };
        let rendered = err.display_for_user();
        assert!(rendered.starts_with("Error: Could not write 'state.json'"));
        assert!(rendered.contains("Suggestions:"));
        assert_eq!(err.category(), ErrorCategory::FileSystem);
        assert_eq!(err.path(), "state.json");
    }

    #[test]
    fn test_retries_exhausted_has_context() {
        let err = FsError::RetriesExhausted {
            path: "a".to_string(),
            attempts: 3,
            source: io::Error::other("busy"),
        };
        assert!(err.context().is_some());
        assert!(err.to_string().contains("3 attempts"));
    }
}
