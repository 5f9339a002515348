use phaseguard_utils::error::{ErrorCategory, UserFriendlyError};
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration file {path}: {reason}")]
    InvalidFile { path: String, reason: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{} configuration error(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ConfigError>),
}

impl ConfigError {
    /// Flatten into individual errors.
    #[must_use]
    pub fn errors(&self) -> Vec<&ConfigError> {
        match self {
            Self::Multiple(all) => all.iter().collect(),
            other => vec![other],
        }
    }
}

impl UserFriendlyError for ConfigError {
    fn user_message(&self) -> String {
        match self {
            Self::InvalidFile { path, .. } => format!("Configuration file '{path}' is invalid"),
            Self::InvalidValue { key, .. } => format!("Configuration key '{key}' is invalid"),
            Self::Multiple(all) => format!("Configuration has {} problem(s)", all.len()),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::InvalidFile { reason, .. } => Some(reason.clone()),
            Self::InvalidValue { value, .. } => Some(value.clone()),
            Self::Multiple(all) => Some(
                all.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        }
    }

    fn suggestions(&self) -> Vec<String> {
        vec![
            "Check .phaseguard/config.toml against the documented keys".to_string(),
            "Remove unknown sections or keys".to_string(),
        ]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}
