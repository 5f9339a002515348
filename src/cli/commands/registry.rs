//! `phaseguard registry check`

use camino::Utf8Path;

use super::CommandError;
use crate::reason::{ReasonCode, ReasonRegistry};
use crate::{Config, EngineError, OutputEnvelope};

/// Load a registry the way the engine would and report what it defines.
///
/// Checks `file`, else the configured registry, else the built-in one.
pub fn execute_registry_check_command(config: &Config, file: Option<&Utf8Path>) -> Result<OutputEnvelope, CommandError> {
    let (registry, source) = match file.or(config.registry.path.as_deref()) {
        Some(path) => (
            ReasonRegistry::from_path(path).map_err(EngineError::from)?,
            path.to_string(),
        ),
        None => (
            ReasonRegistry::builtin().map_err(EngineError::from)?,
            "built-in".to_string(),
        ),
    };
    tracing::info!(
        source = %source,
        version = registry.version(),
        codes = ReasonCode::all().len(),
        "registry valid"
    );
    Ok(OutputEnvelope::for_engine(
        None,
        format!(
            "Registry {source} (version {}) defines all {} reason codes",
            registry.version(),
            ReasonCode::all().len()
        ),
    ))
}
