use super::error::ConfigError;
use super::model::Config;

const MAX_LOCK_WAIT_MS: u64 = 600_000;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate configuration values, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut invalid = |key: &str, value: String| {
            errors.push(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            });
        };

        if self.lock.wait_ms == 0 {
            invalid("lock.wait_ms", "must be greater than 0".to_string());
        } else if self.lock.wait_ms > MAX_LOCK_WAIT_MS {
            invalid(
                "lock.wait_ms",
                format!("exceeds maximum of {MAX_LOCK_WAIT_MS}ms"),
            );
        }

        if self.lock.poll_ms == 0 {
            invalid("lock.poll_ms", "must be greater than 0".to_string());
        } else if self.lock.wait_ms > 0 && self.lock.poll_ms > self.lock.wait_ms {
            invalid(
                "lock.poll_ms",
                format!("must not exceed lock.wait_ms ({})", self.lock.wait_ms),
            );
        }

        if self.lock.stale_after_secs == 0 {
            invalid("lock.stale_after_secs", "must be greater than 0".to_string());
        }

        if let Some(level) = &self.defaults.log_level
            && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
        {
            invalid(
                "log_level",
                format!("'{level}' is not one of {}", LOG_LEVELS.join(", ")),
            );
        }

        if let Some(home) = &self.defaults.home
            && home.as_str().trim().is_empty()
        {
            invalid("home", "must not be empty".to_string());
        }

        if let Some(path) = &self.registry.path
            && path.as_str().trim().is_empty()
        {
            invalid("registry.path", "must not be empty".to_string());
        }

        if !is_dotted_version(&self.engine.version) {
            invalid(
                "engine.version",
                format!("'{}' is not a MAJOR.MINOR.PATCH version", self.engine.version),
            );
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

fn is_dotted_version(v: &str) -> bool {
    let parts: Vec<&str> = v.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
