use camino::Utf8PathBuf;

use phaseguard_utils::types::{ExecutionMode, RolloutPhase};

use super::error::ConfigError;
use super::model::{Config, ConfigSource};

impl Config {
    /// Create a builder for programmatic configuration.
    ///
    /// Use this when embedding the engine without config files or environment
    /// variables.
    ///
    /// ```rust
    /// use phaseguard_config::Config;
    /// use phaseguard_utils::types::ExecutionMode;
    ///
    /// let config = Config::builder()
    ///     .home("/tmp/pg-home")
    ///     .execution_mode(ExecutionMode::Pipeline)
    ///     .lock_wait_ms(250)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.lock.wait_ms, 250);
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Fluent builder for [`Config`].
///
/// All values set through the builder are attributed to
/// `ConfigSource::Programmatic`.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    home: Option<Utf8PathBuf>,
    execution_mode: Option<ExecutionMode>,
    log_level: Option<String>,
    lock_wait_ms: Option<u64>,
    lock_poll_ms: Option<u64>,
    stale_after_secs: Option<u64>,
    rollout: Option<RolloutPhase>,
    allow_legacy_fields: Option<bool>,
    registry_path: Option<Utf8PathBuf>,
    engine_version: Option<String>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn home(mut self, home: impl Into<Utf8PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    #[must_use]
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    #[must_use]
    pub fn lock_wait_ms(mut self, ms: u64) -> Self {
        self.lock_wait_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn lock_poll_ms(mut self, ms: u64) -> Self {
        self.lock_poll_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn stale_after_secs(mut self, secs: u64) -> Self {
        self.stale_after_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn rollout(mut self, phase: RolloutPhase) -> Self {
        self.rollout = Some(phase);
        self
    }

    #[must_use]
    pub fn allow_legacy_fields(mut self, allow: bool) -> Self {
        self.allow_legacy_fields = Some(allow);
        self
    }

    #[must_use]
    pub fn registry_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = Some(version.into());
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let src = ConfigSource::Programmatic;

        if let Some(home) = self.home {
            config.defaults.home = Some(home);
            config.attribute("home", src);
        }
        if let Some(mode) = self.execution_mode {
            config.defaults.execution_mode = mode;
            config.attribute("execution_mode", src);
        }
        if let Some(level) = self.log_level {
            config.defaults.log_level = Some(level);
            config.attribute("log_level", src);
        }
        if let Some(ms) = self.lock_wait_ms {
            config.lock.wait_ms = ms;
            config.attribute("lock.wait_ms", src);
        }
        if let Some(ms) = self.lock_poll_ms {
            config.lock.poll_ms = ms;
            config.attribute("lock.poll_ms", src);
        }
        if let Some(secs) = self.stale_after_secs {
            config.lock.stale_after_secs = secs;
            config.attribute("lock.stale_after_secs", src);
        }
        if let Some(phase) = self.rollout {
            config.state.rollout = phase;
            config.attribute("state.rollout", src);
        }
        if let Some(allow) = self.allow_legacy_fields {
            config.state.allow_legacy_fields = allow;
            config.attribute("state.allow_legacy_fields", src);
        }
        if let Some(path) = self.registry_path {
            config.registry.path = Some(path);
            config.attribute("registry.path", src);
        }
        if let Some(version) = self.engine_version {
            config.engine.version = version;
            config.attribute("engine.version", src);
        }

        config.validate()?;
        Ok(config)
    }
}
