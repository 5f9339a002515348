use camino::{Utf8Path, Utf8PathBuf};
use std::str::FromStr;

use phaseguard_utils::types::{ExecutionMode, RolloutPhase};

use super::error::ConfigError;
use super::model::{CliArgs, Config, ConfigSource, TomlConfig};

/// Config file location relative to a directory on the discovery walk.
pub const CONFIG_FILE: &str = ".phaseguard/config.toml";

impl Config {
    /// Discover configuration starting from the current working directory.
    pub fn discover(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
            key: "cwd".to_string(),
            value: format!("Cannot read current directory: {e}"),
        })?;
        let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|p| ConfigError::InvalidValue {
            key: "cwd".to_string(),
            value: format!("Current directory is not UTF-8: {}", p.display()),
        })?;
        Self::discover_from(&cwd, cli_args)
    }

    /// Discover configuration with precedence CLI > file > defaults.
    ///
    /// All parse and validation problems are reported together.
    pub fn discover_from(start_dir: &Utf8Path, cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let mut errors = Vec::new();

        let config_path = match &cli_args.config_path {
            Some(explicit) => Some(explicit.clone()),
            None => Self::discover_config_file_from(start_dir),
        };

        if let Some(path) = &config_path {
            let file = Self::load_config_file(path)?;
            config.apply_file(file, &mut errors);
            config.config_path = Some(path.clone());
            tracing::debug!(path = %path, "loaded config file");
        }

        config.apply_cli(cli_args);

        if let Err(err) = config.validate() {
            errors.extend(err.errors().into_iter().cloned());
        }
        match errors.len() {
            0 => Ok(config),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }

    /// Walk upward looking for `.phaseguard/config.toml`, stopping at a VCS root.
    #[must_use]
    pub fn discover_config_file_from(start_dir: &Utf8Path) -> Option<Utf8PathBuf> {
        let mut current = Some(start_dir);
        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            if dir.join(".git").exists() || dir.join(".hg").exists() || dir.join(".svn").exists()
            {
                break;
            }
            current = dir.parent();
        }
        None
    }

    fn load_config_file(path: &Utf8Path) -> Result<TomlConfig, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
                path: path.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TomlConfig::default()),
            Err(e) => Err(ConfigError::InvalidFile {
                path: path.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn apply_file(&mut self, file: TomlConfig, errors: &mut Vec<ConfigError>) {
        let src = ConfigSource::Config;

        if let Some(defaults) = file.defaults {
            if let Some(home) = defaults.home {
                self.defaults.home = Some(home);
                self.attribute("home", src);
            }
            if let Some(mode) = defaults.execution_mode {
                match parse_enum::<ExecutionMode>("execution_mode", &mode) {
                    Ok(mode) => {
                        self.defaults.execution_mode = mode;
                        self.attribute("execution_mode", src);
                    }
                    Err(e) => errors.push(e),
                }
            }
            if let Some(level) = defaults.log_level {
                self.defaults.log_level = Some(level);
                self.attribute("log_level", src);
            }
        }

        if let Some(lock) = file.lock {
            if let Some(v) = lock.wait_ms {
                self.lock.wait_ms = v;
                self.attribute("lock.wait_ms", src);
            }
            if let Some(v) = lock.poll_ms {
                self.lock.poll_ms = v;
                self.attribute("lock.poll_ms", src);
            }
            if let Some(v) = lock.stale_after_secs {
                self.lock.stale_after_secs = v;
                self.attribute("lock.stale_after_secs", src);
            }
        }

        if let Some(state) = file.state {
            if let Some(rollout) = state.rollout {
                match parse_enum::<RolloutPhase>("state.rollout", &rollout) {
                    Ok(phase) => {
                        self.state.rollout = phase;
                        self.attribute("state.rollout", src);
                    }
                    Err(e) => errors.push(e),
                }
            }
            if let Some(allow) = state.allow_legacy_fields {
                self.state.allow_legacy_fields = allow;
                self.attribute("state.allow_legacy_fields", src);
            }
        }

        if let Some(registry) = file.registry
            && registry.path.is_some()
        {
            self.registry = registry;
            self.attribute("registry.path", src);
        }

        if let Some(engine) = file.engine
            && let Some(version) = engine.version
        {
            self.engine.version = version;
            self.attribute("engine.version", src);
        }
    }

    fn apply_cli(&mut self, cli: &CliArgs) {
        let src = ConfigSource::Cli;
        if let Some(home) = &cli.home {
            self.defaults.home = Some(home.clone());
            self.attribute("home", src);
        }
        if let Some(mode) = cli.execution_mode {
            self.defaults.execution_mode = mode;
            self.attribute("execution_mode", src);
        }
        if let Some(level) = &cli.log_level {
            self.defaults.log_level = Some(level.clone());
            self.attribute("log_level", src);
        }
        if let Some(wait) = cli.lock_wait_ms {
            self.lock.wait_ms = wait;
            self.attribute("lock.wait_ms", src);
        }
    }

    pub(crate) fn attribute(&mut self, key: &str, source: ConfigSource) {
        self.source_attribution.insert(key.to_string(), source);
    }
}

fn parse_enum<T: FromStr<Err = String>>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|value| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}
