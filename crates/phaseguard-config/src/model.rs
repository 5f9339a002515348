use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use phaseguard_utils::paths::{Layout, phaseguard_home};
use phaseguard_utils::types::{ExecutionMode, RolloutPhase};

pub const DEFAULT_LOCK_WAIT_MS: u64 = 2000;
pub const DEFAULT_LOCK_POLL_MS: u64 = 50;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 3600;

/// Source of a configuration value.
///
/// Serializes to lowercase strings: `"cli"`, `"config"`, `"programmatic"`, `"default"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Cli,
    Config,
    Programmatic,
    Default,
}

/// Effective configuration after discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub defaults: Defaults,
    pub lock: LockConfig,
    pub state: StateConfig,
    pub registry: RegistryConfig,
    pub engine: EngineConfig,
    /// Where each key's value came from
    pub source_attribution: BTreeMap<String, ConfigSource>,
    /// Config file that was loaded, if any
    pub config_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub home: Option<Utf8PathBuf>,
    pub execution_mode: ExecutionMode,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub wait_ms: u64,
    pub poll_ms: u64,
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_LOCK_WAIT_MS,
            poll_ms: DEFAULT_LOCK_POLL_MS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    #[must_use]
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Default rollout phase when a run has no `rollout.json` marker
    pub rollout: RolloutPhase,
    /// Accept legacy field names during `engine-only`
    pub allow_legacy_fields: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry file replacing the built-in copy
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            lock: LockConfig::default(),
            state: StateConfig::default(),
            registry: RegistryConfig::default(),
            engine: EngineConfig::default(),
            source_attribution: BTreeMap::new(),
            config_path: None,
        }
    }
}

impl Config {
    /// State root: explicit `home`, else `PHASEGUARD_HOME`, else `.phaseguard`.
    #[must_use]
    pub fn home(&self) -> Utf8PathBuf {
        self.defaults.home.clone().unwrap_or_else(phaseguard_home)
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(self.home())
    }

    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.defaults.execution_mode
    }

    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<Utf8PathBuf>,
    pub home: Option<Utf8PathBuf>,
    pub execution_mode: Option<ExecutionMode>,
    pub log_level: Option<String>,
    pub lock_wait_ms: Option<u64>,
}

/// Raw file shape. Every section and key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TomlConfig {
    pub defaults: Option<TomlDefaults>,
    pub lock: Option<TomlLock>,
    pub state: Option<TomlState>,
    pub registry: Option<RegistryConfig>,
    pub engine: Option<TomlEngine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TomlDefaults {
    pub home: Option<Utf8PathBuf>,
    pub execution_mode: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TomlLock {
    pub wait_ms: Option<u64>,
    pub poll_ms: Option<u64>,
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TomlState {
    pub rollout: Option<String>,
    pub allow_legacy_fields: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TomlEngine {
    pub version: Option<String>,
}
