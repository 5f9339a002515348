use std::collections::BTreeMap;

use super::model::{Config, ConfigSource};

fn source_label(source: ConfigSource) -> &'static str {
    match source {
        ConfigSource::Cli => "cli",
        ConfigSource::Config => "config",
        ConfigSource::Programmatic => "programmatic",
        ConfigSource::Default => "default",
    }
}

impl Config {
    /// Effective configuration as `key -> (value, source)`.
    #[must_use]
    pub fn effective_config(&self) -> BTreeMap<String, (String, String)> {
        let mut out = BTreeMap::new();
        let mut add = |key: &str, value: String| {
            out.insert(
                key.to_string(),
                (value, source_label(self.source_of(key)).to_string()),
            );
        };

        add("home", self.home().to_string());
        add("execution_mode", self.defaults.execution_mode.to_string());
        if let Some(level) = &self.defaults.log_level {
            add("log_level", level.clone());
        }
        add("lock.wait_ms", self.lock.wait_ms.to_string());
        add("lock.poll_ms", self.lock.poll_ms.to_string());
        add("lock.stale_after_secs", self.lock.stale_after_secs.to_string());
        add("state.rollout", self.state.rollout.to_string());
        add(
            "state.allow_legacy_fields",
            self.state.allow_legacy_fields.to_string(),
        );
        if let Some(path) = &self.registry.path {
            add("registry.path", path.to_string());
        }
        add("engine.version", self.engine.version.clone());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_config_reports_sources() {
        let mut config = Config::default();
        config.lock.wait_ms = 10;
        config.attribute("lock.wait_ms", ConfigSource::Cli);
        let eff = config.effective_config();
        assert_eq!(
            eff.get("lock.wait_ms"),
            Some(&("10".to_string(), "cli".to_string()))
        );
        assert_eq!(eff.get("state.rollout").unwrap().1, "default");
    }
}
