use config::{Config, ConfigError, Environment, File};
use sentinel::StoreConfig;
use sentinel_healer::HealerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Server settings: optional TOML file named by `SENTINEL_CONFIG`, then
/// `SENTINEL_*` environment overrides. Nested healer keys use a double
/// underscore, e.g. `SENTINEL_HEALER__CONCURRENCY=8`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub db_path: String,
    /// Extractor service endpoint. Without it the `heal` tool is disabled.
    pub extractor_url: Option<String>,
    pub extractor_timeout_secs: u64,
    /// Run the healing loop in the background at this interval.
    pub heal_interval_secs: Option<u64>,
    pub max_conflict_retries: u32,
    pub write_timeout_ms: Option<u64>,
    pub healer: HealerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "./sentinel.redb".to_string(),
            extractor_url: None,
            extractor_timeout_secs: 120,
            heal_interval_secs: None,
            max_conflict_retries: StoreConfig::default().max_conflict_retries,
            write_timeout_ms: None,
            healer: HealerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(std::env::var("SENTINEL_CONFIG").ok().as_deref(), None)
    }

    /// `env` replaces the process environment when given.
    pub fn build(
        file: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path));
        }
        let s = builder
            .add_source(
                Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;
        s.try_deserialize()
    }

    pub fn store_config(&self) -> StoreConfig {
        let config = StoreConfig::new().with_max_conflict_retries(self.max_conflict_retries);
        match self.write_timeout_ms {
            Some(ms) => config.with_write_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }

    pub fn heal_interval(&self) -> Option<Duration> {
        self.heal_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
