use serde::Deserialize;
use std::time::Duration;

/// Healing cycle settings.
///
/// Deserializes from plain numbers so it can sit in a TOML file or be
/// overridden from the environment.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HealerConfig {
    /// Source documents reprocessed in parallel within one cycle.
    pub concurrency: usize,
    /// Upper bound for each store call made by the coordinator.
    pub storage_timeout_ms: u64,
    /// Pause between cycles of the background loop.
    pub interval_secs: u64,
    /// Edges unverified for longer than this are stale.
    pub threshold_secs: u64,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            storage_timeout_ms: 30_000,
            interval_secs: 6 * 60 * 60,
            threshold_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl HealerConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn threshold(&self) -> chrono::Duration {
        i64::try_from(self.threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
