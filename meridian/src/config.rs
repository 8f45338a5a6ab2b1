use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide ambient settings (spec §4.8), loaded from an optional config
/// file plus `MERIDIAN_`-prefixed environment overrides using the `config`
/// crate's layered builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transaction duration, in milliseconds, above which a commit/abort logs
    /// a slow-transaction warning (spec §4.3).
    pub slow_txn_threshold_ms: u64,
    /// Initial backoff, in milliseconds, for a tenant migration blocker's
    /// majority-wait poll loop (spec §4.1).
    pub majority_wait_initial_backoff_ms: u64,
    /// Upper bound on the same backoff (not specified by the source system;
    /// this crate's own choice, see DESIGN.md).
    pub majority_wait_max_backoff_ms: u64,
    /// Per-call timeout the executor enforces on a single remote command.
    pub executor_call_timeout_ms: u64,
    /// Number of retries for idempotent operations such as best-effort abort
    /// (spec §7).
    pub idempotent_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            slow_txn_threshold_ms: 100,
            majority_wait_initial_backoff_ms: 1_000,
            majority_wait_max_backoff_ms: 30_000,
            executor_call_timeout_ms: 30_000,
            idempotent_retries: 3,
        }
    }
}

impl Config {
    /// Loads settings from `path` (if present) layered under defaults, then
    /// `MERIDIAN_`-prefixed environment variables, following the pattern the
    /// rest of the retrieval pack uses for the `config` crate.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("MERIDIAN"));
        builder.build()?.try_deserialize()
    }

    pub fn slow_txn_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_txn_threshold_ms)
    }

    pub fn majority_wait_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.majority_wait_initial_backoff_ms)
    }

    pub fn majority_wait_max_backoff(&self) -> Duration {
        Duration::from_millis(self.majority_wait_max_backoff_ms)
    }

    pub fn executor_call_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.slow_txn_threshold(), Duration::from_millis(100));
        assert_eq!(config.majority_wait_initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.idempotent_retries, 3);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.slow_txn_threshold_ms, 100);
    }
}
