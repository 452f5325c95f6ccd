use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tuning knobs of a mounted grid
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// First reconnect delay after a subscription failure
    pub resubscribe_initial_backoff_ms: u64,
    /// Ceiling for the doubling reconnect delay
    pub resubscribe_max_backoff_ms: u64,
    /// Consecutive subscription failures before the data-may-be-stale notice
    pub stale_notice_after_failures: u32,
    /// Broadcast buffer for store observers
    pub notification_capacity: usize,
    /// Delay between attempts in `retry_failed_catalogs` loops
    pub catalog_retry_backoff_ms: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial_backoff_ms: 250,
            resubscribe_max_backoff_ms: 10_000,
            stale_notice_after_failures: 3,
            notification_capacity: 256,
            catalog_retry_backoff_ms: 1_000,
        }
    }
}

impl GridConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read grid config file {}: {}", path.display(), e)
        })?;

        let config: GridConfig = serde_yaml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse grid config YAML {}: {}", path.display(), e)
        })?;

        Ok(config)
    }

    pub fn catalog_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.catalog_retry_backoff_ms)
    }

    /// Reconnect delay before attempt `failures` (1-based), without jitter.
    pub fn resubscribe_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let delay = self
            .resubscribe_initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.resubscribe_max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stale_notice_after_failures: 5").unwrap();
        writeln!(file, "resubscribe_initial_backoff_ms: 10").unwrap();

        let config = GridConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.stale_notice_after_failures, 5);
        assert_eq!(config.resubscribe_initial_backoff_ms, 10);
        assert_eq!(config.notification_capacity, 256);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = GridConfig::load_from_file(Path::new("/nonexistent/grid.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/grid.yaml"));
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let config = GridConfig::default();
        assert_eq!(config.resubscribe_backoff(1), Duration::from_millis(250));
        assert_eq!(config.resubscribe_backoff(2), Duration::from_millis(500));
        assert_eq!(config.resubscribe_backoff(3), Duration::from_millis(1_000));
        assert_eq!(config.resubscribe_backoff(40), Duration::from_millis(10_000));
    }
}
