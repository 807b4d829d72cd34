/// Global executor settings, loadable from a JSON file
use crate::types::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Sampling interval of the watchdog for CPU time, wall time and OOM
    pub poll_interval: Duration,
    /// Sampling interval for informational counters (I/O)
    pub secondary_interval: Duration,
    /// Interval between scans of the container's writable layer for file limits
    pub file_check_interval: Duration,
    /// Distance between soft and hard CPU limit if the caller did not separate them
    pub cpu_grace_margin: Duration,
    /// Distance between the hard CPU limit and an implicit wall time limit
    pub wall_time_overhead: Duration,
    /// Distance between the hard CPU limit and RLIMIT_CPU, which only acts as a fallback
    pub rlimit_cpu_overhead: Duration,
    /// Niceness increment of the tool
    pub niceness: i32,
    /// Bounded retries when removing a cgroup directory
    pub rmdir_attempts: u32,
    /// Initial back-off between removal attempts, doubled each time
    pub rmdir_backoff: Duration,
    /// Output files larger than this are shortened in the middle
    pub max_output_size: Option<u64>,
    /// Turn capability degradation into hard errors
    pub strict_mode: bool,
    /// Use this directory instead of the discovered cgroup mount points
    pub cgroup_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            secondary_interval: Duration::from_secs(1),
            file_check_interval: Duration::from_secs(60),
            cpu_grace_margin: Duration::from_secs(2),
            wall_time_overhead: Duration::from_secs(1),
            rlimit_cpu_overhead: Duration::from_secs(30),
            niceness: 5,
            rmdir_attempts: 6,
            rmdir_backoff: Duration::from_millis(10),
            max_output_size: None,
            strict_mode: false,
            cgroup_root: None,
        }
    }
}

impl ExecutorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BenchError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            BenchError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() || self.poll_interval >= Duration::from_secs(1) {
            return Err(BenchError::Config(format!(
                "Poll interval must be positive and below one second, got {:?}",
                self.poll_interval
            )));
        }
        if self.rmdir_attempts == 0 {
            return Err(BenchError::Config(
                "At least one cgroup removal attempt is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"niceness": 0, "strict_mode": true}}"#).unwrap();
        let config = ExecutorConfig::load(file.path()).unwrap();
        assert_eq!(config.niceness, 0);
        assert!(config.strict_mode);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_slow_polling() {
        let config = ExecutorConfig {
            poll_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BenchError::Config(_))));
    }
}
