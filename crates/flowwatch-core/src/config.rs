use crate::error::ConfigError;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SinkConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Writer attempts per change before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Broadcast buffer; slow subscribers lag past this many notifications.
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_notify_capacity() -> usize {
    256
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            notify_capacity: default_notify_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Finished workflows kept for queries and metrics.
    #[serde(default = "default_retention_capacity")]
    pub retention_capacity: usize,
    /// Active workflows running longer than this are failed by the sweeper.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Relative paths resolve against the project root.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_retention_capacity() -> usize {
    1000
}

fn default_workflow_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_store_path() -> PathBuf {
    PathBuf::from(paths::STORE_FILE)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention_capacity: default_retention_capacity(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            store_path: default_store_path(),
            sink: SinkConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Read `.flowwatch/config.yaml` under `root`; defaults when the file is absent.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: MonitorConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<(), ConfigError> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())?;
        Ok(())
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        if self.store_path.is_absolute() {
            self.store_path.clone()
        } else {
            root.join(&self.store_path)
        }
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.retention_capacity == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retention_capacity is 0; finished workflows and metrics are discarded"
                    .to_string(),
            });
        }

        if self.workflow_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "workflow_timeout_secs is 0; every active workflow fails on the next sweep"
                    .to_string(),
            });
        } else if self.sweep_interval_secs > self.workflow_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "sweep_interval_secs ({}) exceeds workflow_timeout_secs ({}); timeouts fire late",
                    self.sweep_interval_secs, self.workflow_timeout_secs
                ),
            });
        }

        if self.sink.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "sink.max_attempts is 0; the writer dead-letters every change".to_string(),
            });
        }

        if self.sink.base_backoff_ms > self.sink.max_backoff_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "sink.base_backoff_ms ({}) exceeds sink.max_backoff_ms ({})",
                    self.sink.base_backoff_ms, self.sink.max_backoff_ms
                ),
            });
        }

        if self.sink.notify_capacity == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "sink.notify_capacity is 0; using 1".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = MonitorConfig::load(dir.path()).unwrap();
        assert_eq!(cfg, MonitorConfig::default());
        assert_eq!(cfg.retention_capacity, 1000);
        assert_eq!(cfg.sink.max_attempts, 5);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "retention_capacity: 50\nsink:\n  max_attempts: 2\n";
        let cfg: MonitorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.retention_capacity, 50);
        assert_eq!(cfg.workflow_timeout_secs, 3600);
        assert_eq!(cfg.sink.max_attempts, 2);
        assert_eq!(cfg.sink.max_backoff_ms, 5000);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let cfg = MonitorConfig {
            retention_capacity: 7,
            ..Default::default()
        };
        cfg.save(dir.path()).unwrap();
        assert!(paths::config_path(dir.path()).exists());
        assert_eq!(MonitorConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn relative_store_path_resolves_against_root() {
        let cfg = MonitorConfig::default();
        let root = Path::new("/srv/project");
        assert_eq!(
            cfg.store_path(root),
            PathBuf::from("/srv/project/.flowwatch/changes.db")
        );
    }

    #[test]
    fn default_config_is_clean() {
        assert!(MonitorConfig::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_values() {
        let cfg = MonitorConfig {
            retention_capacity: 0,
            workflow_timeout_secs: 10,
            sweep_interval_secs: 60,
            sink: SinkConfig {
                max_attempts: 0,
                base_backoff_ms: 10_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 4);
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count(),
            2
        );
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        crate::io::atomic_write(&paths::config_path(dir.path()), b"retention_capacity: [").unwrap();
        assert!(matches!(
            MonitorConfig::load(dir.path()),
            Err(ConfigError::Yaml(_))
        ));
    }
}
