//! Configuration module for the controller
//!
//! Supports YAML configuration files with module-based organization

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::metadata::TableConfig;
use crate::publisher::RetryPolicy;
use crate::selector::InstanceSelector;
use crate::strategy::RebalanceConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Controller configuration
    #[serde(default)]
    pub controller: ControllerConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Coordination service configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Publisher retry configuration
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Default rebalance options
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Instance selection configuration
    #[serde(default)]
    pub placement: PlacementConfig,
    /// Periodic reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Tables managed by this controller
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("controller.refresh_interval_ms", self.controller.refresh_interval_ms),
            ("controller.max_refresh_cycles", self.controller.max_refresh_cycles as u64),
            ("coordinator.request_timeout_ms", self.coordinator.request_timeout_ms),
            ("coordinator.snapshot_interval_secs", self.coordinator.snapshot_interval_secs),
            ("reconcile.interval_secs", self.reconcile.interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publisher.max_attempts must be at least 1".to_string(),
            ));
        }
        for table in &self.tables {
            if table.replication.replicas == 0 {
                return Err(ConfigError::Invalid(format!(
                    "table {} needs at least one replica",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Interval between plan refresh cycles in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Refresh cycles an addition may take before its segment is stalled
    #[serde(default = "default_max_refresh_cycles")]
    pub max_refresh_cycles: u32,
    /// Restarts of a rebalance superseded by roster changes
    #[serde(default = "default_max_superseded_restarts")]
    pub max_superseded_restarts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            refresh_interval_ms: default_refresh_interval_ms(),
            max_refresh_cycles: default_max_refresh_cycles(),
            max_superseded_restarts: default_max_superseded_restarts(),
        }
    }
}

impl ControllerConfig {
    /// Get refresh interval as Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Snapshot directory of the local coordinator
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Timeout of every read and write in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Snapshot interval in seconds
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            request_timeout_ms: default_request_timeout_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

impl CoordinatorConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get snapshot interval as Duration
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

/// Publisher retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Attempts per cycle, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl PublisherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Instance selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Keep instances at capacity out of new placements
    #[serde(default = "default_true")]
    pub enforce_capacity: bool,
    /// Place new segments on fewer instances than the replication factor
    /// instead of failing with insufficient capacity
    #[serde(default)]
    pub allow_under_replicated: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            enforce_capacity: true,
            allow_under_replicated: false,
        }
    }
}

impl PlacementConfig {
    pub fn selector(&self) -> InstanceSelector {
        InstanceSelector {
            enforce_capacity: self.enforce_capacity,
        }
    }
}

/// Periodic reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Whether the reconciler runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval in seconds
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl ReconcileConfig {
    /// Get interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_max_refresh_cycles() -> u32 {
    30
}

fn default_max_superseded_restarts() -> u32 {
    3
}

fn default_http_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./controller_data")
}

fn default_request_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000 // 5 seconds
}

fn default_reconcile_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PolicyKind;

    const SAMPLE: &str = r#"
controller:
  cluster_name: analytics
  max_refresh_cycles: 5
http:
  addr: 127.0.0.1:9100
publisher:
  initial_backoff_ms: 50
rebalance:
  min_available_replicas: 2
tables:
  - name: events
    replication:
      replicas: 3
      tenant_tag: analytics
      replica_groups:
        groups: [a, b, c]
    policy: replica_group
  - name: clicks
    replication:
      replicas: 2
      tenant_tag: analytics
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.controller.cluster_name, "analytics");
        assert_eq!(config.controller.max_refresh_cycles, 5);
        assert_eq!(config.controller.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.http.addr, "127.0.0.1:9100");
        assert_eq!(config.coordinator.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.rebalance.min_available_replicas, 2);
        assert!(config.rebalance.honor_replica_groups);
        assert!(config.placement.enforce_capacity);
        assert_eq!(config.log.level, "info");

        let retry = config.publisher.retry_policy();
        assert_eq!(retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(retry.max_attempts, 5);

        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].policy, PolicyKind::ReplicaGroup);
        assert_eq!(config.tables[1].policy, PolicyKind::Balanced);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.http.addr, "0.0.0.0:9000");
        assert!(config.tables.is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_yaml("publisher:\n  max_attempts: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_yaml("controller: [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for yaml in [
            "reconcile:\n  interval_secs: 0\n",
            "coordinator:\n  snapshot_interval_secs: 0\n",
            "coordinator:\n  request_timeout_ms: 0\n",
            "controller:\n  refresh_interval_ms: 0\n",
            "controller:\n  max_refresh_cycles: 0\n",
        ] {
            let err = Config::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", yaml);
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.tables.len(), 2);
        assert_eq!(loaded.controller.cluster_name, "analytics");

        let missing = Config::from_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(_)));
    }
}
