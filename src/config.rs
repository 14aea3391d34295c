//! # Engine Configuration
//!
//! YAML-backed configuration for the orchestration engine. Configuration is
//! explicit: values come from a YAML document plus a small set of environment
//! overrides, with validated defaults for embedded and test use.
//!
//! ## Usage
//!
//! ```rust
//! use dbflow_core::config::EngineConfig;
//!
//! let config = EngineConfig::default();
//! assert!(config.execution.max_parallel_children >= 1);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FlowError, Result};

/// Root configuration for the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pipeline execution settings
    pub execution: ExecutionConfig,
    /// Remote command gateway settings
    pub remote: RemoteConfig,
    /// Topology invariant checker settings
    pub checker: CheckerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running children of one parallel group
    pub max_parallel_children: usize,
    /// Maximum wall-clock time for a single pipeline run before it is failed
    pub max_pipeline_duration_secs: u64,
    /// Whether node transitions are logged at info level
    pub log_transitions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Default timeout applied to remote SQL batches
    pub sql_timeout_secs: u64,
    /// Default timeout applied to remote script jobs
    pub script_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Clusters checked per scheduled sweep
    pub batch_size: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_children: 16,
            max_pipeline_duration_secs: 3600,
            log_transitions: true,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            sql_timeout_secs: 60,
            script_timeout_secs: 3600,
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            remote: RemoteConfig::default(),
            checker: CheckerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| {
            FlowError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `DBFLOW_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DBFLOW_MAX_PARALLEL_CHILDREN") {
            if let Ok(n) = v.parse() {
                self.execution.max_parallel_children = n;
            }
        }
        if let Ok(v) = std::env::var("DBFLOW_SQL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.remote.sql_timeout_secs = n;
            }
        }
    }

    /// Configuration tuned for tests: small limits, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            execution: ExecutionConfig {
                max_parallel_children: 4,
                max_pipeline_duration_secs: 5,
                log_transitions: false,
            },
            remote: RemoteConfig {
                sql_timeout_secs: 2,
                script_timeout_secs: 2,
            },
            checker: CheckerConfig { batch_size: 10 },
        }
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.sql_timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.script_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.execution.max_parallel_children >= 1);
        assert!(config.remote.sql_timeout_secs > 0);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig::for_testing();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.execution.max_parallel_children,
            config.execution.max_parallel_children
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: EngineConfig =
            serde_yaml::from_str("execution:\n  max_parallel_children: 2\n").unwrap();
        assert_eq!(parsed.execution.max_parallel_children, 2);
        assert_eq!(
            parsed.remote.sql_timeout_secs,
            RemoteConfig::default().sql_timeout_secs
        );
    }
}
