use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml_bw::Error),
}

/// Engine configuration, loaded once at startup from a YAML file.
/// Every field has a default so a missing file yields a runnable engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one `<flow-name>.yaml` per flow.
    #[serde(default = "Config::default_flows_dir")]
    pub flows_dir: PathBuf,
    /// The flow-utilities bundle (middlewares, email servers).
    #[serde(default = "Config::default_flow_utils")]
    pub flow_utils: PathBuf,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Maximum subroutine call-stack depth per channel.
    #[serde(default = "Config::default_stack_limit")]
    pub stack_limit: usize,
    /// Maximum node executions per protocol event, guards cyclic flows.
    #[serde(default = "Config::default_max_steps")]
    pub max_steps: u32,
}

/// Per-call timeout budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_http_request")]
    pub http_request: u64,
    #[serde(default = "Timeouts::default_middlewares")]
    pub middlewares: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            http_request: Self::default_http_request(),
            middlewares: Self::default_middlewares(),
        }
    }
}

impl Timeouts {
    fn default_http_request() -> u64 {
        10
    }
    fn default_middlewares() -> u64 {
        10
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flows_dir: Self::default_flows_dir(),
            flow_utils: Self::default_flow_utils(),
            timeouts: Timeouts::default(),
            stack_limit: Self::default_stack_limit(),
            max_steps: Self::default_max_steps(),
        }
    }
}

impl Config {
    fn default_flows_dir() -> PathBuf {
        PathBuf::from("./callflow/flows")
    }
    fn default_flow_utils() -> PathBuf {
        PathBuf::from("./callflow/flow_utils.yaml")
    }
    fn default_stack_limit() -> usize {
        64
    }
    fn default_max_steps() -> u32 {
        256
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml_bw::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_file_missing() {
        let config = Config::load(Path::new("/nonexistent/callflow.yaml")).unwrap();
        assert_eq!(config.timeouts.http_request, 10);
        assert_eq!(config.stack_limit, 64);
        assert_eq!(config.max_steps, 256);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callflow.yaml");
        write(&path, "timeouts:\n  http_request: 3\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.timeouts.http_request, 3);
        assert_eq!(config.timeouts.middlewares, 10);
        assert_eq!(config.flows_dir, PathBuf::from("./callflow/flows"));
    }

    #[test]
    fn test_bad_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callflow.yaml");
        write(&path, "timeouts: [not, a, map").unwrap();

        assert!(Config::load(&path).is_err());
    }
}
