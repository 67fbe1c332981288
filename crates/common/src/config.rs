//! Run configuration loaded from TOML.
//!
//! Every field is optional in the file; the agent fills gaps from command
//! line flags and then from [`RunConfig::default`].

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Workload persistence settings handed to the provisioning platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub storage_class: String,
    pub storage_request: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_class: "local-storage".to_string(),
            storage_request: "34Gi".to_string(),
        }
    }
}

/// Deadlines in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound for a single add/start/stop/delete.
    pub operation_secs: u64,
    /// Bound for applying a whole stage.
    pub stage_secs: u64,
    /// Bound for one check invocation.
    pub check_secs: u64,
    /// Bound for initial cluster setup.
    pub setup_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_secs: 5 * 60,
            stage_secs: 10 * 60,
            check_secs: 15 * 60,
            setup_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub push_gateway: Option<String>,
}

/// Sizing for the pinned-content durability probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinningConfig {
    /// Store size in chunks.
    pub store_size: usize,
    /// Number of unpinned uploads; each upload is `store_size / divisor` chunks.
    pub store_size_divisor: usize,
    /// Pause after the unpinned uploads so the node can garbage collect.
    pub gc_wait_secs: u64,
    /// Budget for the final existence checks.
    pub retry: RetryConfig,
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            store_size: 1000,
            store_size_divisor: 4,
            gc_wait_secs: 5,
            retry: RetryConfig::default(),
        }
    }
}

/// Complete run configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub cluster_name: String,
    pub namespace: String,
    pub platform_url: Option<String>,
    pub seed: Option<i64>,
    /// Concurrency bound for membership operations and probe fan-out.
    pub buffer: usize,
    pub start_cluster: bool,
    pub dynamic: bool,
    pub bootnode_count: usize,
    pub node_count: usize,
    pub image: String,
    /// Path of a TOML stage plan; the built-in plan is used when absent.
    pub stages_file: Option<String>,
    pub persistence: PersistenceConfig,
    pub timeouts: TimeoutConfig,
    pub metrics: MetricsConfig,
    pub pinning: PinningConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cluster_name: "hive".to_string(),
            namespace: "hive".to_string(),
            platform_url: None,
            seed: None,
            buffer: 12,
            start_cluster: false,
            dynamic: false,
            bootnode_count: 0,
            node_count: 1,
            image: "ethersphere/bee:latest".to_string(),
            stages_file: None,
            persistence: PersistenceConfig::default(),
            timeouts: TimeoutConfig::default(),
            metrics: MetricsConfig::default(),
            pinning: PinningConfig::default(),
        }
    }
}

impl RunConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer == 0 {
            return Err(ConfigError::Invalid("buffer must be at least 1".into()));
        }
        if self.pinning.store_size_divisor == 0 {
            return Err(ConfigError::Invalid(
                "pinning.store_size_divisor must be at least 1".into(),
            ));
        }
        if self.pinning.store_size < self.pinning.store_size_divisor {
            return Err(ConfigError::Invalid(format!(
                "pinning.store_size ({}) must be >= store_size_divisor ({})",
                self.pinning.store_size, self.pinning.store_size_divisor
            )));
        }
        if self.metrics.enabled && self.metrics.push_gateway.is_none() {
            return Err(ConfigError::Invalid(
                "metrics.enabled requires metrics.push_gateway".into(),
            ));
        }
        Ok(())
    }

    /// Version label derived from the image tag (`repo:tag` → `tag`).
    pub fn image_version(&self) -> &str {
        image_version(&self.image)
    }
}

/// Tag part of an image reference, `"latest"` when untagged.
pub fn image_version(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() => tag,
        _ => "latest",
    }
}

/// Parse any TOML document from a string.
pub fn parse_toml<T: DeserializeOwned>(s: &str, origin: &str) -> Result<T, ConfigError> {
    toml::from_str(s).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })
}

/// Load any TOML document from a file path.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let p = path.as_ref();
    let display = p.display().to_string();
    let s = fs::read_to_string(p).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    parse_toml(&s, &display)
}

/// Load and validate a [`RunConfig`].
pub fn load_from_file(path: impl AsRef<Path>) -> Result<RunConfig, ConfigError> {
    let cfg: RunConfig = load_toml(path)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let def = RunConfig::default();
        assert!(def.validate().is_ok());
        assert_eq!(def.buffer, 12);
        assert_eq!(def.image_version(), "latest");
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            cluster_name = "churn"
            seed = -42
            buffer = 4
            node_count = 5
            image = "ethersphere/bee:1.2.0"

            [persistence]
            enabled = true

            [pinning]
            store_size = 48
            store_size_divisor = 12

            [pinning.retry]
            max_attempts = 3
            initial_delay = 250
        "#;
        write!(tmp, "{}", toml).expect("write");

        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.cluster_name, "churn");
        assert_eq!(cfg.seed, Some(-42));
        assert_eq!(cfg.buffer, 4);
        assert_eq!(cfg.image_version(), "1.2.0");
        assert!(cfg.persistence.enabled);
        assert_eq!(cfg.persistence.storage_request, "34Gi");
        assert_eq!(cfg.pinning.store_size, 48);
        assert_eq!(cfg.pinning.retry.max_attempts, 3);
        assert_eq!(cfg.pinning.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(cfg.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let cfg = RunConfig {
            buffer: 0,
            ..RunConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_metrics_without_gateway() {
        let mut cfg = RunConfig::default();
        cfg.metrics.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.metrics.push_gateway = Some("http://localhost:9091".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_image_version() {
        assert_eq!(image_version("ethersphere/bee:0.5.0"), "0.5.0");
        assert_eq!(image_version("ethersphere/bee"), "latest");
        assert_eq!(image_version("registry:5000/bee"), "latest");
        assert_eq!(image_version("registry:5000/bee:beta"), "beta");
    }
}
