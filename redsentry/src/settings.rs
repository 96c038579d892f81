//! Daemon configuration
//!
//! Loaded from an optional TOML file overridden by `REDSENTRY_`-prefixed
//! environment variables, e.g. `REDSENTRY_COORDINATION_URL`.

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use redsentry_cluster::{generate_node_id, ManagerConfig};
use redsentry_core::{HostConfig, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub coordination: CoordinationSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// The managed instances.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterSettings {
    /// `host:port` addresses of every managed Redis instance
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSettings {
    /// Redis URL of the coordination store. Empty selects the in-process
    /// backend, which only makes sense for a single coordinator.
    pub url: String,
    pub namespace: String,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: "redsentry".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    pub probe_interval_secs: u64,
    pub max_probe_errors: u32,
    pub leadership_wait_secs: u64,
    pub reconcile_interval_secs: u64,
    pub startup_timeout_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 5,
            max_probe_errors: 3,
            leadership_wait_secs: 5,
            reconcile_interval_secs: 5,
            startup_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Settings {
    /// Load with priority: environment variables over the config file over
    /// the defaults.
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("REDSENTRY")
                .separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cluster.instances"),
        );

        builder.build()?.try_deserialize()
    }

    /// The managed instances as parsed addresses.
    pub fn hosts(&self) -> Result<Vec<HostConfig>> {
        self.cluster
            .instances
            .iter()
            .map(|address| HostConfig::parse(address))
            .collect()
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            node_id: generate_node_id(),
            probe_interval: Duration::from_secs(self.manager.probe_interval_secs),
            max_probe_errors: self.manager.max_probe_errors,
            leadership_wait: Duration::from_secs(self.manager.leadership_wait_secs),
            reconcile_interval: Duration::from_secs(self.manager.reconcile_interval_secs),
            startup_timeout: Duration::from_secs(self.manager.startup_timeout_secs),
        }
    }
}
