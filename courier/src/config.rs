//! Broker configuration, read from a RON file.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use courier_cluster::ClusterConfig;
use courier_delivery::{DispatchConfig, PluginsConfig, WorkerPoolConfig};
use courier_queue::MemoryQueueConfig;
use serde::Deserialize;

const fn default_stats_interval_secs() -> u64 {
    60
}

/// Everything the broker needs to start.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub workers: WorkerPoolConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Limits of the shared dead-letter queue
    #[serde(default)]
    pub dead_letter: MemoryQueueConfig,

    /// How often per-destination counters are logged (in seconds)
    ///
    /// Zero disables the report.
    ///
    /// Default: 60
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    #[serde(default, alias = "destination")]
    pub destinations: Vec<DestinationConfig>,
}

/// One destination served by the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub name: String,

    #[serde(default)]
    pub queue: MemoryQueueConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl CourierConfig {
    /// Read and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, is not valid RON, or fails
    /// [`CourierConfig::validate`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config from {}: {e}", path.display()))?;

        let config: Self = ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config from {}: {e}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Check every destination and reject duplicate names.
    ///
    /// The node must be named: peers refuse every hop stamped with the
    /// fallback id.
    ///
    /// # Errors
    ///
    /// A missing `cluster.node_id`, or the first invalid destination.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster.node_id.is_fallback() {
            anyhow::bail!(
                "cluster.node_id is missing or unusable, peers would refuse every hop stamped as '{}'",
                self.cluster.node_id
            );
        }

        let mut seen = AHashSet::with_capacity(self.destinations.len());

        for destination in &self.destinations {
            let name = destination.name.trim();
            if name.is_empty() {
                anyhow::bail!("Destination names must not be empty");
            }

            if !seen.insert(name) {
                anyhow::bail!("Destination '{name}' is configured more than once");
            }

            destination
                .dispatch
                .validate()
                .map_err(|e| anyhow::anyhow!("Destination '{name}': {e}"))?;
        }

        Ok(())
    }
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// If `COURIER_CONFIG` names a missing file, or none of the defaults exist.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("COURIER_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("COURIER_CONFIG points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!("No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{paths_tried}")
}
