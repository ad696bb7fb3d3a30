//! Driver configuration.
//!
//! Built once at startup from CLI flags and injected by reference into the
//! services; no component reaches for configuration through globals.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("NQN prefix must not be empty")]
    EmptyNqnPrefix,

    #[error("invalid NQN prefix '{0}': only alphanumerics, dash, dot and colon allowed")]
    InvalidNqnPrefix(String),

    #[error("base path '{0}' must be absolute")]
    RelativeBasePath(String),
}

/// Process-wide driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Stable reverse-DNS driver name reported by the identity service and
    /// used to filter attachment objects.
    pub driver_name: String,
    /// NQN prefix for every subsystem this driver creates. The prefix is
    /// the ONLY way to recognize our subsystems on a host; subsystems
    /// without it are off-limits.
    pub nqn_prefix: String,
    /// Appliance-side directory holding backing files.
    pub base_path: String,
    /// Appliance disk slot representing the backing storage pool.
    pub pool: String,
    /// Data-plane address nodes connect to over NVMe/TCP.
    pub data_addr: String,
    /// This node's identifier (node plugin only).
    pub node_id: String,
    /// Window after detach during which a successor attachment may proceed
    /// and the reconciler holds off cleanup.
    pub attach_grace: Duration,
    /// Reconciler sweep interval.
    pub reconcile_interval: Duration,
}

impl DriverConfig {
    /// Validate invariants the rest of the driver relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nqn_prefix.is_empty() {
            return Err(ConfigError::EmptyNqnPrefix);
        }
        if !self
            .nqn_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
        {
            return Err(ConfigError::InvalidNqnPrefix(self.nqn_prefix.clone()));
        }
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::RelativeBasePath(self.base_path.clone()));
        }
        Ok(())
    }

    /// Wire identifier for a volume: `<prefix>:<volume-id>`.
    pub fn nqn_for(&self, volume_id: &str) -> String {
        format!("{}:{}", self.nqn_prefix, volume_id)
    }

    /// Appliance-side backing file path for a volume.
    pub fn backing_path_for(&self, volume_id: &str) -> String {
        format!("{}/{}.img", self.base_path.trim_end_matches('/'), volume_id)
    }

    /// Appliance-side backing file path for a snapshot. The source volume
    /// appears in the path so idempotent retries can verify the snapshot
    /// was taken from the same volume.
    pub fn snapshot_path_for(&self, source_volume_id: &str, snapshot_id: &str) -> String {
        format!(
            "{}/{}/{}.img",
            self.base_path.trim_end_matches('/'),
            source_volume_id,
            snapshot_id
        )
    }
}
