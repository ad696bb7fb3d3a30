//! Type-safe wrappers for CSI parameters.
//!
//! StorageClass parameters and volume contexts arrive as string bags; they
//! are parsed exactly once at the API boundary into these types, and
//! downstream components consume the typed record. Each type implements
//! `FromStr` for parsing and `Display` for the round trip back into a
//! volume context.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// StorageClass parameter keys.
pub const PARAM_FSTYPE: &str = "csi.storage.k8s.io/fstype";
pub const PARAM_CTRL_LOSS_TMO: &str = "ctrlLossTmo";
pub const PARAM_RECONNECT_DELAY: &str = "reconnectDelay";
pub const PARAM_KEEP_ALIVE_TMO: &str = "keepAliveTmo";
pub const PARAM_MIGRATION_TIMEOUT: &str = "migrationTimeoutSeconds";
pub const PARAM_NVME_PORT: &str = "nvmePort";

/// Volume context keys (controller → node handoff).
pub const CTX_ADDR: &str = "applianceAddr";
pub const CTX_NQN: &str = "nqn";

/// Error returned when a parameter bag fails to parse.
#[derive(Error, Debug)]
pub enum ParamError {
    #[error("unknown filesystem '{0}': expected 'ext4', 'xfs' or 'block'")]
    UnknownFs(String),

    #[error("parameter '{key}' has invalid value '{value}'")]
    BadValue { key: String, value: String },

    #[error("parameter '{key}' value {value} outside allowed range [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: i64,
        min: i64,
        max: i64,
    },
}

// ============================================================================
// FsKind
// ============================================================================

/// How a volume is consumed on the node.
///
/// `Block` skips mkfs/mount entirely and hands the pod the raw device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsKind {
    #[default]
    Ext4,
    Xfs,
    Block,
}

impl FsKind {
    pub fn is_block(self) -> bool {
        matches!(self, FsKind::Block)
    }

    /// mkfs binary for this filesystem.
    pub fn mkfs_tool(self) -> Option<&'static str> {
        match self {
            FsKind::Ext4 => Some("mkfs.ext4"),
            FsKind::Xfs => Some("mkfs.xfs"),
            FsKind::Block => None,
        }
    }
}

impl Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Ext4 => write!(f, "ext4"),
            FsKind::Xfs => write!(f, "xfs"),
            FsKind::Block => write!(f, "block"),
        }
    }
}

impl FromStr for FsKind {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "ext4" => Ok(FsKind::Ext4),
            "xfs" => Ok(FsKind::Xfs),
            "block" => Ok(FsKind::Block),
            other => Err(ParamError::UnknownFs(other.to_string())),
        }
    }
}

// ============================================================================
// AccessMode
// ============================================================================

/// Declared access mode of a volume.
///
/// `Rwx` is admitted only for raw block volumes, and only as the transient
/// dual-attach window used by live VM migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Rwo,
    Rwx,
}

impl AccessMode {
    pub fn allows_dual_attach(self) -> bool {
        matches!(self, AccessMode::Rwx)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Rwo => write!(f, "RWO"),
            AccessMode::Rwx => write!(f, "RWX"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RWO" | "READWRITEONCE" => Ok(AccessMode::Rwo),
            "RWX" | "READWRITEMANY" => Ok(AccessMode::Rwx),
            other => Err(ParamError::BadValue {
                key: "accessMode".into(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// VolumeParams
// ============================================================================

/// Typed view of the StorageClass parameter bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    pub fs: FsKind,
    /// Seconds the kernel keeps retrying a lost controller; -1 is infinite.
    pub ctrl_loss_tmo: i32,
    /// Seconds between kernel reconnect attempts.
    pub reconnect_delay: u32,
    /// Keep-alive timeout in seconds; 0 leaves the kernel default.
    pub keep_alive_tmo: u32,
    /// How long a dual-attach migration window may stay open.
    pub migration_timeout: Duration,
    /// NVMe/TCP listener port on the appliance.
    pub nvme_port: u16,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            fs: FsKind::Ext4,
            // Infinite retry: the kernel must never give up mid-workload.
            ctrl_loss_tmo: -1,
            reconnect_delay: 5,
            keep_alive_tmo: 0,
            migration_timeout: Duration::from_secs(300),
            nvme_port: 4420,
        }
    }
}

fn parse_int<T: FromStr>(
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ParamError> {
    match map.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ParamError::BadValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
    }
}

impl VolumeParams {
    /// Parse a StorageClass parameter bag (also accepts a volume context,
    /// which carries the same keys).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ParamError> {
        let mut params = VolumeParams::default();

        if let Some(fs) = map.get(PARAM_FSTYPE) {
            params.fs = fs.parse()?;
        }
        if let Some(v) = parse_int::<i32>(map, PARAM_CTRL_LOSS_TMO)? {
            if v < -1 {
                return Err(ParamError::OutOfRange {
                    key: PARAM_CTRL_LOSS_TMO.into(),
                    value: v as i64,
                    min: -1,
                    max: i32::MAX as i64,
                });
            }
            params.ctrl_loss_tmo = v;
        }
        if let Some(v) = parse_int::<u32>(map, PARAM_RECONNECT_DELAY)? {
            params.reconnect_delay = v;
        }
        if let Some(v) = parse_int::<u32>(map, PARAM_KEEP_ALIVE_TMO)? {
            params.keep_alive_tmo = v;
        }
        if let Some(v) = parse_int::<u64>(map, PARAM_MIGRATION_TIMEOUT)? {
            if !(30..=3600).contains(&v) {
                return Err(ParamError::OutOfRange {
                    key: PARAM_MIGRATION_TIMEOUT.into(),
                    value: v as i64,
                    min: 30,
                    max: 3600,
                });
            }
            params.migration_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_int::<u16>(map, PARAM_NVME_PORT)? {
            params.nvme_port = v;
        }
        Ok(params)
    }

    /// Render into the volume context handed to the node service.
    pub fn to_volume_context(&self, addr: &str, nqn: &str) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert(CTX_ADDR.to_string(), addr.to_string());
        ctx.insert(CTX_NQN.to_string(), nqn.to_string());
        ctx.insert(PARAM_FSTYPE.to_string(), self.fs.to_string());
        ctx.insert(PARAM_NVME_PORT.to_string(), self.nvme_port.to_string());
        ctx.insert(
            PARAM_CTRL_LOSS_TMO.to_string(),
            self.ctrl_loss_tmo.to_string(),
        );
        ctx.insert(
            PARAM_RECONNECT_DELAY.to_string(),
            self.reconnect_delay.to_string(),
        );
        ctx.insert(
            PARAM_KEEP_ALIVE_TMO.to_string(),
            self.keep_alive_tmo.to_string(),
        );
        ctx
    }
}

// ============================================================================
// Identifier derivation
// ============================================================================

/// Volume identifier derived from the CSI volume name. UUID-v5 keeps the
/// mapping stable so orchestrator retries land on the same resource.
pub fn volume_id_for_name(name: &str) -> String {
    format!("pvc-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
}

/// Stable prefix of a snapshot identifier derived from the CSI snapshot
/// name. The full identifier appends `-at-<unix-seconds>` at creation;
/// retries look the snapshot up by this prefix.
pub fn snapshot_prefix_for_name(name: &str) -> String {
    format!("snap-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
}

/// Full snapshot identifier for a creation instant.
pub fn snapshot_id(prefix: &str, unix_seconds: i64) -> String {
    format!("{prefix}-at-{unix_seconds}")
}

/// Creation instant recovered from a snapshot identifier.
pub fn snapshot_creation_time(snapshot_id: &str) -> Option<i64> {
    snapshot_id.rsplit("-at-").next()?.parse().ok()
}
