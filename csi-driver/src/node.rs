//! CSI Node Service Implementation
//!
//! Handles volume staging and publishing on Linux nodes: NVMe/TCP fabric
//! connections, device wait with orphan tolerance, mkfs on first use,
//! staging mounts with stale-mount recovery, and bind-mount publishing
//! for both filesystem and raw block volumes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::csi;
use crate::device::{DeviceResolver, ResolveError};
use crate::k8s::events::EventPoster;
use crate::metrics;
use crate::mount::{MountEngine, MountError, StaleReason, Staleness};
use crate::nvme::NvmeFabric;
use crate::types::{self, VolumeParams};
use crate::volume_lock::VolumeLocks;

/// How long NodeStageVolume waits for a namespace device to appear after
/// `nvme connect`.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEVICE_WAIT_POLL: Duration = Duration::from_millis(500);

/// Topology key reported via NodeGetInfo.
const TOPOLOGY_NODE_KEY: &str = "topology.nvmeshelf.io/node";

/// Kubelet mount paths stay well below PATH_MAX; anything longer is not a
/// path kubelet produced.
const MAX_HOST_PATH_LEN: usize = 1024;

/// CSI Node Service
pub struct NodeService {
    cfg: Arc<DriverConfig>,
    resolver: Arc<DeviceResolver>,
    mounts: Arc<MountEngine>,
    fabric: NvmeFabric,
    locks: Arc<VolumeLocks>,
    poster: Arc<dyn EventPoster>,
}

impl NodeService {
    pub fn new(
        cfg: Arc<DriverConfig>,
        resolver: Arc<DeviceResolver>,
        mounts: Arc<MountEngine>,
        locks: Arc<VolumeLocks>,
        poster: Arc<dyn EventPoster>,
    ) -> Self {
        Self {
            cfg,
            resolver,
            mounts,
            fabric: NvmeFabric::new(),
            locks,
            poster,
        }
    }

    /// Validate a kubelet-supplied staging/target path before it reaches a
    /// mount command. Same allow-list discipline as the appliance-side
    /// identifiers: kubelet emits absolute paths built from pod UIDs, PV
    /// names and its `kubernetes.io~csi` plugin directories, so anything
    /// outside that character set is rejected rather than filtered.
    fn validate_host_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("mount path is required"));
        }
        if !path.starts_with('/') {
            return Err(Status::invalid_argument(format!(
                "mount path '{path}' is not absolute"
            )));
        }
        if path.len() > MAX_HOST_PATH_LEN {
            return Err(Status::invalid_argument(format!(
                "mount path exceeds {MAX_HOST_PATH_LEN} characters"
            )));
        }
        if let Some(bad) = path
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~')))
        {
            return Err(Status::invalid_argument(format!(
                "mount path contains forbidden character '{}'",
                bad.escape_default()
            )));
        }
        if path.contains("..") {
            return Err(Status::invalid_argument(format!(
                "mount path '{path}' contains a parent-directory segment"
            )));
        }
        Ok(())
    }

    /// The volume's NQN: from the volume context when present, otherwise
    /// derived from the configured prefix.
    fn nqn_for(&self, volume_id: &str, volume_context: &std::collections::HashMap<String, String>) -> String {
        volume_context
            .get(types::CTX_NQN)
            .cloned()
            .unwrap_or_else(|| self.cfg.nqn_for(volume_id))
    }

    fn mount_status(volume_id: &str, e: MountError) -> Status {
        match e {
            MountError::InUse(path) => Status::failed_precondition(format!(
                "mountpoint '{path}' is in use; refusing recovery for volume '{volume_id}'"
            )),
            MountError::Busy(path) => {
                Status::failed_precondition(format!("mountpoint '{path}' is busy"))
            }
            MountError::Storm { target, count } => Status::internal(format!(
                "mount storm for '{target}' ({count} records); manual intervention required"
            )),
            MountError::Resolve(ResolveError::NotFound(nqn)) => {
                Status::not_found(format!("no device for '{nqn}'"))
            }
            MountError::Resolve(ResolveError::Orphaned(nqn)) => {
                Status::unavailable(format!("subsystem '{nqn}' has no namespace device yet"))
            }
            other => {
                error!(volume_id, error = %other, "mount operation failed");
                Status::internal("mount operation failed")
            }
        }
    }

    /// Poll the resolver until the namespace device appears. Orphaned
    /// subsystems are expected briefly after connect or appliance restart;
    /// the loop keeps polling them until the deadline.
    async fn wait_for_device(&self, volume_id: &str, nqn: &str) -> Result<PathBuf, Status> {
        let deadline = tokio::time::Instant::now() + DEVICE_WAIT_TIMEOUT;
        let mut orphan_seen = false;
        loop {
            match self.resolver.resolve_device_path(nqn) {
                Ok(device) => {
                    if orphan_seen {
                        info!(volume_id, nqn, device = %device.display(), "orphaned subsystem recovered");
                        self.poster.orphan_cleaned(volume_id);
                    }
                    return Ok(device);
                }
                Err(ResolveError::Orphaned(_)) => {
                    if !orphan_seen {
                        warn!(volume_id, nqn, "subsystem present but no namespace device, waiting");
                        metrics::inc_orphans();
                        self.poster.orphan_detected(volume_id);
                        orphan_seen = true;
                    }
                }
                Err(ResolveError::NotFound(_)) => {
                    debug!(volume_id, nqn, "subsystem not visible yet, waiting");
                }
                Err(e) => {
                    error!(volume_id, nqn, error = %e, "device resolution failed");
                    return Err(Status::internal("device resolution failed"));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Status::deadline_exceeded(format!(
                    "device for volume '{volume_id}' did not appear within {}s",
                    DEVICE_WAIT_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(DEVICE_WAIT_POLL).await;
        }
    }

    /// Check if a device needs formatting (has no filesystem signature).
    fn needs_formatting(device: &Path) -> Result<bool, Status> {
        let output = Command::new("blkid")
            .arg("-p")
            .arg(device)
            .output()
            .map_err(|e| {
                error!(error = %e, "Failed to execute blkid");
                Status::internal("failed to probe device signature")
            })?;

        // blkid exits non-zero when no signature is found.
        if !output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("TYPE="))
    }

    fn format_device(device: &Path, params: &VolumeParams) -> Result<(), Status> {
        let Some(tool) = params.fs.mkfs_tool() else {
            return Ok(());
        };
        info!(device = %device.display(), fs = %params.fs, "formatting device");
        let force_flag = match params.fs {
            types::FsKind::Xfs => "-f",
            _ => "-F",
        };
        let output = Command::new(tool)
            .arg(force_flag)
            .arg(device)
            .output()
            .map_err(|e| {
                error!(error = %e, tool, "failed to execute mkfs");
                Status::internal(format!("failed to execute {tool}"))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(tool, stderr = %stderr, "mkfs failed");
            return Err(Status::internal(format!("{tool} failed")));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume: connect the fabric, wait for the device, format on
    /// first use, mount to the staging path. A volume staged before a
    /// driver restart goes through stale-check and recovery instead.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let staging = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if staging.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_host_path(staging)?;

        let params = VolumeParams::from_map(&req.volume_context)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let addr = req
            .volume_context
            .get(types::CTX_ADDR)
            .cloned()
            .unwrap_or_else(|| self.cfg.data_addr.clone());
        let nqn = self.nqn_for(volume_id, &req.volume_context);

        info!(
            volume_id = %volume_id,
            staging = %staging,
            nqn = %nqn,
            fs = %params.fs,
            "NodeStageVolume request"
        );

        let op = metrics::VolumeOp::start("node_stage_volume");
        let _guard = self.locks.lock(volume_id).await;

        // Raw block volumes stage by ensuring the device exists; the bind
        // to the publish path happens in NodePublishVolume.
        if params.fs.is_block() {
            if let Err(e) = self.fabric.connect(&addr, &nqn, &params) {
                self.poster.connection_failure(volume_id, &e.to_string());
                op.fail("connect");
                error!(volume_id = %volume_id, error = %e, "fabric connect failed");
                return Err(Status::internal("NVMe connect failed"));
            }
            if let Err(e) = self.wait_for_device(volume_id, &nqn).await {
                op.fail("device_wait");
                return Err(e);
            }
            self.fabric.verify_ctrl_loss_tmo(&nqn, params.ctrl_loss_tmo);
            op.ok();
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        match self
            .mounts
            .check_staleness(staging, &nqn)
            .map_err(|e| Self::mount_status(volume_id, e))?
        {
            Staleness::Fresh { device } => {
                info!(volume_id = %volume_id, device = %device.display(), "volume already staged");
                op.ok();
                return Ok(Response::new(csi::NodeStageVolumeResponse {}));
            }
            Staleness::Stale(StaleReason::NotMounted) => {
                // First stage on this node (or a clean unmount happened).
            }
            Staleness::Stale(reason) => {
                warn!(volume_id = %volume_id, ?reason, "stale staging mount detected");
                metrics::inc_stale_mounts();
                self.poster
                    .stale_mount_detected(volume_id, &format!("{reason:?}"));
                let options = self
                    .mounts
                    .find_mount(staging)
                    .ok()
                    .flatten()
                    .map(|r| r.options)
                    .unwrap_or_default();
                if let Err(e) = self
                    .mounts
                    .recover(staging, &nqn, &params.fs.to_string(), &options)
                    .await
                {
                    op.fail("recovery");
                    self.poster
                        .mount_failure(volume_id, "stale mount recovery failed");
                    return Err(Self::mount_status(volume_id, e));
                }
                self.poster.connection_recovery(volume_id);
                op.ok();
                return Ok(Response::new(csi::NodeStageVolumeResponse {}));
            }
        }

        if let Err(e) = self.fabric.connect(&addr, &nqn, &params) {
            self.poster.connection_failure(volume_id, &e.to_string());
            op.fail("connect");
            error!(volume_id = %volume_id, error = %e, "fabric connect failed");
            return Err(Status::internal("NVMe connect failed"));
        }

        let device = match self.wait_for_device(volume_id, &nqn).await {
            Ok(device) => device,
            Err(e) => {
                op.fail("device_wait");
                return Err(e);
            }
        };
        self.fabric.verify_ctrl_loss_tmo(&nqn, params.ctrl_loss_tmo);

        if Self::needs_formatting(&device)? {
            Self::format_device(&device, &params)?;
        }

        if let Err(e) = self
            .mounts
            .mount(&device, staging, &params.fs.to_string(), "")
        {
            op.fail("mount");
            self.poster.mount_failure(volume_id, "staging mount failed");
            return Err(Self::mount_status(volume_id, e));
        }

        info!(
            volume_id = %volume_id,
            staging = %staging,
            device = %device.display(),
            "Volume staged successfully"
        );
        op.ok();
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage: unmount the staging path and disconnect the fabric.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let staging = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if staging.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_host_path(staging)?;

        info!(volume_id = %volume_id, staging = %staging, "NodeUnstageVolume request");

        let _guard = self.locks.lock(volume_id).await;

        self.mounts
            .unmount(staging, false)
            .map_err(|e| Self::mount_status(volume_id, e))?;

        let nqn = self.cfg.nqn_for(volume_id);
        self.fabric.disconnect(&nqn).map_err(|e| {
            error!(volume_id = %volume_id, error = %e, "nvme disconnect failed");
            Status::internal("NVMe disconnect failed")
        })?;
        self.resolver.invalidate(&nqn);

        info!(volume_id = %volume_id, "Volume unstaged successfully");
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish: bind-mount from staging (filesystem) or bind the device
    /// node (raw block) to the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let target = &req.target_path;
        let staging = &req.staging_target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if target.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_host_path(target)?;
        if staging.is_empty() {
            return Err(Status::invalid_argument(
                "Staging target path is required (STAGE_UNSTAGE_VOLUME capability is enabled)",
            ));
        }
        Self::validate_host_path(staging)?;

        let is_block = matches!(
            req.volume_capability.as_ref().and_then(|c| c.access_type.as_ref()),
            Some(csi::volume_capability::AccessType::Block(_))
        );

        info!(
            volume_id = %volume_id,
            staging = %staging,
            target = %target,
            readonly = %req.readonly,
            block = is_block,
            "NodePublishVolume request"
        );

        let _guard = self.locks.lock(volume_id).await;

        if self
            .mounts
            .find_mount(target)
            .map_err(|e| Self::mount_status(volume_id, MountError::Io(e)))?
            .is_some()
        {
            info!(target = %target, "volume already published");
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        if is_block {
            let nqn = self.nqn_for(volume_id, &req.volume_context);
            let device = self.resolver.resolve_device_path(&nqn).map_err(|e| {
                Self::mount_status(volume_id, MountError::Resolve(e))
            })?;
            if let Some(parent) = Path::new(target).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Self::mount_status(volume_id, MountError::Io(e)))?;
            }
            // Bind target for a block device is a file, not a directory.
            if !Path::new(target).exists() {
                std::fs::File::create(target)
                    .map_err(|e| Self::mount_status(volume_id, MountError::Io(e)))?;
            }
            self.mounts
                .bind_mount(&device.to_string_lossy(), target)
                .map_err(|e| {
                    self.poster.mount_failure(volume_id, "block publish failed");
                    Self::mount_status(volume_id, e)
                })?;
        } else {
            let nqn = self.nqn_for(volume_id, &req.volume_context);
            match self
                .mounts
                .check_staleness(staging, &nqn)
                .map_err(|e| Self::mount_status(volume_id, e))?
            {
                Staleness::Fresh { .. } => {}
                Staleness::Stale(reason) => {
                    return Err(Status::failed_precondition(format!(
                        "volume '{volume_id}' is not freshly staged at '{staging}' ({reason:?}); restage required"
                    )));
                }
            }
            std::fs::create_dir_all(target)
                .map_err(|e| Self::mount_status(volume_id, MountError::Io(e)))?;
            self.mounts.bind_mount(staging, target).map_err(|e| {
                self.poster.mount_failure(volume_id, "bind mount failed");
                Self::mount_status(volume_id, e)
            })?;

            if req.readonly {
                let output = Command::new("mount")
                    .args(["-o", "remount,ro,bind", target])
                    .output()
                    .map_err(|e| {
                        error!(error = %e, "failed to remount readonly");
                        Status::internal("failed to remount readonly")
                    })?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(stderr = %stderr, "failed to set readonly, continuing anyway");
                }
            }
        }

        info!(volume_id = %volume_id, target = %target, "Volume published successfully");
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish: unmount the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let target = &req.target_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if target.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_host_path(target)?;

        info!(volume_id = %volume_id, target = %target, "NodeUnpublishVolume request");

        let _guard = self.locks.lock(volume_id).await;

        self.mounts
            .unmount(target, false)
            .map_err(|e| Self::mount_status(volume_id, e))?;

        // Best-effort cleanup of the bind target (dir for fs, file for block).
        let path = Path::new(target);
        if path.is_dir() {
            if let Err(e) = std::fs::remove_dir(path) {
                warn!(error = %e, target = %target, "could not remove target directory");
            }
        } else if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(error = %e, target = %target, "could not remove target file");
            }
        }

        info!(volume_id = %volume_id, target = %target, "Volume unpublished successfully");
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.cfg.node_id, "NodeGetInfo request");

        let mut segments = std::collections::HashMap::new();
        segments.insert(TOPOLOGY_NODE_KEY.to_string(), self.cfg.node_id.clone());
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.cfg.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: Some(csi::Topology { segments }),
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::ExpandVolume,
            Type::GetVolumeStats,
            Type::VolumeCondition,
        ]
        .into_iter()
        .map(|t| csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Grow the filesystem after a controller-side expansion.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let volume_path = &req.volume_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_host_path(volume_path)?;

        info!(volume_id = %volume_id, volume_path = %volume_path, "NodeExpandVolume request");

        let _guard = self.locks.lock(volume_id).await;

        let record = self
            .mounts
            .find_mount(volume_path)
            .map_err(|e| Self::mount_status(volume_id, MountError::Io(e)))?;

        match record {
            Some(record) => {
                let (tool, arg) = match record.fstype.as_str() {
                    "ext4" => ("resize2fs", record.source.clone()),
                    "xfs" => ("xfs_growfs", record.mount_point.clone()),
                    other => {
                        return Err(Status::invalid_argument(format!(
                            "online resize is not supported for filesystem '{other}'"
                        )));
                    }
                };
                let output = Command::new(tool).arg(&arg).output().map_err(|e| {
                    error!(error = %e, tool, "failed to execute resize tool");
                    Status::internal(format!("failed to execute {tool}"))
                })?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!(tool, stderr = %stderr, "resize failed");
                    return Err(Status::internal(format!("{tool} failed")));
                }
            }
            // Raw block volumes need no node-side resize.
            None => debug!(volume_id = %volume_id, "no mount at volume path, skipping fs resize"),
        }

        let capacity_bytes = req
            .capacity_range
            .map(|r| {
                if r.required_bytes > 0 {
                    r.required_bytes
                } else {
                    r.limit_bytes
                }
            })
            .unwrap_or_default();
        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }

    /// Filesystem usage plus a volume condition from the stale check.
    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let volume_path = &req.volume_path;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_host_path(volume_path)?;

        let check_path = if req.staging_target_path.is_empty() {
            volume_path
        } else {
            &req.staging_target_path
        };
        let nqn = self.cfg.nqn_for(volume_id);
        let condition = match self.mounts.check_staleness(check_path, &nqn) {
            Ok(Staleness::Fresh { .. }) => csi::VolumeCondition {
                abnormal: false,
                message: "healthy".to_string(),
            },
            Ok(Staleness::Stale(reason)) => {
                metrics::inc_stale_mounts();
                csi::VolumeCondition {
                    abnormal: true,
                    message: format!("stale mount: {reason:?}"),
                }
            }
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "staleness check failed");
                csi::VolumeCondition {
                    abnormal: true,
                    message: "staleness check failed".to_string(),
                }
            }
        };

        let usage = match fs_usage(volume_path) {
            Ok(usage) => usage,
            Err(e) => {
                debug!(volume_id = %volume_id, error = %e.message(), "no filesystem usage available");
                vec![]
            }
        };

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage,
            volume_condition: Some(condition),
        }))
    }
}

/// Filesystem usage via `df` (POSIX output format).
fn fs_usage(path: &str) -> Result<Vec<csi::VolumeUsage>, Status> {
    let blocks = Command::new("df")
        .args(["-Pk", path])
        .output()
        .map_err(|e| Status::internal(format!("failed to execute df: {e}")))?;
    if !blocks.status.success() {
        return Err(Status::internal("df failed"));
    }
    let bytes = parse_df_numbers(&String::from_utf8_lossy(&blocks.stdout))
        .ok_or_else(|| Status::internal("could not parse df output"))?;

    // df -Pk reports 1K blocks.
    let mut usage = vec![csi::VolumeUsage {
        available: bytes.available * 1024,
        total: bytes.total * 1024,
        used: bytes.used * 1024,
        unit: csi::volume_usage::Unit::Bytes as i32,
    }];

    let inodes = Command::new("df")
        .args(["-Pi", path])
        .output()
        .map_err(|e| Status::internal(format!("failed to execute df: {e}")))?;
    if inodes.status.success() {
        if let Some(counts) = parse_df_numbers(&String::from_utf8_lossy(&inodes.stdout)) {
            usage.push(csi::VolumeUsage {
                available: counts.available,
                total: counts.total,
                used: counts.used,
                unit: csi::volume_usage::Unit::Inodes as i32,
            });
        }
    }
    Ok(usage)
}

struct DfNumbers {
    total: i64,
    used: i64,
    available: i64,
}

/// Second line of POSIX `df -P`: filesystem, total, used, available, ...
fn parse_df_numbers(output: &str) -> Option<DfNumbers> {
    let line = output.lines().nth(1)?;
    let mut fields = line.split_whitespace().skip(1);
    let total: i64 = fields.next()?.parse().ok()?;
    let used: i64 = fields.next()?.parse().ok()?;
    let available: i64 = fields.next()?.parse().ok()?;
    Some(DfNumbers {
        total,
        used,
        available,
    })
}
