//! CSI Controller Service Implementation
//!
//! Handles volume and snapshot lifecycle operations against the appliance
//! shell, and tracks volume→node attachments for RWO enforcement and
//! live-migration dual-attach. This is the only layer that translates
//! internal error kinds into gRPC status codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use appliance_shell::{DiskEntry, DiskSpec, ShellClient, ShellError};
use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::attach::{AttachError, AttachmentManager};
use crate::config::DriverConfig;
use crate::csi;
use crate::k8s::pv::PvAnnotator;
use crate::metrics::VolumeOp;
use crate::types::{self, AccessMode, FsKind, VolumeParams};
use crate::volume_lock::VolumeLocks;

/// Default volume size: 1GB
const DEFAULT_VOLUME_SIZE: u64 = 1024 * 1024 * 1024;

/// Appliance allocation granularity; requested capacities round up to it.
const ALLOC_GRANULARITY: u64 = 1024 * 1024;

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion and expansion on the appliance
/// - Snapshot creation and deletion
/// - Attachment tracking (publish/unpublish)
/// - Capacity and listing queries with pagination
pub struct ControllerService {
    cfg: Arc<DriverConfig>,
    shell: Arc<ShellClient>,
    attachments: Arc<AttachmentManager>,
    locks: Arc<VolumeLocks>,
    /// Absent in clusters without API access (tests); annotation writes
    /// and breaker resets are skipped then.
    annotator: Option<PvAnnotator>,
}

impl ControllerService {
    pub fn new(
        cfg: Arc<DriverConfig>,
        shell: Arc<ShellClient>,
        attachments: Arc<AttachmentManager>,
        locks: Arc<VolumeLocks>,
        annotator: Option<PvAnnotator>,
    ) -> Self {
        Self {
            cfg,
            shell,
            attachments,
            locks,
            annotator,
        }
    }

    /// Translate a shell error into the CSI status surface. Unclassified
    /// failures keep their detail in the log, not in the caller-visible
    /// message.
    fn shell_status(e: ShellError) -> Status {
        match e {
            ShellError::NotFound(msg) => Status::not_found(msg),
            ShellError::AlreadyExists(msg) => Status::already_exists(msg),
            ShellError::OutOfSpace(msg) => Status::resource_exhausted(msg),
            ShellError::InvalidName(msg) => Status::invalid_argument(msg),
            ShellError::Unavailable(_) | ShellError::BreakerOpen => {
                Status::unavailable("appliance unavailable, retry")
            }
            ShellError::Unauthenticated(_) => {
                Status::unauthenticated("appliance authentication failed")
            }
            ShellError::Parse(msg) => {
                error!(error = %msg, "unparseable appliance output");
                Status::internal("unexpected appliance output")
            }
            ShellError::CommandFailed(msg) => {
                error!(error = %msg, "appliance command failed");
                Status::internal("appliance command failed")
            }
        }
    }

    fn attach_status(e: AttachError) -> Status {
        match e {
            AttachError::Conflict { .. }
            | AttachError::MigrationLimit(_)
            | AttachError::NotTracked(_)
            | AttachError::MigrationInProgress { .. }
            | AttachError::MigrationTimedOut(_) => Status::failed_precondition(e.to_string()),
        }
    }

    /// Requested capacity in bytes, rounded up to the appliance allocation
    /// granularity. An explicit zero or negative request is a caller bug.
    fn requested_capacity(range: Option<&csi::CapacityRange>) -> Result<u64, Status> {
        let bytes = match range {
            None => DEFAULT_VOLUME_SIZE,
            Some(range) => {
                if range.required_bytes < 0 || range.limit_bytes < 0 {
                    return Err(Status::invalid_argument("capacity must not be negative"));
                }
                if range.required_bytes > 0 {
                    range.required_bytes as u64
                } else if range.limit_bytes > 0 {
                    range.limit_bytes as u64
                } else {
                    return Err(Status::invalid_argument("capacity must be positive"));
                }
            }
        };
        Ok(bytes.div_ceil(ALLOC_GRANULARITY) * ALLOC_GRANULARITY)
    }

    /// Access mode and volume mode from one capability.
    fn parse_capability(cap: &csi::VolumeCapability) -> Result<(AccessMode, bool), Status> {
        use csi::volume_capability::access_mode::Mode;

        let is_block = matches!(
            cap.access_type,
            Some(csi::volume_capability::AccessType::Block(_))
        );
        let mode = cap
            .access_mode
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability is missing access mode"))?;
        let mode = match Mode::try_from(mode.mode) {
            Ok(Mode::SingleNodeWriter)
            | Ok(Mode::SingleNodeReaderOnly)
            | Ok(Mode::SingleNodeSingleWriter)
            | Ok(Mode::SingleNodeMultiWriter) => AccessMode::Rwo,
            Ok(Mode::MultiNodeSingleWriter) | Ok(Mode::MultiNodeMultiWriter) => AccessMode::Rwx,
            other => {
                return Err(Status::invalid_argument(format!(
                    "unsupported access mode {other:?}"
                )));
            }
        };
        // RWX on a filesystem volume is a cluster-filesystem data
        // corruption trap; only raw block volumes may dual-attach.
        if mode == AccessMode::Rwx && !is_block {
            return Err(Status::invalid_argument(
                "RWX is supported only with volumeMode: Block",
            ));
        }
        Ok((mode, is_block))
    }

    /// Access mode across a capability set.
    fn parse_capabilities(caps: &[csi::VolumeCapability]) -> Result<(AccessMode, bool), Status> {
        if caps.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }
        let mut mode = AccessMode::Rwo;
        let mut is_block = false;
        for cap in caps {
            let (m, b) = Self::parse_capability(cap)?;
            if m == AccessMode::Rwx {
                mode = AccessMode::Rwx;
            }
            is_block |= b;
        }
        Ok((mode, is_block))
    }

    /// Gate a volume operation on its circuit breaker, honoring the
    /// operator's reset annotation.
    async fn breaker_guard(&self, volume_id: &str) -> Result<(), Status> {
        if self.locks.check_breaker(volume_id).is_ok() {
            return Ok(());
        }
        if let Some(annotator) = &self.annotator {
            if annotator.reset_requested(volume_id).await {
                self.locks.reset_breaker(volume_id);
                annotator.clear_reset_annotation(volume_id);
                return Ok(());
            }
        }
        Err(Status::unavailable(format!(
            "circuit breaker open for volume '{volume_id}'; set the reset annotation to retry"
        )))
    }

    fn record_outcome<T>(&self, volume_id: &str, result: &Result<T, ShellError>) {
        match result {
            Ok(_) => {
                self.locks.record_success(volume_id);
                crate::metrics::set_appliance_connected(true);
            }
            Err(ShellError::BreakerOpen) => {}
            Err(e) => {
                self.locks.record_failure(volume_id);
                if matches!(e, ShellError::Unavailable(_)) {
                    crate::metrics::set_appliance_connected(false);
                }
            }
        }
    }

    fn entry_to_csi_volume(&self, entry: &DiskEntry, params: &VolumeParams) -> csi::Volume {
        csi::Volume {
            capacity_bytes: entry.size_bytes as i64,
            volume_id: entry.slot.clone(),
            volume_context: params
                .to_volume_context(&self.cfg.data_addr, &self.cfg.nqn_for(&entry.slot)),
            content_source: None,
            accessible_topology: vec![],
        }
    }

    fn entry_to_csi_snapshot(&self, entry: &DiskEntry, source_volume_id: &str) -> csi::Snapshot {
        let seconds = types::snapshot_creation_time(&entry.slot).unwrap_or_default();
        csi::Snapshot {
            size_bytes: entry.size_bytes as i64,
            snapshot_id: entry.slot.clone(),
            source_volume_id: source_volume_id.to_string(),
            creation_time: Some(Timestamp { seconds, nanos: 0 }),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        }
    }

    /// Source volume id recovered from a snapshot's backing path
    /// (`<base>/<source>/<snap>.img`).
    fn snapshot_source_from_path(&self, entry: &DiskEntry) -> Option<String> {
        let base = format!("{}/", self.cfg.base_path.trim_end_matches('/'));
        let rest = entry.file_path.strip_prefix(&base)?;
        let (source, _) = rest.split_once('/')?;
        Some(source.to_string())
    }

    fn paginate<T>(entries: Vec<T>, max_entries: i32, starting_token: &str) -> Result<(Vec<T>, String), Status> {
        let start: usize = if starting_token.is_empty() {
            0
        } else {
            starting_token
                .parse()
                .map_err(|_| Status::aborted(format!("invalid starting token '{starting_token}'")))?
        };
        if start > entries.len() {
            return Ok((Vec::new(), String::new()));
        }
        let remaining = entries.len() - start;
        let page = if max_entries > 0 {
            (max_entries as usize).min(remaining)
        } else {
            remaining
        };
        let end = start + page;
        let next_token = if end < entries.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok((entries.into_iter().skip(start).take(page).collect(), next_token))
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume (optionally pre-populated from a snapshot).
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let name = &req.name;

        if name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }

        let (_mode, is_block) = Self::parse_capabilities(&req.volume_capabilities)?;
        let mut params = VolumeParams::from_map(&req.parameters)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if is_block {
            params.fs = FsKind::Block;
        }
        let capacity = Self::requested_capacity(req.capacity_range.as_ref())?;
        let volume_id = types::volume_id_for_name(name);

        info!(name = %name, volume_id = %volume_id, capacity, "CreateVolume request");

        let op = VolumeOp::start("create_volume");
        let _guard = self.locks.lock(&volume_id).await;
        self.breaker_guard(&volume_id).await?;

        let spec = DiskSpec {
            slot: volume_id.clone(),
            file_path: self.cfg.backing_path_for(&volume_id),
            size_bytes: capacity,
            nqn: self.cfg.nqn_for(&volume_id),
            port: params.nvme_port,
        };

        let source_snapshot = req.volume_content_source.as_ref().and_then(|src| {
            match &src.r#type {
                Some(csi::volume_content_source::Type::Snapshot(snap)) => {
                    Some(snap.snapshot_id.clone())
                }
                _ => None,
            }
        });

        let result = match &source_snapshot {
            Some(snapshot_id) => {
                debug!(volume_id = %volume_id, snapshot_id = %snapshot_id, "creating volume from snapshot");
                match self.shell.find_disk(snapshot_id).await {
                    Ok(None) => Err(ShellError::NotFound(format!(
                        "snapshot '{snapshot_id}' not found"
                    ))),
                    Ok(Some(_)) => self.shell.create_volume_from(&spec, snapshot_id).await,
                    Err(e) => Err(e),
                }
            }
            None => self.shell.create_volume(&spec).await,
        };
        self.record_outcome(&volume_id, &result);

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                error!(volume_id = %volume_id, error = %e, "CreateVolume failed");
                op.fail("shell");
                return Err(Self::shell_status(e));
            }
        };

        info!(volume_id = %volume_id, size_bytes = entry.size_bytes, "Volume created successfully");
        op.ok();

        let mut volume = self.entry_to_csi_volume(&entry, &params);
        volume.content_source = req.volume_content_source;
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume),
        }))
    }

    /// Delete a volume; absent slots are success.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        let op = VolumeOp::start("delete_volume");
        let _guard = self.locks.lock(volume_id).await;
        self.breaker_guard(volume_id).await?;

        let result = self.shell.delete_volume(volume_id).await;
        self.record_outcome(volume_id, &result);
        if let Err(e) = result {
            error!(volume_id = %volume_id, error = %e, "DeleteVolume failed");
            op.fail("shell");
            return Err(Self::shell_status(e));
        }

        // Clear any attachment state the reconciler has not gotten to yet.
        if self.attachments.get(volume_id).is_some() {
            warn!(volume_id = %volume_id, "volume deleted while still tracked, untracking");
            self.attachments.untrack(volume_id);
            if let Some(annotator) = &self.annotator {
                annotator.clear_attachment(volume_id);
            }
        }
        self.locks.forget(volume_id);

        op.ok();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Track an attachment. No appliance-side work happens here: the
    /// network export exists for the volume's lifetime and nodes connect
    /// directly. This call exists to enforce RWO semantics and to feed
    /// the reconciler.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let node_id = &req.node_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if node_id.is_empty() {
            return Err(Status::invalid_argument("Node ID is required"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;
        let (mode, _is_block) = Self::parse_capability(capability)?;
        let params = VolumeParams::from_map(&req.volume_context)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(volume_id = %volume_id, node_id = %node_id, mode = %mode, "ControllerPublishVolume request");

        let _guard = self.locks.lock(volume_id).await;

        if self.shell.find_disk(volume_id).await.map_err(Self::shell_status)?.is_none() {
            return Err(Status::not_found(format!("volume '{volume_id}' not found")));
        }

        if self.attachments.is_attached_to_node(volume_id, node_id) {
            debug!(volume_id = %volume_id, node_id = %node_id, "already published to node");
        } else if self.attachments.node_count(volume_id) == 0 {
            self.attachments
                .track(volume_id, node_id, mode)
                .map_err(Self::attach_status)?;
        } else if mode.allows_dual_attach() {
            self.attachments
                .add_secondary(volume_id, node_id, params.migration_timeout)
                .map_err(Self::attach_status)?;
        } else {
            self.attachments
                .track(volume_id, node_id, mode)
                .map_err(Self::attach_status)?;
        }

        if let Some(annotator) = &self.annotator {
            let holders = self.attachments.attached_nodes(volume_id).join(",");
            annotator.record_attachment(volume_id, &holders);
        }

        let mut publish_context = HashMap::new();
        publish_context.insert(types::CTX_NQN.to_string(), self.cfg.nqn_for(volume_id));
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    /// Remove a node from an attachment; untracked pairs are success.
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let node_id = &req.node_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, node_id = %node_id, "ControllerUnpublishVolume request");

        let _guard = self.locks.lock(volume_id).await;
        let fully_detached = self.attachments.remove_node(volume_id, node_id);

        if let Some(annotator) = &self.annotator {
            if fully_detached {
                annotator.clear_attachment(volume_id);
            } else if self.attachments.node_count(volume_id) > 0 {
                let holders = self.attachments.attached_nodes(volume_id).join(",");
                annotator.record_attachment(volume_id, &holders);
            }
        }

        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    /// Expand a volume; filesystem growth happens on the node afterwards.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.capacity_range.is_none() {
            return Err(Status::invalid_argument(
                "Capacity range is required for volume expansion",
            ));
        }
        let new_size = Self::requested_capacity(req.capacity_range.as_ref())?;

        info!(volume_id = %volume_id, new_size, "ControllerExpandVolume request");

        let op = VolumeOp::start("expand_volume");
        let _guard = self.locks.lock(volume_id).await;
        self.breaker_guard(volume_id).await?;

        let result = self.shell.expand_volume(volume_id, new_size).await;
        self.record_outcome(volume_id, &result);
        let actual = match result {
            Ok(actual) => actual,
            Err(e) => {
                error!(volume_id = %volume_id, error = %e, "ControllerExpandVolume failed");
                op.fail("shell");
                return Err(Self::shell_status(e));
            }
        };

        op.ok();
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: actual as i64,
            node_expansion_required: true,
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::ListVolumesPublishedNodes,
            Type::GetCapacity,
            Type::ExpandVolume,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::GetVolume,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot: a full independent copy of the source backing
    /// file, not network-exported.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let source_volume_id = &req.source_volume_id;
        let name = &req.name;

        if source_volume_id.is_empty() {
            return Err(Status::invalid_argument("Source volume ID is required"));
        }
        if name.is_empty() {
            return Err(Status::invalid_argument("Snapshot name is required"));
        }

        info!(source_volume_id = %source_volume_id, name = %name, "CreateSnapshot request");

        let op = VolumeOp::start("create_snapshot");
        // Serialize against other operations on the SOURCE volume; the
        // copy must not race a concurrent delete or expand.
        let _guard = self.locks.lock(source_volume_id).await;
        self.breaker_guard(source_volume_id).await?;

        let prefix = types::snapshot_prefix_for_name(name);

        // Idempotent retry: the stable prefix finds a prior creation even
        // though the full id carries a creation suffix.
        let existing = self
            .shell
            .list_snapshots(&prefix)
            .await
            .map_err(Self::shell_status)?;
        if let Some(entry) = existing.into_iter().next() {
            match self.snapshot_source_from_path(&entry) {
                Some(source) if source == *source_volume_id => {
                    debug!(snapshot_id = %entry.slot, "snapshot already exists");
                    op.ok();
                    let snapshot = self.entry_to_csi_snapshot(&entry, source_volume_id);
                    return Ok(Response::new(csi::CreateSnapshotResponse {
                        snapshot: Some(snapshot),
                    }));
                }
                _ => {
                    op.fail("conflict");
                    return Err(Status::already_exists(format!(
                        "snapshot name '{name}' already used for a different source volume"
                    )));
                }
            }
        }

        if self
            .shell
            .find_disk(source_volume_id)
            .await
            .map_err(Self::shell_status)?
            .is_none()
        {
            op.fail("not_found");
            return Err(Status::not_found(format!(
                "source volume '{source_volume_id}' not found"
            )));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let snapshot_id = types::snapshot_id(&prefix, now);
        let snap_path = self.cfg.snapshot_path_for(source_volume_id, &snapshot_id);

        let result = self
            .shell
            .create_snapshot(&snapshot_id, source_volume_id, &snap_path)
            .await;
        self.record_outcome(source_volume_id, &result);
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                error!(snapshot_id = %snapshot_id, error = %e, "CreateSnapshot failed");
                op.fail("shell");
                return Err(Self::shell_status(e));
            }
        };

        info!(snapshot_id = %snapshot_id, source_volume_id = %source_volume_id, "Snapshot created successfully");
        op.ok();
        let snapshot = self.entry_to_csi_snapshot(&entry, source_volume_id);
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot),
        }))
    }

    /// Delete a snapshot; absent snapshots are success.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        let snapshot_id = &req.snapshot_id;

        if snapshot_id.is_empty() {
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %snapshot_id, "DeleteSnapshot request");

        let _guard = self.locks.lock(snapshot_id).await;
        self.shell
            .delete_snapshot(snapshot_id)
            .await
            .map_err(|e| {
                error!(snapshot_id = %snapshot_id, error = %e, "DeleteSnapshot failed");
                Self::shell_status(e)
            })?;

        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    /// Confirm capabilities for an existing volume. RWX is confirmed only
    /// for raw block volumes.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        if self
            .shell
            .find_disk(volume_id)
            .await
            .map_err(Self::shell_status)?
            .is_none()
        {
            return Err(Status::not_found(format!("volume '{volume_id}' not found")));
        }

        match Self::parse_capabilities(&req.volume_capabilities) {
            Ok(_) => Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                    mutable_parameters: req.mutable_parameters,
                }),
                message: String::new(),
            })),
            Err(status) => Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: status.message().to_string(),
            })),
        }
    }

    /// List volumes with their published nodes.
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();

        let entries = self
            .shell
            .list_volumes("pvc-")
            .await
            .map_err(Self::shell_status)?;
        let (page, next_token) = Self::paginate(entries, req.max_entries, &req.starting_token)?;

        let params = VolumeParams::default();
        let entries = page
            .iter()
            .map(|entry| csi::list_volumes_response::Entry {
                volume: Some(self.entry_to_csi_volume(entry, &params)),
                status: Some(csi::list_volumes_response::VolumeStatus {
                    published_node_ids: self.attachments.attached_nodes(&entry.slot),
                    volume_condition: None,
                }),
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    /// Report one volume with its published nodes.
    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let entry = self
            .shell
            .find_disk(volume_id)
            .await
            .map_err(Self::shell_status)?
            .ok_or_else(|| Status::not_found(format!("volume '{volume_id}' not found")))?;

        let migration_failed = self
            .attachments
            .get(volume_id)
            .map(|s| s.migration_failed)
            .unwrap_or(false);

        Ok(Response::new(csi::ControllerGetVolumeResponse {
            volume: Some(self.entry_to_csi_volume(&entry, &VolumeParams::default())),
            status: Some(csi::controller_get_volume_response::VolumeStatus {
                published_node_ids: self.attachments.attached_nodes(volume_id),
                volume_condition: Some(csi::VolumeCondition {
                    abnormal: migration_failed,
                    message: if migration_failed {
                        "migration timeout exceeded".to_string()
                    } else {
                        String::new()
                    },
                }),
            }),
        }))
    }

    /// Free capacity of the backing pool.
    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let available = self
            .shell
            .get_capacity(&self.cfg.pool)
            .await
            .map_err(Self::shell_status)?;

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: available as i64,
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    /// List snapshots, optionally filtered by snapshot or source volume.
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();

        let mut entries = self
            .shell
            .list_snapshots("snap-")
            .await
            .map_err(Self::shell_status)?;

        if !req.snapshot_id.is_empty() {
            entries.retain(|e| e.slot == req.snapshot_id);
        }
        let mut with_sources: Vec<(DiskEntry, String)> = entries
            .into_iter()
            .filter_map(|e| {
                let source = self.snapshot_source_from_path(&e)?;
                Some((e, source))
            })
            .collect();
        if !req.source_volume_id.is_empty() {
            with_sources.retain(|(_, source)| *source == req.source_volume_id);
        }

        let (page, next_token) =
            Self::paginate(with_sources, req.max_entries, &req.starting_token)?;
        let entries = page
            .iter()
            .map(|(entry, source)| csi::list_snapshots_response::Entry {
                snapshot: Some(self.entry_to_csi_snapshot(entry, source)),
            })
            .collect();

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_capacity_rounding() {
        let range = csi::CapacityRange {
            required_bytes: ALLOC_GRANULARITY as i64 + 1,
            limit_bytes: 0,
        };
        assert_eq!(
            ControllerService::requested_capacity(Some(&range)).unwrap(),
            2 * ALLOC_GRANULARITY
        );
    }

    #[test]
    fn test_requested_capacity_defaults_and_zero() {
        assert_eq!(
            ControllerService::requested_capacity(None).unwrap(),
            DEFAULT_VOLUME_SIZE
        );

        // Explicit zero capacity is a caller bug.
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        let err = ControllerService::requested_capacity(Some(&range)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_requested_capacity_limit_fallback() {
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::requested_capacity(Some(&range)).unwrap(),
            5 * 1024 * 1024 * 1024
        );
    }

    fn capability(mode: csi::volume_capability::access_mode::Mode, block: bool) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(if block {
                csi::volume_capability::AccessType::Block(csi::volume_capability::BlockVolume {})
            } else {
                csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                    fs_type: "ext4".to_string(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                })
            }),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_parse_capability_rwo_mount() {
        use csi::volume_capability::access_mode::Mode;
        let (mode, block) =
            ControllerService::parse_capability(&capability(Mode::SingleNodeWriter, false))
                .unwrap();
        assert_eq!(mode, AccessMode::Rwo);
        assert!(!block);
    }

    #[test]
    fn test_parse_capability_rwx_block() {
        use csi::volume_capability::access_mode::Mode;
        let (mode, block) =
            ControllerService::parse_capability(&capability(Mode::MultiNodeMultiWriter, true))
                .unwrap();
        assert_eq!(mode, AccessMode::Rwx);
        assert!(block);
    }

    #[test]
    fn test_parse_capability_rejects_rwx_mount() {
        use csi::volume_capability::access_mode::Mode;
        let err =
            ControllerService::parse_capability(&capability(Mode::MultiNodeMultiWriter, false))
                .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(err.message().contains("Block"));
    }

    #[test]
    fn test_paginate() {
        let entries: Vec<u32> = (0..10).collect();
        let (page, next) = ControllerService::paginate(entries.clone(), 4, "").unwrap();
        assert_eq!(page, vec![0, 1, 2, 3]);
        assert_eq!(next, "4");

        let (page, next) = ControllerService::paginate(entries.clone(), 4, "8").unwrap();
        assert_eq!(page, vec![8, 9]);
        assert_eq!(next, "");

        let (page, next) = ControllerService::paginate(entries.clone(), 0, "").unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(next, "");

        assert!(ControllerService::paginate(entries, 4, "bogus").is_err());
    }
}
