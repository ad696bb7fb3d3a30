//! Attachment state recovery.
//!
//! On controller start the attachment map is rebuilt from the
//! orchestrator's VolumeAttachment objects, filtered to our attacher name.
//! These objects are authoritative; per-PV annotations are never read.
//! The reconciler must not run until this completes.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams};
use tracing::{info, warn};

use crate::attach::{AttachedNode, AttachmentManager, AttachmentState};
use crate::types::AccessMode;

/// Migration timeout assumed for migrations found mid-flight at restart;
/// the per-volume StorageClass value is not recoverable from the
/// attachment objects.
const RESTORED_MIGRATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Rebuild the attachment map. Returns the number of volumes restored.
pub async fn rebuild_attachments(
    client: kube::Client,
    driver_name: &str,
    manager: &AttachmentManager,
) -> kube::Result<usize> {
    let attachments: Api<VolumeAttachment> = Api::all(client.clone());
    let pvs: Api<PersistentVolume> = Api::all(client);

    let list = attachments.list(&ListParams::default()).await?;

    let mut by_volume: HashMap<String, Vec<AttachedNode>> = HashMap::new();
    for va in list {
        if va.spec.attacher != driver_name {
            continue;
        }
        if !va.status.as_ref().map(|s| s.attached).unwrap_or(false) {
            continue;
        }
        let Some(volume_id) = va.spec.source.persistent_volume_name.clone() else {
            continue;
        };
        let attached_at = va
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| SystemTime::from(t.0))
            .unwrap_or_else(SystemTime::now);
        by_volume.entry(volume_id).or_default().push(AttachedNode {
            node_id: va.spec.node_name.clone(),
            attached_at,
        });
    }

    let mut restored = 0;
    for (volume_id, mut nodes) in by_volume {
        nodes.sort_by_key(|n| n.attached_at);
        if nodes.len() > 2 {
            warn!(
                volume_id = %volume_id,
                count = nodes.len(),
                "more than two attachments for one volume; keeping the oldest two"
            );
            nodes.truncate(2);
        }

        let access_mode = lookup_access_mode(&pvs, &volume_id).await;
        let first_attached_at = nodes[0].attached_at;
        // Two live attachments mean a migration was in flight; the older
        // creation timestamp bounds when it started.
        let migration_started_at = (nodes.len() == 2).then_some(first_attached_at);

        manager.restore(
            &volume_id,
            AttachmentState {
                nodes,
                first_attached_at,
                access_mode,
                migration_started_at,
                migration_timeout: if migration_started_at.is_some() {
                    RESTORED_MIGRATION_TIMEOUT
                } else {
                    Duration::ZERO
                },
                migration_failed: false,
            },
        );
        restored += 1;
    }

    info!(restored, driver = driver_name, "attachment state rebuilt");
    Ok(restored)
}

/// Access mode from the PV's declared modes; anything unreadable or
/// unrecognized falls back to RWO (the safe, single-writer default).
async fn lookup_access_mode(pvs: &Api<PersistentVolume>, volume_id: &str) -> AccessMode {
    match pvs.get(volume_id).await {
        Ok(pv) => pv
            .spec
            .and_then(|spec| spec.access_modes)
            .map(|modes| {
                if modes.iter().any(|m| m == "ReadWriteMany") {
                    AccessMode::Rwx
                } else {
                    AccessMode::Rwo
                }
            })
            .unwrap_or(AccessMode::Rwo),
        Err(e) => {
            warn!(volume_id, error = %e, "failed to read PV access modes, assuming RWO");
            AccessMode::Rwo
        }
    }
}
