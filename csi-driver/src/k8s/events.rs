//! Orchestrator event posting.
//!
//! Events are a capability interface with one method per event class, so
//! state-machine components can record outcomes without depending on the
//! Kubernetes client (and without a reference cycle back through the
//! manager). The production implementation resolves the owning PVC from
//! the persistent volume's claimRef lazily, at post time.
//!
//! Posting is always best-effort and fire-and-forget: a lost event must
//! never fail or delay a CSI operation.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use kube::api::Api;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

/// One method per event class the driver emits.
pub trait EventPoster: Send + Sync {
    fn mount_failure(&self, volume_id: &str, message: &str);
    fn stale_mount_detected(&self, volume_id: &str, message: &str);
    fn connection_failure(&self, volume_id: &str, message: &str);
    fn connection_recovery(&self, volume_id: &str);
    fn orphan_detected(&self, volume_id: &str);
    fn orphan_cleaned(&self, volume_id: &str);
    fn migration_started(&self, volume_id: &str, source_node: &str, target_node: &str);
    fn migration_completed(&self, volume_id: &str, remaining_node: &str);
    fn migration_failed(&self, volume_id: &str, message: &str);
    fn stale_attachment_cleared(&self, volume_id: &str, node: &str);
}

/// Poster that drops everything; used in node-only mode and in tests.
#[derive(Default)]
pub struct NoopPoster;

impl EventPoster for NoopPoster {
    fn mount_failure(&self, _: &str, _: &str) {}
    fn stale_mount_detected(&self, _: &str, _: &str) {}
    fn connection_failure(&self, _: &str, _: &str) {}
    fn connection_recovery(&self, _: &str) {}
    fn orphan_detected(&self, _: &str) {}
    fn orphan_cleaned(&self, _: &str) {}
    fn migration_started(&self, _: &str, _: &str, _: &str) {}
    fn migration_completed(&self, _: &str, _: &str) {}
    fn migration_failed(&self, _: &str, _: &str) {}
    fn stale_attachment_cleared(&self, _: &str, _: &str) {}
}

/// Posts events against the PVC owning each volume.
pub struct KubeEventPoster {
    client: kube::Client,
    recorder: Arc<Recorder>,
}

impl KubeEventPoster {
    pub fn new(client: kube::Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Arc::new(Recorder::new(client.clone(), reporter)),
            client,
        }
    }

    fn post(&self, volume_id: &str, type_: EventType, reason: &str, note: String) {
        let client = self.client.clone();
        let recorder = Arc::clone(&self.recorder);
        let volume_id = volume_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            let reference = resolve_claim_reference(&client, &volume_id).await;
            let event = Event {
                type_,
                reason: reason.clone(),
                note: Some(note),
                action: reason.clone(),
                secondary: None,
            };
            if let Err(e) = recorder.publish(&event, &reference).await {
                debug!(volume_id = %volume_id, reason = %reason, error = %e, "event post failed");
            }
        });
    }
}

/// The PVC bound to a persistent volume, falling back to the PV itself
/// when the claimRef is missing or the PV cannot be fetched.
async fn resolve_claim_reference(client: &kube::Client, volume_id: &str) -> ObjectReference {
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    if let Ok(pv) = pvs.get(volume_id).await {
        if let Some(claim) = pv.spec.and_then(|spec| spec.claim_ref) {
            return ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                api_version: Some("v1".to_string()),
                name: claim.name,
                namespace: claim.namespace,
                uid: claim.uid,
                ..Default::default()
            };
        }
    }
    ObjectReference {
        kind: Some("PersistentVolume".to_string()),
        api_version: Some("v1".to_string()),
        name: Some(volume_id.to_string()),
        ..Default::default()
    }
}

impl EventPoster for KubeEventPoster {
    fn mount_failure(&self, volume_id: &str, message: &str) {
        self.post(
            volume_id,
            EventType::Warning,
            "MountFailure",
            message.to_string(),
        );
    }

    fn stale_mount_detected(&self, volume_id: &str, message: &str) {
        self.post(
            volume_id,
            EventType::Warning,
            "StaleMountDetected",
            message.to_string(),
        );
    }

    fn connection_failure(&self, volume_id: &str, message: &str) {
        self.post(
            volume_id,
            EventType::Warning,
            "ConnectionFailure",
            message.to_string(),
        );
    }

    fn connection_recovery(&self, volume_id: &str) {
        self.post(
            volume_id,
            EventType::Normal,
            "ConnectionRecovery",
            format!("connection for volume {volume_id} recovered"),
        );
    }

    fn orphan_detected(&self, volume_id: &str) {
        self.post(
            volume_id,
            EventType::Warning,
            "OrphanDetected",
            format!("subsystem for volume {volume_id} has no namespace device"),
        );
    }

    fn orphan_cleaned(&self, volume_id: &str) {
        self.post(
            volume_id,
            EventType::Normal,
            "OrphanCleaned",
            format!("orphaned subsystem for volume {volume_id} recovered"),
        );
    }

    fn migration_started(&self, volume_id: &str, source_node: &str, target_node: &str) {
        self.post(
            volume_id,
            EventType::Normal,
            "MigrationStarted",
            format!("live migration of {volume_id} from {source_node} to {target_node}"),
        );
    }

    fn migration_completed(&self, volume_id: &str, remaining_node: &str) {
        self.post(
            volume_id,
            EventType::Normal,
            "MigrationCompleted",
            format!("live migration of {volume_id} completed on {remaining_node}"),
        );
    }

    fn migration_failed(&self, volume_id: &str, message: &str) {
        self.post(
            volume_id,
            EventType::Warning,
            "MigrationFailed",
            message.to_string(),
        );
    }

    fn stale_attachment_cleared(&self, volume_id: &str, node: &str) {
        self.post(
            volume_id,
            EventType::Normal,
            "StaleAttachmentCleared",
            format!("cleared attachment of {volume_id} to deleted node {node}"),
        );
    }
}
