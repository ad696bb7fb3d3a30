//! Persistent volume annotations.
//!
//! Two uses, strictly separated:
//! - `attached-node` / `attached-at` are WRITE-ONLY breadcrumbs for
//!   operators; state recovery never reads them (attachment objects are
//!   the single source of truth). Write failures are logged, never
//!   surfaced to the CSI caller.
//! - `reset-circuit-breaker` is the inbound control for clearing a
//!   volume's circuit breaker.

use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info, warn};

pub const ANN_ATTACHED_NODE: &str = "nvmeshelf.io/attached-node";
pub const ANN_ATTACHED_AT: &str = "nvmeshelf.io/attached-at";
pub const ANN_RESET_BREAKER: &str = "nvmeshelf.io/reset-circuit-breaker";

#[derive(Clone)]
pub struct PvAnnotator {
    pvs: Api<PersistentVolume>,
}

impl PvAnnotator {
    pub fn new(client: kube::Client) -> Self {
        Self {
            pvs: Api::all(client),
        }
    }

    fn patch_annotations(&self, volume_id: &str, annotations: serde_json::Value) {
        let pvs = self.pvs.clone();
        let volume_id = volume_id.to_string();
        tokio::spawn(async move {
            let patch = json!({"metadata": {"annotations": annotations}});
            if let Err(e) = pvs
                .patch(&volume_id, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                debug!(volume_id = %volume_id, error = %e, "PV annotation write failed");
            }
        });
    }

    /// Record the current holder for operator visibility (best-effort).
    pub fn record_attachment(&self, volume_id: &str, node_id: &str) {
        self.patch_annotations(
            volume_id,
            json!({
                ANN_ATTACHED_NODE: node_id,
                ANN_ATTACHED_AT: chrono::Utc::now().to_rfc3339(),
            }),
        );
    }

    /// Clear the attachment breadcrumbs after full detach (best-effort).
    pub fn clear_attachment(&self, volume_id: &str) {
        self.patch_annotations(
            volume_id,
            json!({
                ANN_ATTACHED_NODE: null,
                ANN_ATTACHED_AT: null,
            }),
        );
    }

    /// Whether an operator asked for this volume's circuit breaker to be
    /// reset. Transient read errors count as "no".
    pub async fn reset_requested(&self, volume_id: &str) -> bool {
        match self.pvs.get(volume_id).await {
            Ok(pv) => pv
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANN_RESET_BREAKER))
                .map(|v| v == "true")
                .unwrap_or(false),
            Err(e) => {
                warn!(volume_id, error = %e, "failed to read PV for breaker reset check");
                false
            }
        }
    }

    /// Consume the reset annotation so it acts once.
    pub fn clear_reset_annotation(&self, volume_id: &str) {
        info!(volume_id, "breaker reset annotation consumed");
        self.patch_annotations(volume_id, json!({ ANN_RESET_BREAKER: null }));
    }
}
