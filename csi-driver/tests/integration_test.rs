//! Integration tests for csi-driver
//!
//! These tests drive the controller gRPC surface against a scripted
//! in-memory appliance shell, exercising provisioning idempotency, the
//! RWX live-migration window, reconciler cleanup after node loss, and
//! per-volume circuit-breaker isolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use appliance_shell::{ShellClient, ShellTransport};
use parking_lot::Mutex;
use tonic::Request;

use csi_driver::attach::AttachmentManager;
use csi_driver::config::DriverConfig;
use csi_driver::csi;
use csi_driver::csi::controller_server::Controller;
use csi_driver::k8s::events::EventPoster;
use csi_driver::k8s::nodes::{NodeLister, StaticNodeLister};
use csi_driver::reconciler::Reconciler;
use csi_driver::types::{self, AccessMode};
use csi_driver::volume_lock::VolumeLocks;
use csi_driver::ControllerService;

const NQN_PREFIX: &str = "nqn.2024-01.io.nvmeshelf";

// ============================================================================
// Scripted appliance
// ============================================================================

/// In-memory disk table mimicking the appliance shell's behavior.
#[derive(Default, Clone)]
struct FakeAppliance {
    disks: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
    /// Slots whose `/disk add` is rejected with a shell failure line.
    poisoned_slots: Arc<Mutex<Vec<String>>>,
}

struct FakeTransport {
    appliance: FakeAppliance,
}

impl FakeAppliance {
    fn shell_client(&self) -> Arc<ShellClient> {
        let appliance = self.clone();
        Arc::new(ShellClient::with_factory(Box::new(move || {
            Ok(Box::new(FakeTransport {
                appliance: appliance.clone(),
            }) as Box<dyn ShellTransport>)
        })))
    }

    fn poison_slot(&self, slot: &str) {
        self.poisoned_slots.lock().push(slot.to_string());
    }

    /// Seed the backing-pool entry the capacity query reads.
    fn set_pool_free(&self, pool: &str, free_bytes: u64) {
        let mut attrs = BTreeMap::new();
        attrs.insert("type".into(), "\"partition\"".into());
        attrs.insert("free-space".into(), free_bytes.to_string());
        self.disks.lock().insert(pool.to_string(), attrs);
    }

    fn disk_count(&self) -> usize {
        self.disks.lock().len()
    }

    fn render(&self, filter: impl Fn(&str) -> bool) -> String {
        let disks = self.disks.lock();
        let mut out = String::new();
        for (i, (slot, attrs)) in disks.iter().filter(|(s, _)| filter(s)).enumerate() {
            out.push_str(&format!(" {i}    slot=\"{slot}\""));
            for (key, value) in attrs {
                out.push_str(&format!(" {key}={value}"));
            }
            out.push('\n');
        }
        out
    }
}

impl ShellTransport for FakeTransport {
    fn exec(&mut self, command: &str) -> appliance_shell::Result<String> {
        let kv: HashMap<String, String> = command
            .split_whitespace()
            .filter_map(|tok| {
                let (k, v) = tok.split_once('=')?;
                Some((k.to_string(), v.trim_matches('"').to_string()))
            })
            .collect();

        if command.starts_with("/disk add") {
            let slot = kv.get("slot").cloned().unwrap_or_default();
            if self.appliance.poisoned_slots.lock().contains(&slot) {
                return Ok("failure: syntax error in disk parameters".into());
            }
            let mut disks = self.appliance.disks.lock();
            if disks.contains_key(&slot) {
                return Ok("failure: already have disk with such slot".into());
            }
            if let Some(source) = kv.get("copy-from") {
                if !disks.contains_key(source) {
                    return Ok("failure: no such item".into());
                }
            }
            let mut attrs = BTreeMap::new();
            if let Some(path) = kv.get("file-path") {
                attrs.insert("file-path".into(), format!("\"{path}\""));
            }
            if let Some(size) = kv.get("file-size") {
                attrs.insert("file-size".into(), size.clone());
            } else if let Some(source) = kv.get("copy-from") {
                if let Some(size) = disks.get(source).and_then(|a| a.get("file-size")) {
                    attrs.insert("file-size".into(), size.clone());
                }
            }
            if let Some(nqn) = kv.get("nvme-tcp-nqn") {
                attrs.insert("nvme-tcp-nqn".into(), format!("\"{nqn}\""));
                attrs.insert("nvme-tcp-export".into(), "yes".into());
                attrs.insert(
                    "nvme-tcp-port".into(),
                    kv.get("nvme-tcp-port").cloned().unwrap_or("4420".into()),
                );
            }
            disks.insert(slot, attrs);
            Ok(String::new())
        } else if command.starts_with("/disk remove") {
            let slot = command
                .split("slot=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
                .unwrap_or("");
            self.appliance.disks.lock().remove(slot);
            Ok(String::new())
        } else if command.starts_with("/disk set") {
            let slot = command
                .split("slot=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
                .unwrap_or("")
                .to_string();
            let mut disks = self.appliance.disks.lock();
            if let (Some(attrs), Some(size)) = (disks.get_mut(&slot), kv.get("file-size")) {
                attrs.insert("file-size".into(), size.clone());
            }
            Ok(String::new())
        } else if command.starts_with("/disk print") {
            if let Some(slot) = command
                .split("slot=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
            {
                let slot = slot.to_string();
                Ok(self.appliance.render(|s| s == slot))
            } else if let Some(prefix) = command
                .split("slot~\"^")
                .nth(1)
                .and_then(|s| s.split('"').next())
            {
                let prefix = prefix.replace("\\.", ".");
                Ok(self.appliance.render(|s| s.starts_with(&prefix)))
            } else {
                Ok(self.appliance.render(|_| true))
            }
        } else if command.starts_with("/file remove") {
            Ok(String::new())
        } else {
            Ok("bad command name".into())
        }
    }
}

// ============================================================================
// Recording event poster
// ============================================================================

#[derive(Default)]
struct RecordingPoster {
    events: Mutex<Vec<String>>,
}

impl RecordingPoster {
    fn reasons(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl EventPoster for RecordingPoster {
    fn mount_failure(&self, _: &str, _: &str) {
        self.events.lock().push("MountFailure".into());
    }
    fn stale_mount_detected(&self, _: &str, _: &str) {
        self.events.lock().push("StaleMountDetected".into());
    }
    fn connection_failure(&self, _: &str, _: &str) {
        self.events.lock().push("ConnectionFailure".into());
    }
    fn connection_recovery(&self, _: &str) {
        self.events.lock().push("ConnectionRecovery".into());
    }
    fn orphan_detected(&self, _: &str) {
        self.events.lock().push("OrphanDetected".into());
    }
    fn orphan_cleaned(&self, _: &str) {
        self.events.lock().push("OrphanCleaned".into());
    }
    fn migration_started(&self, _: &str, _: &str, _: &str) {
        self.events.lock().push("MigrationStarted".into());
    }
    fn migration_completed(&self, _: &str, _: &str) {
        self.events.lock().push("MigrationCompleted".into());
    }
    fn migration_failed(&self, _: &str, _: &str) {
        self.events.lock().push("MigrationFailed".into());
    }
    fn stale_attachment_cleared(&self, _: &str, _: &str) {
        self.events.lock().push("StaleAttachmentCleared".into());
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    appliance: FakeAppliance,
    controller: ControllerService,
    attachments: Arc<AttachmentManager>,
    poster: Arc<RecordingPoster>,
}

fn config() -> Arc<DriverConfig> {
    Arc::new(DriverConfig {
        driver_name: "csi.nvmeshelf.io".into(),
        nqn_prefix: NQN_PREFIX.into(),
        base_path: "/storage/csi".into(),
        pool: "csi-pool".into(),
        data_addr: "10.0.0.10".into(),
        node_id: "node-test".into(),
        attach_grace: Duration::ZERO,
        reconcile_interval: Duration::from_secs(300),
    })
}

fn harness() -> Harness {
    let appliance = FakeAppliance::default();
    let poster = Arc::new(RecordingPoster::default());
    let attachments = Arc::new(AttachmentManager::new(
        Arc::clone(&poster) as Arc<dyn EventPoster>
    ));
    let controller = ControllerService::new(
        config(),
        appliance.shell_client(),
        Arc::clone(&attachments),
        Arc::new(VolumeLocks::new()),
        None,
    );
    Harness {
        appliance,
        controller,
        attachments,
        poster,
    }
}

fn mount_rwo_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume {
                fs_type: "ext4".into(),
                mount_flags: vec![],
                volume_mount_group: String::new(),
            },
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

fn block_rwx_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
        }),
    }
}

fn create_volume_request(name: &str, capacity: i64) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: capacity,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![mount_rwo_capability()],
        parameters: HashMap::new(),
        secrets: HashMap::new(),
        volume_content_source: None,
        accessibility_requirements: None,
    }
}

fn publish_request(
    volume_id: &str,
    node_id: &str,
    capability: csi::VolumeCapability,
) -> csi::ControllerPublishVolumeRequest {
    csi::ControllerPublishVolumeRequest {
        volume_id: volume_id.into(),
        node_id: node_id.into(),
        volume_capability: Some(capability),
        readonly: false,
        secrets: HashMap::new(),
        volume_context: HashMap::new(),
    }
}

// ============================================================================
// Scenario: idempotent provisioning
// ============================================================================

#[tokio::test]
async fn test_idempotent_provision() {
    let h = harness();
    let capacity = 5 * 1024 * 1024 * 1024i64;

    let first = h
        .controller
        .create_volume(Request::new(create_volume_request("x", capacity)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    let second = h
        .controller
        .create_volume(Request::new(create_volume_request("x", capacity)))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();

    // Both calls return the same deterministic handle.
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(first.volume_id, types::volume_id_for_name("x"));
    assert_eq!(first.capacity_bytes, capacity);

    // The appliance holds exactly one disk.
    assert_eq!(h.appliance.disk_count(), 1);

    // List returns exactly one entry.
    let listed = h
        .controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 0,
            starting_token: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.entries.len(), 1);

    // The volume context carries the wire identity for the node side.
    assert_eq!(
        first.volume_context.get(types::CTX_NQN).map(String::as_str),
        Some(format!("{NQN_PREFIX}:{}", first.volume_id).as_str())
    );
}

#[tokio::test]
async fn test_create_volume_zero_capacity_rejected() {
    let h = harness();
    let mut req = create_volume_request("zero", 0);
    req.capacity_range = Some(csi::CapacityRange {
        required_bytes: 0,
        limit_bytes: 0,
    });
    let err = h
        .controller
        .create_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_delete_volume_idempotent() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("gone", 1 << 30)))
        .await
        .unwrap();
    let volume_id = types::volume_id_for_name("gone");

    for _ in 0..2 {
        h.controller
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: volume_id.clone(),
                secrets: HashMap::new(),
            }))
            .await
            .unwrap();
    }
    assert_eq!(h.appliance.disk_count(), 0);

    // Create → List → Delete → List: the slot is gone from listings.
    let listed = h
        .controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 0,
            starting_token: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(listed.entries.is_empty());
}

// ============================================================================
// Scenario: RWX live-migration happy path
// ============================================================================

#[tokio::test]
async fn test_rwx_live_migration_happy_path() {
    let h = harness();
    h.controller
        .create_volume(Request::new(csi::CreateVolumeRequest {
            volume_capabilities: vec![block_rwx_capability()],
            ..create_volume_request("migrating-vm-disk", 1 << 30)
        }))
        .await
        .unwrap();
    let v1 = types::volume_id_for_name("migrating-vm-disk");

    // Pre-state: attached to node A only.
    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &v1,
            "node-a",
            block_rwx_capability(),
        )))
        .await
        .unwrap();
    let state = h.attachments.get(&v1).unwrap();
    assert_eq!(state.nodes.len(), 1);
    assert!(!state.is_migrating());

    // Publish to node B: dual-attach window opens.
    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &v1,
            "node-b",
            block_rwx_capability(),
        )))
        .await
        .unwrap();
    let state = h.attachments.get(&v1).unwrap();
    assert_eq!(
        h.attachments.attached_nodes(&v1),
        vec!["node-a".to_string(), "node-b".to_string()]
    );
    assert!(state.is_migrating());
    assert_eq!(state.migration_timeout, Duration::from_secs(300));

    // A third node is over the migration limit.
    let err = h
        .controller
        .controller_publish_volume(Request::new(publish_request(
            &v1,
            "node-c",
            block_rwx_capability(),
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    assert!(err.message().contains("migration limit"));

    // Source node detaches: migration completed.
    h.controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: v1.clone(),
            node_id: "node-a".into(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
    let state = h.attachments.get(&v1).unwrap();
    assert_eq!(h.attachments.attached_nodes(&v1), vec!["node-b".to_string()]);
    assert!(!state.is_migrating());

    let reasons = h.poster.reasons();
    assert!(reasons.contains(&"MigrationStarted".to_string()));
    assert!(reasons.contains(&"MigrationCompleted".to_string()));
}

#[tokio::test]
async fn test_rwo_volume_rejects_second_node() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("rwo-vol", 1 << 30)))
        .await
        .unwrap();
    let volume_id = types::volume_id_for_name("rwo-vol");

    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &volume_id,
            "node-a",
            mount_rwo_capability(),
        )))
        .await
        .unwrap();

    // Idempotent retry for the same node succeeds.
    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &volume_id,
            "node-a",
            mount_rwo_capability(),
        )))
        .await
        .unwrap();

    let err = h
        .controller
        .controller_publish_volume(Request::new(publish_request(
            &volume_id,
            "node-b",
            mount_rwo_capability(),
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);
}

// ============================================================================
// Scenario: stale attachment cleanup after node deletion
// ============================================================================

#[tokio::test]
async fn test_stale_attachment_cleanup_after_node_deletion() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("v2-vol", 1 << 30)))
        .await
        .unwrap();
    let v2 = types::volume_id_for_name("v2-vol");

    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &v2,
            "node-n",
            mount_rwo_capability(),
        )))
        .await
        .unwrap();

    // Node N disappears from the cluster; one sweep clears the attachment.
    let lister = Arc::new(StaticNodeLister::with_nodes(&["node-m"]));
    let reconciler = Reconciler::new(
        Arc::clone(&h.attachments),
        lister as Arc<dyn NodeLister>,
        Arc::clone(&h.poster) as Arc<dyn EventPoster>,
        Duration::from_secs(300),
        Duration::ZERO,
    );
    reconciler.sweep_once();

    assert!(h.attachments.get(&v2).is_none());
    assert!(h.poster.reasons().contains(&"StaleAttachmentCleared".to_string()));

    // A successor publish to another node succeeds.
    h.controller
        .controller_publish_volume(Request::new(publish_request(
            &v2,
            "node-m",
            mount_rwo_capability(),
        )))
        .await
        .unwrap();
    assert_eq!(h.attachments.attached_nodes(&v2), vec!["node-m".to_string()]);
}

// ============================================================================
// Scenario: circuit breaker isolation
// ============================================================================

#[tokio::test]
async fn test_circuit_breaker_isolation() {
    let h = harness();
    let v5 = types::volume_id_for_name("v5");
    h.appliance.poison_slot(&v5);

    // Three consecutive appliance-rejected creations trip the breaker.
    for _ in 0..3 {
        let err = h
            .controller
            .create_volume(Request::new(create_volume_request("v5", 1 << 30)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    // Fourth call fails fast without reaching the appliance.
    let err = h
        .controller
        .create_volume(Request::new(create_volume_request("v5", 1 << 30)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unavailable);
    assert!(err.message().contains("circuit breaker"));

    // A different volume is unaffected.
    h.controller
        .create_volume(Request::new(create_volume_request("v6", 1 << 30)))
        .await
        .unwrap();
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_lifecycle_and_restore() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("source-vol", 1 << 30)))
        .await
        .unwrap();
    let source = types::volume_id_for_name("source-vol");

    let snap = h
        .controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: source.clone(),
            name: "nightly".into(),
            secrets: HashMap::new(),
            parameters: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert!(snap.snapshot_id.starts_with("snap-"));
    assert!(snap.snapshot_id.contains("-at-"));
    assert_eq!(snap.source_volume_id, source);
    assert!(snap.ready_to_use);

    // Retry with the same name returns the same snapshot.
    let again = h
        .controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: source.clone(),
            name: "nightly".into(),
            secrets: HashMap::new(),
            parameters: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert_eq!(snap.snapshot_id, again.snapshot_id);

    // Restore into a new volume.
    let restored = h
        .controller
        .create_volume(Request::new(csi::CreateVolumeRequest {
            volume_content_source: Some(csi::VolumeContentSource {
                r#type: Some(csi::volume_content_source::Type::Snapshot(
                    csi::volume_content_source::SnapshotSource {
                        snapshot_id: snap.snapshot_id.clone(),
                    },
                )),
            }),
            ..create_volume_request("restored-vol", 1 << 30)
        }))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(restored.volume_id, types::volume_id_for_name("restored-vol"));

    // Snapshot persists independently of source volume deletion.
    h.controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: source.clone(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
    let listed = h
        .controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            max_entries: 0,
            starting_token: String::new(),
            source_volume_id: String::new(),
            snapshot_id: String::new(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.entries.len(), 1);

    // Delete is idempotent.
    for _ in 0..2 {
        h.controller
            .delete_snapshot(Request::new(csi::DeleteSnapshotRequest {
                snapshot_id: snap.snapshot_id.clone(),
                secrets: HashMap::new(),
            }))
            .await
            .unwrap();
    }
}

// ============================================================================
// Listing and pagination
// ============================================================================

#[tokio::test]
async fn test_list_volumes_pagination_and_published_nodes() {
    let h = harness();
    for name in ["a", "b", "c", "d", "e"] {
        h.controller
            .create_volume(Request::new(create_volume_request(name, 1 << 30)))
            .await
            .unwrap();
    }
    let volume_id = types::volume_id_for_name("a");
    h.attachments
        .track(&volume_id, "node-a", AccessMode::Rwo)
        .unwrap();

    let mut seen = Vec::new();
    let mut token = String::new();
    loop {
        let page = h
            .controller
            .list_volumes(Request::new(csi::ListVolumesRequest {
                max_entries: 2,
                starting_token: token.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(page.entries.len() <= 2);
        for entry in &page.entries {
            let volume = entry.volume.as_ref().unwrap();
            seen.push(volume.volume_id.clone());
            if volume.volume_id == volume_id {
                assert_eq!(
                    entry.status.as_ref().unwrap().published_node_ids,
                    vec!["node-a".to_string()]
                );
            }
        }
        if page.next_token.is_empty() {
            break;
        }
        token = page.next_token;
    }
    assert_eq!(seen.len(), 5);

    let err = h
        .controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries: 2,
            starting_token: "bogus".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Aborted);
}

#[tokio::test]
async fn test_validate_volume_capabilities() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("validate-me", 1 << 30)))
        .await
        .unwrap();
    let volume_id = types::volume_id_for_name("validate-me");

    // RWO mount confirms.
    let ok = h
        .controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume_id.clone(),
            volume_context: HashMap::new(),
            volume_capabilities: vec![mount_rwo_capability()],
            parameters: HashMap::new(),
            secrets: HashMap::new(),
            mutable_parameters: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(ok.confirmed.is_some());

    // RWX on a filesystem volume is explicitly refused.
    let mut rwx_mount = mount_rwo_capability();
    rwx_mount.access_mode = Some(csi::volume_capability::AccessMode {
        mode: csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
    });
    let refused = h
        .controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume_id.clone(),
            volume_context: HashMap::new(),
            volume_capabilities: vec![rwx_mount],
            parameters: HashMap::new(),
            secrets: HashMap::new(),
            mutable_parameters: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(refused.confirmed.is_none());
    assert!(!refused.message.is_empty());

    // Unknown volume is NotFound.
    let err = h
        .controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "pvc-does-not-exist".into(),
            volume_context: HashMap::new(),
            volume_capabilities: vec![mount_rwo_capability()],
            parameters: HashMap::new(),
            secrets: HashMap::new(),
            mutable_parameters: HashMap::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_get_capacity_reports_pool_free_space() {
    let h = harness();
    h.appliance.set_pool_free("csi-pool", 107_374_182_400);

    let resp = h
        .controller
        .get_capacity(Request::new(csi::GetCapacityRequest {
            volume_capabilities: vec![],
            parameters: HashMap::new(),
            accessible_topology: None,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.available_capacity, 107_374_182_400);
}

#[tokio::test]
async fn test_controller_get_volume_reports_published_nodes() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("inspect", 1 << 30)))
        .await
        .unwrap();
    let volume_id = types::volume_id_for_name("inspect");
    h.attachments
        .track(&volume_id, "node-z", AccessMode::Rwo)
        .unwrap();

    let resp = h
        .controller
        .controller_get_volume(Request::new(csi::ControllerGetVolumeRequest {
            volume_id: volume_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.volume.unwrap().volume_id, volume_id);
    let status = resp.status.unwrap();
    assert_eq!(status.published_node_ids, vec!["node-z".to_string()]);
    assert!(!status.volume_condition.unwrap().abnormal);

    let err = h
        .controller
        .controller_get_volume(Request::new(csi::ControllerGetVolumeRequest {
            volume_id: "pvc-missing".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_list_snapshots_filters_by_source_volume() {
    let h = harness();
    for name in ["left", "right"] {
        h.controller
            .create_volume(Request::new(create_volume_request(name, 1 << 30)))
            .await
            .unwrap();
        h.controller
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: types::volume_id_for_name(name),
                name: format!("snap-of-{name}"),
                secrets: HashMap::new(),
                parameters: HashMap::new(),
            }))
            .await
            .unwrap();
    }

    let left = types::volume_id_for_name("left");
    let filtered = h
        .controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            max_entries: 0,
            starting_token: String::new(),
            source_volume_id: left.clone(),
            snapshot_id: String::new(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(filtered.entries.len(), 1);
    assert_eq!(
        filtered.entries[0].snapshot.as_ref().unwrap().source_volume_id,
        left
    );

    // An unknown exact snapshot id yields an empty page, not an error.
    let none = h
        .controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            max_entries: 0,
            starting_token: String::new(),
            source_volume_id: String::new(),
            snapshot_id: "snap-does-not-exist".into(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(none.entries.is_empty());
}

#[tokio::test]
async fn test_expand_volume_requires_node_expansion() {
    let h = harness();
    h.controller
        .create_volume(Request::new(create_volume_request("grow-me", 1 << 30)))
        .await
        .unwrap();
    let volume_id = types::volume_id_for_name("grow-me");

    let resp = h
        .controller
        .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
            volume_id,
            capacity_range: Some(csi::CapacityRange {
                required_bytes: 2 << 30,
                limit_bytes: 0,
            }),
            secrets: HashMap::new(),
            volume_capability: None,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.capacity_bytes, 2 << 30);
    assert!(resp.node_expansion_required);
}
