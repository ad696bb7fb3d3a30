//! Prometheus metrics for the CSI driver
//!
//! Covers the volume operation surface, appliance connectivity,
//! attachment/migration state and the background reconciler.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of volume operations by type and outcome
    pub const VOLUME_OPERATIONS_TOTAL: &str = "nvmeshelf_csi_volume_operations_total";
    /// Histogram: Duration of volume operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "nvmeshelf_csi_operation_duration_seconds";
    /// Gauge: Appliance session status (1 = connected, 0 = disconnected)
    pub const APPLIANCE_CONNECTED: &str = "nvmeshelf_csi_appliance_connected";
    /// Gauge: Volumes currently tracked by the attachment manager
    pub const TRACKED_ATTACHMENTS: &str = "nvmeshelf_csi_tracked_attachments";
    /// Gauge: Dual-attach migration windows currently open
    pub const ACTIVE_MIGRATIONS: &str = "nvmeshelf_csi_active_migrations";
    /// Counter: Migrations that exceeded their timeout
    pub const MIGRATION_FAILURES_TOTAL: &str = "nvmeshelf_csi_migration_failures_total";
    /// Counter: Stale mounts detected on nodes
    pub const STALE_MOUNTS_TOTAL: &str = "nvmeshelf_csi_stale_mounts_total";
    /// Counter: Orphaned subsystems observed while waiting for a device
    pub const ORPHANS_TOTAL: &str = "nvmeshelf_csi_orphan_subsystems_total";
    /// Counter: Attachments cleared by the reconciler
    pub const RECONCILER_CLEANUPS_TOTAL: &str = "nvmeshelf_csi_reconciler_cleanups_total";
}

/// Duration buckets spanning this driver's operation spectrum: a cached
/// shell round trip lands in the sub-second range, `nvme connect` plus
/// device wait in the seconds, and full-copy snapshot creation can take
/// minutes.
const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0];

/// Install the Prometheus exporter, serving `/metrics` on `addr`, with
/// the operation-duration histogram bucketed for appliance-backed work.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(names::OPERATION_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record appliance session status
pub fn set_appliance_connected(connected: bool) {
    gauge!(names::APPLIANCE_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub fn set_tracked_attachments(count: usize) {
    gauge!(names::TRACKED_ATTACHMENTS).set(count as f64);
}

pub fn set_active_migrations(count: usize) {
    gauge!(names::ACTIVE_MIGRATIONS).set(count as f64);
}

pub fn inc_migration_failures() {
    counter!(names::MIGRATION_FAILURES_TOTAL).increment(1);
}

pub fn inc_stale_mounts() {
    counter!(names::STALE_MOUNTS_TOTAL).increment(1);
}

pub fn inc_orphans() {
    counter!(names::ORPHANS_TOTAL).increment(1);
}

pub fn inc_reconciler_cleanups() {
    counter!(names::RECONCILER_CLEANUPS_TOTAL).increment(1);
}

/// Measures one volume operation and records its outcome counter and
/// duration histogram on completion.
///
/// Failures are labeled by the stage that broke (`connect`,
/// `device_wait`, `mount`, `shell`, ...) rather than a bare error flag,
/// so a dashboard can tell an appliance outage from a kernel that never
/// surfaced the device.
pub struct VolumeOp {
    operation: &'static str,
    start: Instant,
}

impl VolumeOp {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn ok(self) {
        self.finish("ok");
    }

    pub fn fail(self, stage: &'static str) {
        self.finish(stage);
    }

    fn finish(self, outcome: &'static str) {
        counter!(
            names::VOLUME_OPERATIONS_TOTAL,
            "operation" => self.operation,
            "outcome" => outcome
        )
        .increment(1);
        histogram!(names::OPERATION_DURATION_SECONDS, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}
