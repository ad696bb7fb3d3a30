//! Mount table parsing, stale-mount detection and recovery.
//!
//! `/proc/self/mountinfo` is the oracle for what is mounted where. A
//! staging mount is stale when the kernel renumbered the controller under
//! it (typically after an appliance restart): the mount still points at the
//! old device node while the volume's NQN now resolves elsewhere. Recovery
//! unmounts and remounts the freshly resolved device at the same path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{DeviceResolver, ResolveError};

/// Unmount retry schedule: 1s, 2s, 4s, at most this many attempts.
const UNMOUNT_ATTEMPTS: u32 = 3;

/// Wait before escalating a busy unmount to a lazy unmount.
const LAZY_UNMOUNT_GRACE: Duration = Duration::from_secs(10);

/// More mount records than this for one target is a kernel or
/// reconciliation pathology that must not be papered over.
const MOUNT_STORM_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mountpoint '{0}' is in use")]
    InUse(String),

    #[error("mountpoint '{0}' is busy")]
    Busy(String),

    #[error("mount storm: {count} mount records for '{target}'")]
    Storm { target: String, count: usize },

    #[error("{tool} failed: {message}")]
    CommandFailed { tool: &'static str, message: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("mount table read failed: {0}")]
    Io(#[from] io::Error),
}

/// One mount table row, reduced to the fields the driver cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_point: String,
    pub source: String,
    pub fstype: String,
    pub options: String,
}

/// Outcome of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh { device: PathBuf },
    Stale(StaleReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Nothing mounted at the staging path.
    NotMounted,
    /// The mounted source device node no longer exists.
    DeviceMissing { mounted: String },
    /// The NQN now resolves to a different device than the one mounted.
    DeviceChanged { mounted: String, resolved: PathBuf },
    /// The NQN no longer resolves at all (orphaned or disconnected).
    Unresolvable { mounted: String },
}

/// Decode the octal escapes mountinfo uses for whitespace in paths.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Parse `/proc/self/mountinfo` content.
///
/// Row shape: `id parent maj:min root mountpoint opts [optional...] -
/// fstype source superopts`. Rows that do not fit are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountRecord> {
    let mut records = Vec::new();
    for line in content.lines() {
        let Some((left, right)) = line.split_once(" - ") else {
            continue;
        };
        let left_fields: Vec<&str> = left.split_whitespace().collect();
        let right_fields: Vec<&str> = right.split_whitespace().collect();
        if left_fields.len() < 6 || right_fields.len() < 2 {
            continue;
        }
        records.push(MountRecord {
            mount_point: unescape(left_fields[4]),
            source: unescape(right_fields[1]),
            fstype: right_fields[0].to_string(),
            options: left_fields[5].to_string(),
        });
    }
    records
}

pub struct MountEngine {
    mountinfo_path: PathBuf,
    proc_root: PathBuf,
    resolver: Arc<DeviceResolver>,
}

impl MountEngine {
    pub fn new(resolver: Arc<DeviceResolver>) -> Self {
        Self::with_roots(
            resolver,
            PathBuf::from("/proc/self/mountinfo"),
            PathBuf::from("/proc"),
        )
    }

    /// Engine over alternate proc paths; tests fabricate mount tables.
    pub fn with_roots(resolver: Arc<DeviceResolver>, mountinfo_path: PathBuf, proc_root: PathBuf) -> Self {
        Self {
            mountinfo_path,
            proc_root,
            resolver,
        }
    }

    fn mount_table(&self) -> io::Result<Vec<MountRecord>> {
        Ok(parse_mountinfo(&fs::read_to_string(&self.mountinfo_path)?))
    }

    /// The record currently mounted at `target` (topmost wins).
    pub fn find_mount(&self, target: &str) -> io::Result<Option<MountRecord>> {
        Ok(self
            .mount_table()?
            .into_iter()
            .filter(|r| r.mount_point == target)
            .next_back())
    }

    /// Refuse further mount operations for a target drowning in records.
    pub fn storm_guard(&self, target: &str) -> Result<(), MountError> {
        let count = self
            .mount_table()?
            .iter()
            .filter(|r| r.mount_point == target || r.source == target)
            .count();
        if count > MOUNT_STORM_LIMIT {
            return Err(MountError::Storm {
                target: target.to_string(),
                count,
            });
        }
        Ok(())
    }

    /// Evaluate the three stale conditions for a staging mount.
    pub fn check_staleness(&self, staging: &str, nqn: &str) -> Result<Staleness, MountError> {
        let Some(record) = self.find_mount(staging)? else {
            return Ok(Staleness::Stale(StaleReason::NotMounted));
        };
        if !Path::new(&record.source).exists() {
            return Ok(Staleness::Stale(StaleReason::DeviceMissing {
                mounted: record.source,
            }));
        }
        match self.resolver.resolve_device_path(nqn) {
            Ok(resolved) if resolved == Path::new(&record.source) => {
                Ok(Staleness::Fresh { device: resolved })
            }
            Ok(resolved) => Ok(Staleness::Stale(StaleReason::DeviceChanged {
                mounted: record.source,
                resolved,
            })),
            Err(ResolveError::Orphaned(_)) | Err(ResolveError::NotFound(_)) => {
                Ok(Staleness::Stale(StaleReason::Unresolvable {
                    mounted: record.source,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether anything is actively using the mountpoint: a mount below it,
    /// or a process with an open file, cwd or root under it.
    pub fn is_in_use(&self, path: &str) -> io::Result<bool> {
        let child_prefix = format!("{}/", path.trim_end_matches('/'));
        if self
            .mount_table()?
            .iter()
            .any(|r| r.mount_point.starts_with(&child_prefix))
        {
            return Ok(true);
        }

        for entry in fs::read_dir(&self.proc_root)?.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let pid_dir = entry.path();
            for link in ["cwd", "root"] {
                if link_points_into(&pid_dir.join(link), path) {
                    return Ok(true);
                }
            }
            if let Ok(fds) = fs::read_dir(pid_dir.join("fd")) {
                for fd in fds.flatten() {
                    if link_points_into(&fd.path(), path) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Unmount a path. Absence of a mount is success; EBUSY surfaces as
    /// [`MountError::Busy`] so the caller can decide about escalation.
    pub fn unmount(&self, target: &str, lazy: bool) -> Result<(), MountError> {
        let mut cmd = Command::new("umount");
        if lazy {
            cmd.arg("-l");
        }
        let output = cmd.arg(target).output().map_err(MountError::Io)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            debug!(target, "path was not mounted");
            return Ok(());
        }
        if stderr.contains("busy") {
            return Err(MountError::Busy(target.to_string()));
        }
        Err(MountError::CommandFailed {
            tool: "umount",
            message: stderr,
        })
    }

    /// Mount a device with explicit options.
    pub fn mount(
        &self,
        device: &Path,
        target: &str,
        fstype: &str,
        options: &str,
    ) -> Result<(), MountError> {
        fs::create_dir_all(target).map_err(MountError::Io)?;
        let mut cmd = Command::new("mount");
        cmd.args(["-t", fstype]);
        if !options.is_empty() {
            cmd.args(["-o", options]);
        }
        let output = cmd
            .arg(device)
            .arg(target)
            .output()
            .map_err(MountError::Io)?;
        if !output.status.success() {
            return Err(MountError::CommandFailed {
                tool: "mount",
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Bind a staged path (or block device node) to a publish target.
    pub fn bind_mount(&self, source: &str, target: &str) -> Result<(), MountError> {
        let output = Command::new("mount")
            .args(["--bind", source, target])
            .output()
            .map_err(MountError::Io)?;
        if !output.status.success() {
            return Err(MountError::CommandFailed {
                tool: "mount",
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Recover a stale staging mount: unmount the dead device, re-resolve
    /// the NQN, remount at the same path with the original options.
    ///
    /// Never lazy-unmounts an in-use mount; that path aborts with
    /// [`MountError::InUse`] and the caller surfaces a precondition
    /// failure rather than risking data loss.
    pub async fn recover(
        &self,
        staging: &str,
        nqn: &str,
        fstype: &str,
        options: &str,
    ) -> Result<PathBuf, MountError> {
        self.storm_guard(staging)?;

        info!(staging, nqn, "recovering stale mount");
        if self.find_mount(staging)?.is_some() {
            self.unmount_with_backoff(staging).await?;
        }

        let device = self.wait_for_resolution(nqn).await?;
        self.mount(&device, staging, fstype, options)?;
        info!(staging, device = %device.display(), "stale mount recovered");
        Ok(device)
    }

    async fn unmount_with_backoff(&self, staging: &str) -> Result<(), MountError> {
        let mut schedule = retry_schedule();
        for attempt in 1..=UNMOUNT_ATTEMPTS {
            match self.unmount(staging, false) {
                Ok(()) => return Ok(()),
                Err(MountError::Busy(_)) => {
                    if self.is_in_use(staging)? {
                        warn!(staging, "mountpoint in use, refusing lazy unmount");
                        return Err(MountError::InUse(staging.to_string()));
                    }
                    // Busy but nothing holds it: give stragglers a grace
                    // window, re-check, then detach lazily.
                    tokio::time::sleep(LAZY_UNMOUNT_GRACE).await;
                    if self.is_in_use(staging)? {
                        return Err(MountError::InUse(staging.to_string()));
                    }
                    warn!(staging, "escalating to lazy unmount");
                    return self.unmount(staging, true);
                }
                Err(e) if attempt == UNMOUNT_ATTEMPTS => return Err(e),
                Err(e) => {
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(4));
                    warn!(staging, attempt, error = %e, retry_in = ?delay, "unmount failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("unmount loop returns within {UNMOUNT_ATTEMPTS} attempts")
    }

    async fn wait_for_resolution(&self, nqn: &str) -> Result<PathBuf, MountError> {
        let mut schedule = retry_schedule();
        for attempt in 1..=UNMOUNT_ATTEMPTS {
            match self.resolver.resolve_device_path(nqn) {
                Ok(device) => return Ok(device),
                // Orphans are transient while the kernel re-handshakes.
                Err(ResolveError::Orphaned(_)) if attempt < UNMOUNT_ATTEMPTS => {
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(4));
                    debug!(nqn, attempt, retry_in = ?delay, "subsystem orphaned, waiting");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("resolution loop returns within {UNMOUNT_ATTEMPTS} attempts")
    }
}

fn retry_schedule() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

fn link_points_into(link: &Path, base: &str) -> bool {
    let Ok(target) = fs::read_link(link) else {
        return false;
    };
    let base = base.trim_end_matches('/');
    target == Path::new(base)
        || target
            .to_string_lossy()
            .starts_with(&format!("{base}/"))
}
