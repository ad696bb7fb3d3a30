//! NQN-to-device resolution over sysfs.
//!
//! The kernel's `/sys/class/nvme-subsystem` tree is the oracle for which
//! NVMe subsystems exist on this host and which block devices they expose.
//! The resolver scans it read-only; mutations happen elsewhere through
//! `nvme connect`/`disconnect` and are verified by a follow-up scan.
//!
//! Subsystems whose NQN does not carry the configured prefix are invisible
//! to every operation here. The prefix is the only marker distinguishing
//! our subsystems from host-system NVMe devices, and touching the latter
//! could disconnect unrelated mounts.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// How long a resolved device path may be served from cache.
const CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ResolveError {
    /// Subsystem directory exists but no namespace block device is exposed.
    /// Transient while the kernel re-handshakes after an appliance restart.
    #[error("subsystem for '{0}' has no namespace device yet")]
    Orphaned(String),

    #[error("no subsystem found for '{0}'")]
    NotFound(String),

    #[error("sysfs scan failed: {0}")]
    Io(#[from] io::Error),
}

/// One NVMe subsystem owned by this driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    /// sysfs directory name, e.g. `nvme-subsys0`.
    pub name: String,
    pub nqn: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    device: PathBuf,
    inserted: Instant,
}

fn namespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nvme\d+n\d+$").expect("namespace regex"))
}

fn controller_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nvme\d+$").expect("controller regex"))
}

fn controller_namespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nvme\d+c\d+n\d+$").expect("controller-namespace regex"))
}

pub struct DeviceResolver {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    nqn_prefix: String,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DeviceResolver {
    pub fn new(nqn_prefix: String) -> Self {
        Self::with_roots(
            nqn_prefix,
            PathBuf::from("/sys/class/nvme-subsystem"),
            PathBuf::from("/dev"),
        )
    }

    /// Resolver over alternate roots; tests fabricate sysfs trees under a
    /// temporary directory.
    pub fn with_roots(nqn_prefix: String, sysfs_root: PathBuf, dev_root: PathBuf) -> Self {
        Self {
            sysfs_root,
            dev_root,
            nqn_prefix,
            cache: RwLock::new(HashMap::new()),
            ttl: CACHE_TTL,
        }
    }

    fn owns(&self, nqn: &str) -> bool {
        nqn.starts_with(&self.nqn_prefix)
    }

    /// Enumerate subsystems carrying our NQN prefix. Foreign subsystems are
    /// silently omitted.
    pub fn list_subsystems(&self) -> io::Result<Vec<Subsystem>> {
        let mut subsystems = Vec::new();
        let entries = match fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            // No NVMe subsystems at all on this host.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(subsystems),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let nqn_path = entry.path().join("subsysnqn");
            let Ok(nqn) = fs::read_to_string(&nqn_path) else {
                continue;
            };
            let nqn = nqn.trim().to_string();
            if !self.owns(&nqn) {
                continue;
            }
            subsystems.push(Subsystem {
                name: entry.file_name().to_string_lossy().to_string(),
                nqn,
            });
        }
        Ok(subsystems)
    }

    /// Map an NQN to its block device path.
    ///
    /// Serves from a TTL cache; a hit is re-validated against `/dev` before
    /// being returned, so controller renumbering never yields a dangling
    /// path for longer than one call.
    pub fn resolve_device_path(&self, nqn: &str) -> Result<PathBuf, ResolveError> {
        if !self.owns(nqn) {
            debug!(nqn, prefix = %self.nqn_prefix, "refusing to resolve foreign NQN");
            return Err(ResolveError::NotFound(nqn.to_string()));
        }

        if let Some(entry) = self.cache.read().get(nqn).cloned() {
            if entry.inserted.elapsed() < self.ttl && device_node_ok(&entry.device) {
                return Ok(entry.device);
            }
        }
        // Expired, invalid or missing: drop the entry and rescan.
        self.cache.write().remove(nqn);

        let device = self.scan(nqn)?;
        self.cache.write().insert(
            nqn.to_string(),
            CacheEntry {
                device: device.clone(),
                inserted: Instant::now(),
            },
        );
        Ok(device)
    }

    /// Drop a cached resolution (used after disconnect).
    pub fn invalidate(&self, nqn: &str) {
        self.cache.write().remove(nqn);
    }

    fn scan(&self, nqn: &str) -> Result<PathBuf, ResolveError> {
        let entries = match fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(nqn.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let subsys_path = entry.path();
            let Ok(subsys_nqn) = fs::read_to_string(subsys_path.join("subsysnqn")) else {
                continue;
            };
            if subsys_nqn.trim() != nqn {
                continue;
            }
            return match self.pick_namespace_device(&subsys_path)? {
                Some(name) => Ok(self.dev_root.join(name)),
                None => {
                    warn!(nqn, subsystem = %subsys_path.display(), "subsystem has no namespace device");
                    Err(ResolveError::Orphaned(nqn.to_string()))
                }
            };
        }
        Err(ResolveError::NotFound(nqn.to_string()))
    }

    /// Choose the namespace device for a subsystem directory. With native
    /// multipath the head device `nvmeXnY` sits directly under the
    /// subsystem; per-path `nvmeXcYnZ` devices under each controller are
    /// the fallback.
    fn pick_namespace_device(&self, subsys_path: &Path) -> Result<Option<String>, ResolveError> {
        let mut plain: Vec<String> = Vec::new();
        let mut per_path: Vec<String> = Vec::new();

        for entry in fs::read_dir(subsys_path)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if namespace_re().is_match(&name) {
                plain.push(name);
            } else if controller_re().is_match(&name) {
                let Ok(children) = fs::read_dir(entry.path()) else {
                    continue;
                };
                for child in children.flatten() {
                    let child_name = child.file_name().to_string_lossy().to_string();
                    if namespace_re().is_match(&child_name) {
                        plain.push(child_name);
                    } else if controller_namespace_re().is_match(&child_name) {
                        per_path.push(child_name);
                    }
                }
            }
        }

        plain.sort();
        per_path.sort();
        Ok(plain.into_iter().next().or_else(|| per_path.into_iter().next()))
    }
}

/// Whether a previously resolved device path still points at a device node.
fn device_node_ok(path: &Path) -> bool {
    fs::metadata(path).map(|m| !m.is_dir()).unwrap_or(false)
}
