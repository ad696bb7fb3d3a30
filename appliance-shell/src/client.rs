//! High-level appliance operations.
//!
//! [`ShellClient`] wraps the serial session with a token-bucket rate
//! limiter and the session circuit breaker, and exposes the disk-table
//! operations the driver needs. Every operation is idempotent: creates
//! tolerate an existing identical entry, deletes tolerate absence.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::command::{self, DiskSpec};
use crate::error::{Result, ShellError};
use crate::parser::{self, DiskEntry};
use crate::session::{self, ShellChannel, SshConfig, SshTransport, TransportFactory};

/// Default command rate toward the appliance shell.
const DEFAULT_RATE_PER_SEC: u32 = 10;
const DEFAULT_BURST: u32 = 20;

/// Consecutive failures before the session breaker opens, and for how long.
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

pub struct ShellClient {
    channel: Arc<ShellChannel>,
    limiter: DefaultDirectRateLimiter,
    breaker: CircuitBreaker,
}

impl ShellClient {
    /// Connect to the appliance over SSH. The session is established and
    /// maintained by a background worker; this constructor never blocks.
    pub fn connect(cfg: SshConfig) -> Self {
        let factory: TransportFactory = Box::new(move || {
            SshTransport::connect(&cfg).map(|t| Box::new(t) as Box<dyn session::ShellTransport>)
        });
        Self::with_factory(factory)
    }

    /// Build a client over an arbitrary transport factory. Used by tests to
    /// substitute a scripted appliance.
    pub fn with_factory(factory: TransportFactory) -> Self {
        let rate = NonZeroU32::new(DEFAULT_RATE_PER_SEC).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(DEFAULT_BURST).unwrap_or(NonZeroU32::MIN);
        Self {
            channel: session::spawn_worker(factory),
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
        }
    }

    /// Run one command through breaker, rate limiter and serial session,
    /// classifying shell-reported errors.
    async fn run(&self, cmd: String) -> Result<String> {
        if self.breaker.try_acquire().is_err() {
            return Err(ShellError::BreakerOpen);
        }
        self.limiter.until_ready().await;

        let outcome = match self.channel.exec(cmd).await {
            Ok(output) => parser::check_for_errors(&output).map(|()| output),
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(_) => self.breaker.on_success(),
            Err(e) if e.is_session_failure() => self.breaker.on_failure(),
            // Semantic outcomes prove the session is healthy.
            Err(_) => self.breaker.on_success(),
        }
        outcome
    }

    /// Fetch a single disk-table entry by exact slot.
    pub async fn find_disk(&self, slot: &str) -> Result<Option<DiskEntry>> {
        let output = match self.run(command::print_disk(slot)?).await {
            Ok(out) => out,
            Err(ShellError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(parser::parse_disk_print(&output)?
            .into_iter()
            .find(|e| e.slot == slot))
    }

    /// Append a new file-backed, network-exported disk. Idempotent against
    /// an already-present slot with matching parameters; a slot holding
    /// conflicting parameters is `AlreadyExists`.
    #[instrument(skip(self, spec), fields(slot = %spec.slot))]
    pub async fn create_volume(&self, spec: &DiskSpec) -> Result<DiskEntry> {
        self.create_disk(command::add_disk(spec)?, spec).await
    }

    /// Create a volume pre-populated from a snapshot slot.
    #[instrument(skip(self, spec), fields(slot = %spec.slot, source = %source_slot))]
    pub async fn create_volume_from(
        &self,
        spec: &DiskSpec,
        source_slot: &str,
    ) -> Result<DiskEntry> {
        self.create_disk(command::add_disk_copy_from(spec, source_slot)?, spec)
            .await
    }

    async fn create_disk(&self, cmd: String, spec: &DiskSpec) -> Result<DiskEntry> {
        match self.run(cmd).await {
            Ok(_) => {}
            // Re-read below and compare; an identical entry is success.
            Err(ShellError::AlreadyExists(_)) => {
                debug!(slot = %spec.slot, "slot already present, verifying parameters");
            }
            Err(e) => return Err(e),
        }
        let entry = self
            .find_disk(&spec.slot)
            .await?
            .ok_or_else(|| ShellError::NotFound(format!("slot '{}' missing after add", spec.slot)))?;
        if entry.size_bytes != spec.size_bytes || entry.nqn.as_deref() != Some(spec.nqn.as_str()) {
            return Err(ShellError::AlreadyExists(format!(
                "slot '{}' exists with conflicting parameters",
                spec.slot
            )));
        }
        Ok(entry)
    }

    /// Remove the disk-table entry and its backing file. Succeeds when the
    /// slot is already absent.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, slot: &str) -> Result<()> {
        let Some(entry) = self.find_disk(slot).await? else {
            debug!(slot, "slot already absent");
            return Ok(());
        };
        match self.run(command::remove_disk(slot)?).await {
            Ok(_) | Err(ShellError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        // The remove is supposed to drop the backing file too; sweep it
        // explicitly in case the appliance left it behind.
        if !entry.file_path.is_empty() {
            match self.run(command::remove_file(&entry.file_path)?).await {
                Ok(_) | Err(ShellError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(slot, "volume removed from appliance");
        Ok(())
    }

    /// Create a full independent copy of a source slot with no network
    /// export. Idempotent if the snapshot slot already exists for the same
    /// source backing path.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        snap_slot: &str,
        source_slot: &str,
        snap_path: &str,
    ) -> Result<DiskEntry> {
        if let Some(existing) = self.find_disk(snap_slot).await? {
            if existing.file_path == snap_path {
                debug!(slot = snap_slot, "snapshot already present");
                return Ok(existing);
            }
            return Err(ShellError::AlreadyExists(format!(
                "snapshot slot '{snap_slot}' exists with a different backing path"
            )));
        }
        match self
            .run(command::add_snapshot(snap_slot, source_slot, snap_path)?)
            .await
        {
            Ok(_) | Err(ShellError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.find_disk(snap_slot).await?.ok_or_else(|| {
            ShellError::NotFound(format!("snapshot slot '{snap_slot}' missing after add"))
        })
    }

    /// Remove a snapshot entry and its backing file; succeeds on absence.
    pub async fn delete_snapshot(&self, snap_slot: &str) -> Result<()> {
        self.delete_volume(snap_slot).await
    }

    /// Enumerate disk-table entries whose slot carries a prefix.
    pub async fn list_volumes(&self, prefix: &str) -> Result<Vec<DiskEntry>> {
        let output = match self.run(command::print_disks(prefix)?).await {
            Ok(out) => out,
            Err(ShellError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = parser::parse_disk_print(&output)?;
        entries.retain(|e| e.slot.starts_with(prefix));
        entries.sort_by(|a, b| a.slot.cmp(&b.slot));
        Ok(entries)
    }

    /// Enumerate snapshot entries by slot prefix.
    pub async fn list_snapshots(&self, prefix: &str) -> Result<Vec<DiskEntry>> {
        self.list_volumes(prefix).await
    }

    /// Free bytes on the backing storage pool.
    pub async fn get_capacity(&self, pool: &str) -> Result<u64> {
        let output = self.run(command::print_pool(pool)?).await?;
        parser::parse_disk_print(&output)?
            .into_iter()
            .find(|e| e.slot == pool)
            .and_then(|e| e.free_space)
            .ok_or_else(|| {
                ShellError::Parse(format!("pool '{pool}' reported no free-space field"))
            })
    }

    /// Grow a backing file; returns the size the appliance now reports.
    #[instrument(skip(self))]
    pub async fn expand_volume(&self, slot: &str, new_size_bytes: u64) -> Result<u64> {
        if self.find_disk(slot).await?.is_none() {
            return Err(ShellError::NotFound(format!("slot '{slot}' not found")));
        }
        self.run(command::set_disk_size(slot, new_size_bytes)?)
            .await?;
        let entry = self
            .find_disk(slot)
            .await?
            .ok_or_else(|| ShellError::NotFound(format!("slot '{slot}' vanished during expand")))?;
        if entry.size_bytes < new_size_bytes {
            warn!(
                slot,
                requested = new_size_bytes,
                actual = entry.size_bytes,
                "appliance reports smaller size than requested after expand"
            );
        }
        Ok(entry.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ShellTransport;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Scripted in-memory appliance: a disk table keyed by slot.
    #[derive(Default, Clone)]
    struct FakeAppliance {
        disks: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
        fail_adds: Arc<Mutex<bool>>,
    }

    struct FakeTransport {
        appliance: FakeAppliance,
    }

    impl FakeAppliance {
        fn client(&self) -> ShellClient {
            let appliance = self.clone();
            ShellClient::with_factory(Box::new(move || {
                Ok(Box::new(FakeTransport {
                    appliance: appliance.clone(),
                }) as Box<dyn ShellTransport>)
            }))
        }

        fn render(&self, filter: impl Fn(&str) -> bool) -> String {
            let disks = self.disks.lock();
            let mut out = String::new();
            for (i, (slot, attrs)) in disks.iter().filter(|(s, _)| filter(s)).enumerate() {
                out.push_str(&format!(" {i}    slot=\"{slot}\""));
                for (k, v) in attrs {
                    out.push_str(&format!(" {k}={v}"));
                }
                out.push('\n');
            }
            out
        }
    }

    impl ShellTransport for FakeTransport {
        fn exec(&mut self, command: &str) -> crate::error::Result<String> {
            let kv = crate::parser::parse_kv_line(command);
            if command.starts_with("/disk add") {
                if *self.appliance.fail_adds.lock() {
                    return Ok("failure: no space left on device".into());
                }
                let slot = kv.get("slot").cloned().unwrap_or_default();
                let mut disks = self.appliance.disks.lock();
                if disks.contains_key(&slot) {
                    return Ok("failure: already have disk with such slot".into());
                }
                let mut attrs = BTreeMap::new();
                if let Some(path) = kv.get("file-path") {
                    attrs.insert("file-path".into(), format!("\"{path}\""));
                }
                if let Some(size) = kv.get("file-size") {
                    attrs.insert("file-size".into(), size.clone());
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
            } else if command.starts_with("/disk set") {
                Ok(String::new())
            } else {
                Ok("bad command name".into())
            }
        }
    }

    fn spec(slot: &str) -> DiskSpec {
        DiskSpec {
            slot: slot.into(),
            file_path: format!("/storage/csi/{slot}.img"),
            size_bytes: 1_073_741_824,
            nqn: format!("nqn.2024-01.io.nvmeshelf:{slot}"),
            port: 4420,
        }
    }

    #[tokio::test]
    async fn test_create_list_delete_round_trip() {
        let appliance = FakeAppliance::default();
        let client = appliance.client();

        let entry = client.create_volume(&spec("pvc-a")).await.unwrap();
        assert_eq!(entry.slot, "pvc-a");

        let listed = client.list_volumes("pvc-").await.unwrap();
        assert_eq!(listed.len(), 1);

        client.delete_volume("pvc-a").await.unwrap();
        assert!(client.list_volumes("pvc-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_idempotent() {
        let appliance = FakeAppliance::default();
        let client = appliance.client();

        let first = client.create_volume(&spec("pvc-a")).await.unwrap();
        let second = client.create_volume(&spec("pvc-a")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_volume_conflicting_parameters() {
        let appliance = FakeAppliance::default();
        let client = appliance.client();

        client.create_volume(&spec("pvc-a")).await.unwrap();
        let mut bigger = spec("pvc-a");
        bigger.size_bytes *= 2;
        assert!(matches!(
            client.create_volume(&bigger).await,
            Err(ShellError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_absent_volume_succeeds() {
        let appliance = FakeAppliance::default();
        let client = appliance.client();
        client.delete_volume("pvc-never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_space_classified() {
        let appliance = FakeAppliance::default();
        *appliance.fail_adds.lock() = true;
        let client = appliance.client();
        assert!(matches!(
            client.create_volume(&spec("pvc-a")).await,
            Err(ShellError::OutOfSpace(_))
        ));
    }
}
