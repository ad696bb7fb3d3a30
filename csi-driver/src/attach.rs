//! Attachment tracking.
//!
//! Authoritative in-memory map of volume→node bindings. `RWO` volumes
//! carry exactly one node. `RWX` volumes may carry two, but only while a
//! live VM migration is in flight; the dual-attach window opens with
//! [`AttachmentManager::add_secondary`] and closes when either node
//! detaches.
//!
//! Invariants, enforced at every mutation:
//! - an entry exists ⇒ `1 ≤ |nodes| ≤ 2`
//! - `migration_started_at.is_some()` ⇔ `|nodes| == 2`
//! - access mode `RWO` ⇒ `|nodes| == 1`
//!
//! Detach instants live in a separate map so a successor attachment can
//! consult the grace window after the entry itself is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::k8s::events::EventPoster;
use crate::metrics;
use crate::types::AccessMode;

#[derive(Error, Debug)]
pub enum AttachError {
    #[error(
        "volume '{volume_id}' is attached to node '{other}' and access mode {mode} forbids dual-attach"
    )]
    Conflict {
        volume_id: String,
        other: String,
        mode: AccessMode,
    },

    #[error("migration limit: volume '{0}' is already attached to two nodes")]
    MigrationLimit(String),

    #[error("volume '{0}' is not tracked")]
    NotTracked(String),

    #[error("migration of volume '{volume_id}' already in progress toward node '{target}'")]
    MigrationInProgress { volume_id: String, target: String },

    #[error("migration timeout exceeded — detach source to reset (volume '{0}')")]
    MigrationTimedOut(String),
}

/// One node holding a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedNode {
    pub node_id: String,
    pub attached_at: SystemTime,
}

/// Attachment state of one volume.
#[derive(Debug, Clone)]
pub struct AttachmentState {
    pub nodes: Vec<AttachedNode>,
    pub first_attached_at: SystemTime,
    pub access_mode: AccessMode,
    pub migration_started_at: Option<SystemTime>,
    pub migration_timeout: Duration,
    /// Set by the timeout sweep; blocks further secondary attaches until
    /// the source node detaches.
    pub migration_failed: bool,
}

impl AttachmentState {
    pub fn is_migrating(&self) -> bool {
        self.migration_started_at.is_some()
    }

    pub fn is_migration_timed_out(&self, now: SystemTime) -> bool {
        match self.migration_started_at {
            Some(started) => now
                .duration_since(started)
                .map(|elapsed| elapsed > self.migration_timeout)
                .unwrap_or(false),
            None => false,
        }
    }

    fn holds(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id)
    }
}

pub struct AttachmentManager {
    states: RwLock<HashMap<String, AttachmentState>>,
    detach_times: RwLock<HashMap<String, Instant>>,
    poster: Arc<dyn EventPoster>,
}

impl AttachmentManager {
    pub fn new(poster: Arc<dyn EventPoster>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            detach_times: RwLock::new(HashMap::new()),
            poster,
        }
    }

    /// First attachment of a volume to a node. Idempotent when the pair is
    /// already tracked.
    pub fn track(
        &self,
        volume_id: &str,
        node_id: &str,
        access_mode: AccessMode,
    ) -> Result<(), AttachError> {
        let mut states = self.states.write();
        if let Some(state) = states.get(volume_id) {
            if state.holds(node_id) {
                debug!(volume_id, node_id, "attachment already tracked");
                return Ok(());
            }
            return Err(AttachError::Conflict {
                volume_id: volume_id.to_string(),
                other: state.nodes[0].node_id.clone(),
                mode: state.access_mode,
            });
        }

        let now = SystemTime::now();
        states.insert(
            volume_id.to_string(),
            AttachmentState {
                nodes: vec![AttachedNode {
                    node_id: node_id.to_string(),
                    attached_at: now,
                }],
                first_attached_at: now,
                access_mode,
                migration_started_at: None,
                migration_timeout: Duration::ZERO,
                migration_failed: false,
            },
        );
        // A fresh attachment supersedes any lingering grace window.
        self.detach_times.write().remove(volume_id);
        metrics::set_tracked_attachments(states.len());
        info!(volume_id, node_id, mode = %access_mode, "attachment tracked");
        Ok(())
    }

    /// Open the dual-attach window: append the migration target node to an
    /// RWX volume. Idempotent for a retry with the same target.
    pub fn add_secondary(
        &self,
        volume_id: &str,
        node_id: &str,
        migration_timeout: Duration,
    ) -> Result<(), AttachError> {
        let mut states = self.states.write();
        let state = states
            .get_mut(volume_id)
            .ok_or_else(|| AttachError::NotTracked(volume_id.to_string()))?;

        if !state.access_mode.allows_dual_attach() {
            return Err(AttachError::Conflict {
                volume_id: volume_id.to_string(),
                other: state.nodes[0].node_id.clone(),
                mode: state.access_mode,
            });
        }
        if state.migration_failed {
            return Err(AttachError::MigrationTimedOut(volume_id.to_string()));
        }
        if state.holds(node_id) {
            debug!(volume_id, node_id, "secondary already attached (retry)");
            return Ok(());
        }
        if state.nodes.len() >= 2 {
            return Err(AttachError::MigrationLimit(volume_id.to_string()));
        }

        let source = state.nodes[0].node_id.clone();
        let now = SystemTime::now();
        state.nodes.push(AttachedNode {
            node_id: node_id.to_string(),
            attached_at: now,
        });
        state.migration_started_at = Some(now);
        state.migration_timeout = migration_timeout;
        metrics::set_active_migrations(
            states.values().filter(|s| s.is_migrating()).count(),
        );
        info!(
            volume_id,
            source_node = %source,
            target_node = node_id,
            timeout_secs = migration_timeout.as_secs(),
            "migration dual-attach window opened"
        );
        self.poster.migration_started(volume_id, &source, node_id);
        Ok(())
    }

    /// Remove one node. Returns true when the volume is now fully
    /// detached (entry removed, detach instant recorded). Removing an
    /// untracked volume or node is a no-op.
    pub fn remove_node(&self, volume_id: &str, node_id: &str) -> bool {
        let mut states = self.states.write();
        let Some(state) = states.get_mut(volume_id) else {
            debug!(volume_id, node_id, "remove for untracked volume");
            return false;
        };
        if !state.holds(node_id) {
            debug!(volume_id, node_id, "remove for node not attached");
            return false;
        }

        state.nodes.retain(|n| n.node_id != node_id);
        match state.nodes.len() {
            1 => {
                // Migration fields clear atomically with the shrink back
                // to a single holder.
                if state.migration_started_at.take().is_some() {
                    let remaining = state.nodes[0].node_id.clone();
                    let failed = std::mem::take(&mut state.migration_failed);
                    state.migration_timeout = Duration::ZERO;
                    metrics::set_active_migrations(
                        states.values().filter(|s| s.is_migrating()).count(),
                    );
                    if failed {
                        info!(volume_id, node_id, "failed migration reset by detach");
                    } else {
                        info!(volume_id, remaining_node = %remaining, "migration completed");
                        self.poster.migration_completed(volume_id, &remaining);
                    }
                }
                false
            }
            0 => {
                // Record the detach instant before the entry disappears;
                // the grace window outlives the entry.
                self.detach_times
                    .write()
                    .insert(volume_id.to_string(), Instant::now());
                states.remove(volume_id);
                metrics::set_tracked_attachments(states.len());
                info!(volume_id, node_id, "volume fully detached");
                true
            }
            _ => false,
        }
    }

    /// Drop an attachment entirely (reconciler cleanup path).
    pub fn untrack(&self, volume_id: &str) {
        let mut states = self.states.write();
        if states.remove(volume_id).is_some() {
            self.detach_times
                .write()
                .insert(volume_id.to_string(), Instant::now());
            metrics::set_tracked_attachments(states.len());
        }
    }

    /// Whether the volume detached less than `grace` ago. Consults only
    /// the detach-instant map; the attachment entry is typically gone.
    pub fn is_within_grace_period(&self, volume_id: &str, grace: Duration) -> bool {
        self.detach_times
            .read()
            .get(volume_id)
            .is_some_and(|t| t.elapsed() < grace)
    }

    /// Drop detach markers whose grace window has fully elapsed.
    pub fn purge_expired_detach_markers(&self, grace: Duration) {
        self.detach_times
            .write()
            .retain(|_, t| t.elapsed() < grace);
    }

    /// Mark every timed-out migration failed; returns the affected volume
    /// ids. Already-failed migrations are not reported again.
    pub fn fail_timed_out_migrations(&self) -> Vec<String> {
        let now = SystemTime::now();
        let mut failed = Vec::new();
        let mut states = self.states.write();
        for (volume_id, state) in states.iter_mut() {
            if !state.migration_failed && state.is_migration_timed_out(now) {
                state.migration_failed = true;
                warn!(
                    volume_id,
                    timeout_secs = state.migration_timeout.as_secs(),
                    "migration exceeded its timeout"
                );
                self.poster.migration_failed(
                    volume_id,
                    &format!(
                        "migration did not complete within {}s",
                        state.migration_timeout.as_secs()
                    ),
                );
                metrics::inc_migration_failures();
                failed.push(volume_id.clone());
            }
        }
        failed
    }

    /// Install state rebuilt from orchestrator attachment objects.
    pub fn restore(&self, volume_id: &str, state: AttachmentState) {
        debug_assert!(!state.nodes.is_empty() && state.nodes.len() <= 2);
        let mut states = self.states.write();
        states.insert(volume_id.to_string(), state);
        metrics::set_tracked_attachments(states.len());
    }

    // ---- query helpers -------------------------------------------------

    pub fn is_attached_to_node(&self, volume_id: &str, node_id: &str) -> bool {
        self.states
            .read()
            .get(volume_id)
            .is_some_and(|s| s.holds(node_id))
    }

    pub fn node_count(&self, volume_id: &str) -> usize {
        self.states
            .read()
            .get(volume_id)
            .map_or(0, |s| s.nodes.len())
    }

    pub fn access_mode(&self, volume_id: &str) -> Option<AccessMode> {
        self.states.read().get(volume_id).map(|s| s.access_mode)
    }

    pub fn attached_nodes(&self, volume_id: &str) -> Vec<String> {
        self.states
            .read()
            .get(volume_id)
            .map(|s| s.nodes.iter().map(|n| n.node_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, volume_id: &str) -> Option<AttachmentState> {
        self.states.read().get(volume_id).cloned()
    }

    /// Snapshot of the whole map (reconciler sweeps iterate this; the live
    /// map is never exposed).
    pub fn snapshot(&self) -> Vec<(String, AttachmentState)> {
        self.states
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::events::NoopPoster;

    fn manager() -> AttachmentManager {
        AttachmentManager::new(Arc::new(NoopPoster))
    }

    fn assert_invariants(state: &AttachmentState) {
        assert!(!state.nodes.is_empty() && state.nodes.len() <= 2);
        assert_eq!(state.migration_started_at.is_some(), state.nodes.len() == 2);
        if state.access_mode == AccessMode::Rwo {
            assert_eq!(state.nodes.len(), 1);
        }
    }

    #[test]
    fn test_track_is_idempotent() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        assert_eq!(m.node_count("v1"), 1);
        assert_invariants(&m.get("v1").unwrap());
    }

    #[test]
    fn test_rwo_conflict() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        assert!(matches!(
            m.track("v1", "node-b", AccessMode::Rwo),
            Err(AttachError::Conflict { .. })
        ));
    }

    #[test]
    fn test_rwo_rejects_secondary() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        assert!(matches!(
            m.add_secondary("v1", "node-b", Duration::from_secs(300)),
            Err(AttachError::Conflict { .. })
        ));
    }

    #[test]
    fn test_migration_happy_path() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwx).unwrap();
        m.add_secondary("v1", "node-b", Duration::from_secs(300))
            .unwrap();

        let state = m.get("v1").unwrap();
        assert_invariants(&state);
        assert!(state.is_migrating());
        assert_eq!(state.migration_timeout, Duration::from_secs(300));

        // Source detaches: migration complete, single holder remains.
        assert!(!m.remove_node("v1", "node-a"));
        let state = m.get("v1").unwrap();
        assert_invariants(&state);
        assert!(!state.is_migrating());
        assert_eq!(m.attached_nodes("v1"), vec!["node-b".to_string()]);

        // Target detaches: fully detached, grace window opens.
        assert!(m.remove_node("v1", "node-b"));
        assert!(m.get("v1").is_none());
        assert!(m.is_within_grace_period("v1", Duration::from_secs(30)));
        assert!(!m.is_within_grace_period("v1", Duration::ZERO));
    }

    #[test]
    fn test_secondary_retry_is_idempotent() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwx).unwrap();
        m.add_secondary("v1", "node-b", Duration::from_secs(300))
            .unwrap();
        m.add_secondary("v1", "node-b", Duration::from_secs(300))
            .unwrap();
        assert_eq!(m.node_count("v1"), 2);
    }

    #[test]
    fn test_migration_limit() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwx).unwrap();
        m.add_secondary("v1", "node-b", Duration::from_secs(300))
            .unwrap();
        let err = m
            .add_secondary("v1", "node-c", Duration::from_secs(300))
            .unwrap_err();
        assert!(matches!(err, AttachError::MigrationLimit(_)));
        assert!(err.to_string().contains("migration limit"));
    }

    #[test]
    fn test_secondary_on_untracked_volume() {
        let m = manager();
        assert!(matches!(
            m.add_secondary("v1", "node-b", Duration::from_secs(300)),
            Err(AttachError::NotTracked(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let m = manager();
        assert!(!m.remove_node("v1", "node-a"));
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        assert!(m.remove_node("v1", "node-a"));
        assert!(!m.remove_node("v1", "node-a"));
    }

    #[test]
    fn test_migration_timeout_sweep() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwx).unwrap();
        m.add_secondary("v1", "node-b", Duration::ZERO).unwrap();
        // Zero timeout: instantly expired.
        std::thread::sleep(Duration::from_millis(5));
        let failed = m.fail_timed_out_migrations();
        assert_eq!(failed, vec!["v1".to_string()]);
        // Swept once; not reported again.
        assert!(m.fail_timed_out_migrations().is_empty());

        // Further secondary attaches are refused until the source detaches.
        let err = m
            .add_secondary("v1", "node-c", Duration::from_secs(300))
            .unwrap_err();
        assert!(matches!(err, AttachError::MigrationTimedOut(_)));
        assert!(err.to_string().contains("migration timeout exceeded"));

        // Detaching a node resets the failed-migration record.
        m.remove_node("v1", "node-b");
        assert!(!m.get("v1").unwrap().migration_failed);
    }

    #[test]
    fn test_track_clears_grace_marker() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        m.remove_node("v1", "node-a");
        assert!(m.is_within_grace_period("v1", Duration::from_secs(30)));

        // Successor attachment supersedes the detach marker.
        m.track("v1", "node-b", AccessMode::Rwo).unwrap();
        assert!(!m.is_within_grace_period("v1", Duration::from_secs(30)));
    }

    #[test]
    fn test_purge_expired_detach_markers() {
        let m = manager();
        m.track("v1", "node-a", AccessMode::Rwo).unwrap();
        m.remove_node("v1", "node-a");
        m.purge_expired_detach_markers(Duration::ZERO);
        assert!(!m.is_within_grace_period("v1", Duration::from_secs(30)));
    }

    #[test]
    fn test_untrack_records_detach_marker() {
        let m = manager();
        m.track("v2", "node-n", AccessMode::Rwo).unwrap();
        m.untrack("v2");
        assert!(m.get("v2").is_none());
        assert!(m.is_within_grace_period("v2", Duration::from_secs(30)));
    }
}
