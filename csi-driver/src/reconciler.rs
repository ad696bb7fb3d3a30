//! Attachment reconciliation.
//!
//! A long-lived background task that clears attachments whose node no
//! longer exists, so volumes stranded by node loss become attachable
//! again. Sweeps run on a timer and on tickles from the node watcher;
//! the tickle channel has depth 1, coalescing event bursts.
//!
//! Cleanup is deliberately conservative: an unsynced node cache skips the
//! sweep entirely (a transient API problem must never look like mass node
//! deletion), and recently detached volumes get a grace window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attach::AttachmentManager;
use crate::k8s::events::EventPoster;
use crate::k8s::nodes::NodeLister;
use crate::metrics;

pub struct Reconciler {
    attachments: Arc<AttachmentManager>,
    nodes: Arc<dyn NodeLister>,
    poster: Arc<dyn EventPoster>,
    interval: Duration,
    grace: Duration,
}

/// Shutdown control for the running sweep loop.
pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal stop and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reconciler task join failed");
        }
    }
}

impl Reconciler {
    pub fn new(
        attachments: Arc<AttachmentManager>,
        nodes: Arc<dyn NodeLister>,
        poster: Arc<dyn EventPoster>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            attachments,
            nodes,
            poster,
            interval,
            grace,
        }
    }

    /// Start the sweep loop. Call only after attachment state has been
    /// rebuilt; the first timer tick fires one interval out, and tickles
    /// on `trigger_rx` (fed by the node watcher) can arrive any time
    /// after this returns.
    pub fn spawn(self, mut trigger_rx: mpsc::Receiver<()>) -> ReconcilerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval is immediate; consume it
            // so sweeps start one interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("timer sweep");
                        self.sweep_once();
                    }
                    Some(()) = trigger_rx.recv() => {
                        debug!("event-driven sweep");
                        self.sweep_once();
                    }
                    changed = stop_rx.changed() => {
                        // A dropped stop handle counts as a stop signal.
                        if changed.is_err() || *stop_rx.borrow() {
                            info!("reconciler stopping");
                            break;
                        }
                    }
                }
            }
        });

        ReconcilerHandle {
            stop: stop_tx,
            task,
        }
    }

    /// One sweep: fail timed-out migrations, expire detach markers, then
    /// clear attachments held by nodes missing from the cache.
    pub fn sweep_once(&self) {
        self.attachments.fail_timed_out_migrations();
        self.attachments.purge_expired_detach_markers(self.grace);

        if !self.nodes.is_synced() {
            // Fail open: no cleanup decisions on an unsynced cache.
            warn!("node cache not synced, skipping attachment sweep");
            return;
        }

        for (volume_id, state) in self.attachments.snapshot() {
            for node in &state.nodes {
                if self.nodes.contains(&node.node_id) {
                    continue;
                }
                if self
                    .attachments
                    .is_within_grace_period(&volume_id, self.grace)
                {
                    debug!(
                        volume_id = %volume_id,
                        node = %node.node_id,
                        "node gone but volume within detach grace, deferring"
                    );
                    continue;
                }
                info!(
                    volume_id = %volume_id,
                    node = %node.node_id,
                    "clearing attachment to missing node"
                );
                self.attachments.remove_node(&volume_id, &node.node_id);
                self.poster
                    .stale_attachment_cleared(&volume_id, &node.node_id);
                metrics::inc_reconciler_cleanups();
            }
        }
    }
}
