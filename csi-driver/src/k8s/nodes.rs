//! Node existence tracking.
//!
//! The reconciler checks node existence against a cached reflector store,
//! never against the API server directly; a slow or flapping API must not
//! translate into attachment cleanup. The watcher side feeds the
//! reconciler's trigger channel on node deletion and on Ready→NotReady
//! transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cached view of the cluster's nodes.
pub trait NodeLister: Send + Sync {
    /// Whether the cache has completed its initial sync. Until then the
    /// reconciler fails open and skips cleanup entirely.
    fn is_synced(&self) -> bool;
    fn contains(&self, node_id: &str) -> bool;
}

/// Reflector-backed lister.
pub struct KubeNodeLister {
    store: Store<Node>,
    synced: Arc<AtomicBool>,
}

impl NodeLister for KubeNodeLister {
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn contains(&self, node_id: &str) -> bool {
        self.store.get(&ObjectRef::new(node_id)).is_some()
    }
}

/// Fixed node set; handy in tests and for dry runs without a cluster.
#[derive(Default)]
pub struct StaticNodeLister {
    synced: AtomicBool,
    nodes: parking_lot::RwLock<std::collections::HashSet<String>>,
}

impl StaticNodeLister {
    pub fn with_nodes(nodes: &[&str]) -> Self {
        let lister = Self::default();
        lister.synced.store(true, Ordering::SeqCst);
        let mut set = lister.nodes.write();
        for node in nodes {
            set.insert((*node).to_string());
        }
        drop(set);
        lister
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.write().remove(node_id);
    }

    pub fn insert(&self, node_id: &str) {
        self.nodes.write().insert(node_id.to_string());
    }
}

impl NodeLister for StaticNodeLister {
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains(node_id)
    }
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Start the node reflector and watcher task.
///
/// `trigger` is the reconciler's depth-1 tickle channel: node deletions and
/// readiness losses send into it non-blocking, coalescing bursts into a
/// single sweep.
pub fn spawn_node_watch(
    client: kube::Client,
    trigger: mpsc::Sender<()>,
) -> (Arc<KubeNodeLister>, JoinHandle<()>) {
    let api: Api<Node> = Api::all(client);
    let (reader, writer) = reflector::store();
    let synced = Arc::new(AtomicBool::new(false));
    let lister = Arc::new(KubeNodeLister {
        store: reader,
        synced: Arc::clone(&synced),
    });

    let handle = tokio::spawn(async move {
        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
        futures::pin_mut!(stream);
        let mut ready_by_node: HashMap<String, bool> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitApply(node)) => {
                    ready_by_node.insert(node.name_any(), node_ready(&node));
                }
                Ok(watcher::Event::InitDone) => {
                    synced.store(true, Ordering::SeqCst);
                    debug!(nodes = ready_by_node.len(), "node cache synced");
                }
                Ok(watcher::Event::Apply(node)) => {
                    let name = node.name_any();
                    let ready = node_ready(&node);
                    let previous = ready_by_node.insert(name.clone(), ready);
                    if previous == Some(true) && !ready {
                        debug!(node = %name, "node lost Ready condition, tickling reconciler");
                        let _ = trigger.try_send(());
                    }
                }
                Ok(watcher::Event::Delete(node)) => {
                    let name = node.name_any();
                    ready_by_node.remove(&name);
                    debug!(node = %name, "node deleted, tickling reconciler");
                    let _ = trigger.try_send(());
                }
                Err(e) => {
                    // The watcher restarts itself; existing cache contents
                    // stay valid while it does.
                    warn!(error = %e, "node watch interrupted");
                }
            }
        }
    });

    (lister, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_ready() {
        assert!(node_ready(&node_with_ready("True")));
        assert!(!node_ready(&node_with_ready("False")));
        assert!(!node_ready(&node_with_ready("Unknown")));
        assert!(!node_ready(&Node::default()));
    }

    #[test]
    fn test_static_lister() {
        let lister = StaticNodeLister::with_nodes(&["node-a", "node-b"]);
        assert!(lister.is_synced());
        assert!(lister.contains("node-a"));
        lister.remove("node-a");
        assert!(!lister.contains("node-a"));
        lister.set_synced(false);
        assert!(!lister.is_synced());
    }
}
