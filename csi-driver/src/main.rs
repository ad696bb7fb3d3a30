//! NVMe/TCP shelf CSI driver
//!
//! Kubernetes CSI driver that provisions file-backed volumes on a remote
//! storage appliance through its SSH admin shell and mounts them over the
//! Linux NVMe/TCP stack.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use appliance_shell::{ShellClient, SshConfig};
use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use csi_driver::attach::AttachmentManager;
use csi_driver::config::DriverConfig;
use csi_driver::csi::controller_server::ControllerServer;
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::device::DeviceResolver;
use csi_driver::identity::{IdentityService, Lifecycle, Phase};
use csi_driver::k8s::events::{EventPoster, KubeEventPoster, NoopPoster};
use csi_driver::k8s::nodes::{spawn_node_watch, NodeLister, StaticNodeLister};
use csi_driver::k8s::pv::PvAnnotator;
use csi_driver::k8s::rebuild_attachments;
use csi_driver::mount::MountEngine;
use csi_driver::reconciler::Reconciler;
use csi_driver::volume_lock::VolumeLocks;
use csi_driver::{metrics, ControllerService, NodeService};

/// Window for in-flight operations (and the current reconciler sweep) to
/// finish after the stop signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "NVMe/TCP shelf CSI driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "KUBE_NODE_NAME")]
    node_id: Option<String>,

    /// Run in controller mode (enables controller service)
    #[arg(long, default_value = "false")]
    controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, default_value = "true")]
    node: bool,

    /// Driver name
    #[arg(long, default_value = "csi.nvmeshelf.io")]
    driver_name: String,

    /// NQN prefix for every subsystem this driver creates
    #[arg(long, default_value = "nqn.2024-01.io.nvmeshelf")]
    nqn_prefix: String,

    /// Appliance admin-shell host (SSH)
    #[arg(long, env = "APPLIANCE_HOST", default_value = "")]
    appliance_host: String,

    /// Appliance admin-shell SSH port
    #[arg(long, default_value = "22")]
    appliance_port: u16,

    /// Appliance admin-shell user
    #[arg(long, default_value = "admin")]
    appliance_user: String,

    /// Private key for appliance SSH authentication
    #[arg(long)]
    appliance_key: Option<PathBuf>,

    /// Appliance SSH password (prefer key auth)
    #[arg(long, env = "APPLIANCE_PASSWORD", hide_env_values = true)]
    appliance_password: Option<String>,

    /// Pinned appliance host public key, base64
    #[arg(long, env = "APPLIANCE_HOST_KEY")]
    appliance_host_key: Option<String>,

    /// Accept any appliance host key (lab use only)
    #[arg(long, default_value = "false")]
    insecure_skip_host_key: bool,

    /// Appliance data-plane address nodes connect to (defaults to the
    /// admin-shell host)
    #[arg(long, default_value = "")]
    data_addr: String,

    /// Appliance-side directory for backing files
    #[arg(long, default_value = "/storage/csi")]
    base_path: String,

    /// Appliance disk slot of the backing storage pool
    #[arg(long, default_value = "csi-pool")]
    pool: String,

    /// Grace period after detach before the reconciler may clear state
    #[arg(long, default_value = "30")]
    attach_grace_seconds: u64,

    /// Reconciler sweep interval
    #[arg(long, default_value = "300")]
    reconcile_interval_seconds: u64,

    /// Prometheus exporter listen address (disabled when absent)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let node_id = match args.node_id.clone() {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    let cfg = Arc::new(DriverConfig {
        driver_name: args.driver_name.clone(),
        nqn_prefix: args.nqn_prefix.clone(),
        base_path: args.base_path.clone(),
        pool: args.pool.clone(),
        data_addr: if args.data_addr.is_empty() {
            args.appliance_host.clone()
        } else {
            args.data_addr.clone()
        },
        node_id: node_id.clone(),
        attach_grace: Duration::from_secs(args.attach_grace_seconds),
        reconcile_interval: Duration::from_secs(args.reconcile_interval_seconds),
    });
    cfg.validate()?;

    info!(
        driver_name = %cfg.driver_name,
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = %args.controller,
        node_mode = %args.node,
        "Starting NVMe/TCP shelf CSI driver"
    );

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
    }

    let lifecycle = Arc::new(Lifecycle::new());
    let identity = IdentityService::new(cfg.driver_name.clone(), Arc::clone(&lifecycle));

    let mut controller_service = None;
    let mut reconciler_handle = None;
    let mut node_service = None;

    if args.controller {
        if args.appliance_host.is_empty() {
            return Err("--appliance-host is required in controller mode".into());
        }
        let mut ssh = SshConfig::new(args.appliance_host.clone(), args.appliance_user.clone());
        ssh.port = args.appliance_port;
        ssh.private_key = args.appliance_key.clone();
        ssh.password = args.appliance_password.clone();
        ssh.pinned_host_key = args.appliance_host_key.clone();
        ssh.insecure_skip_host_key = args.insecure_skip_host_key;
        let shell = Arc::new(ShellClient::connect(ssh));

        // Kubernetes access is best-effort: without it the controller
        // still serves provisioning, with event posting, annotations and
        // node-loss cleanup disabled (the reconciler fails open).
        let kube_client = match kube::Client::try_default().await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "no Kubernetes API access; running without orchestrator integration");
                None
            }
        };

        let poster: Arc<dyn EventPoster> = match &kube_client {
            Some(client) => Arc::new(KubeEventPoster::new(client.clone(), &cfg.driver_name)),
            None => Arc::new(NoopPoster),
        };
        let attachments = Arc::new(AttachmentManager::new(Arc::clone(&poster)));
        let locks = Arc::new(VolumeLocks::new());
        let annotator = kube_client.clone().map(PvAnnotator::new);

        // State rebuild completes before the reconciler takes its first
        // look at the attachment map.
        if let Some(client) = &kube_client {
            match rebuild_attachments(client.clone(), &cfg.driver_name, &attachments).await {
                Ok(restored) => info!(restored, "attachment state recovered"),
                Err(e) => {
                    error!(error = %e, "attachment state rebuild failed; starting with empty map")
                }
            }
        }

        let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<()>(1);
        let lister: Arc<dyn NodeLister> = match &kube_client {
            Some(client) => {
                let (lister, _watch_task) = spawn_node_watch(client.clone(), trigger_tx);
                lister
            }
            // Never synced: the reconciler skips every sweep.
            None => Arc::new(StaticNodeLister::default()),
        };

        let reconciler = Reconciler::new(
            Arc::clone(&attachments),
            lister,
            Arc::clone(&poster),
            cfg.reconcile_interval,
            cfg.attach_grace,
        );
        reconciler_handle = Some(reconciler.spawn(trigger_rx));

        controller_service = Some(ControllerService::new(
            Arc::clone(&cfg),
            shell,
            attachments,
            locks,
            annotator,
        ));
    }

    if args.node {
        let resolver = Arc::new(DeviceResolver::new(cfg.nqn_prefix.clone()));
        let mounts = Arc::new(MountEngine::new(Arc::clone(&resolver)));
        let locks = Arc::new(VolumeLocks::new());
        node_service = Some(NodeService::new(
            Arc::clone(&cfg),
            resolver,
            mounts,
            locks,
            Arc::new(NoopPoster),
        ));
    }

    let socket_path = args
        .endpoint
        .strip_prefix("unix://")
        .unwrap_or(&args.endpoint)
        .to_string();
    if Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    let incoming = UnixListenerStream::new(listener);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("stop signal received, draining");
            lifecycle.advance(Phase::Draining);
            let _ = shutdown_tx.send(());
        });
    }

    lifecycle.advance(Phase::Serving);
    info!(socket = %socket_path, "CSI services listening");

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller_service.map(ControllerServer::new))
        .add_optional_service(node_service.map(NodeServer::new))
        .serve_with_incoming_shutdown(incoming, async {
            let _ = shutdown_rx.await;
        })
        .await?;

    if let Some(handle) = reconciler_handle {
        if tokio::time::timeout(SHUTDOWN_DRAIN, handle.shutdown())
            .await
            .is_err()
        {
            warn!("reconciler did not stop within the drain window");
        }
    }

    info!("shutdown complete");
    Ok(())
}
