//! NVMe/TCP shelf CSI driver library.
//!
//! Kubernetes CSI driver that provisions file-backed block volumes on a
//! remote storage appliance (managed through its SSH admin shell) and
//! mounts them on nodes through the Linux NVMe/TCP kernel stack.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Attachment tracking with live-migration dual-attach support
//! - A reconciler that clears attachments left behind by deleted nodes
//! - NQN-to-device resolution over sysfs and stale-mount recovery

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod attach;
pub mod config;
pub mod controller;
pub mod device;
pub mod identity;
pub mod k8s;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod nvme;
pub mod reconciler;
pub mod types;
pub mod volume_lock;

pub use attach::AttachmentManager;
pub use config::DriverConfig;
pub use controller::ControllerService;
pub use device::DeviceResolver;
pub use identity::IdentityService;
pub use node::NodeService;
pub use reconciler::Reconciler;
pub use volume_lock::VolumeLocks;
