//! NVMe/TCP fabric connections via nvme-cli.
//!
//! Connection tuning is passed on the command line and verified afterwards
//! through sysfs; the kernel is the authority on what actually took effect.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::VolumeParams;

#[derive(Error, Debug)]
pub enum NvmeError {
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },

    #[error("{tool} failed: {message}")]
    CommandFailed { tool: &'static str, message: String },
}

pub struct NvmeFabric {
    nvme_class_root: PathBuf,
}

impl Default for NvmeFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeFabric {
    pub fn new() -> Self {
        Self {
            nvme_class_root: PathBuf::from("/sys/class/nvme"),
        }
    }

    #[cfg(test)]
    fn with_root(nvme_class_root: PathBuf) -> Self {
        Self { nvme_class_root }
    }

    /// Connect to a subsystem over TCP with the volume's reconnection
    /// tuning. Already-connected is success.
    pub fn connect(
        &self,
        addr: &str,
        nqn: &str,
        params: &VolumeParams,
    ) -> Result<(), NvmeError> {
        info!(
            nqn,
            addr,
            port = params.nvme_port,
            ctrl_loss_tmo = params.ctrl_loss_tmo,
            reconnect_delay = params.reconnect_delay,
            keep_alive_tmo = params.keep_alive_tmo,
            "connecting NVMe/TCP subsystem"
        );
        let port = params.nvme_port.to_string();
        let ctrl_loss_tmo = params.ctrl_loss_tmo.to_string();
        let reconnect_delay = params.reconnect_delay.to_string();
        let keep_alive_tmo = params.keep_alive_tmo.to_string();

        let output = Command::new("nvme")
            .args([
                "connect",
                "-t",
                "tcp",
                "-a",
                addr,
                "-s",
                &port,
                "-n",
                nqn,
                "--ctrl-loss-tmo",
                &ctrl_loss_tmo,
                "--reconnect-delay",
                &reconnect_delay,
                "--keep-alive-tmo",
                &keep_alive_tmo,
            ])
            .output()
            .map_err(|source| NvmeError::Spawn {
                tool: "nvme connect",
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already connected") || stderr.contains("Operation already in progress") {
                debug!(nqn, "subsystem already connected");
                return Ok(());
            }
            return Err(NvmeError::CommandFailed {
                tool: "nvme connect",
                message: stderr.to_string(),
            });
        }
        Ok(())
    }

    /// Disconnect a subsystem by NQN. Not-connected is success.
    pub fn disconnect(&self, nqn: &str) -> Result<(), NvmeError> {
        info!(nqn, "disconnecting NVMe/TCP subsystem");
        let output = Command::new("nvme")
            .args(["disconnect", "-n", nqn])
            .output()
            .map_err(|source| NvmeError::Spawn {
                tool: "nvme disconnect",
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("No subsystem") {
                debug!(nqn, "subsystem was not connected");
                return Ok(());
            }
            return Err(NvmeError::CommandFailed {
                tool: "nvme disconnect",
                message: stderr.to_string(),
            });
        }
        Ok(())
    }

    /// Cross-check the controller-loss timeout the kernel actually applied
    /// for a subsystem. A mismatch is logged, not fatal: the connection
    /// works either way, it just will not survive outages as configured.
    pub fn verify_ctrl_loss_tmo(&self, nqn: &str, expected: i32) {
        let Ok(entries) = fs::read_dir(&self.nvme_class_root) else {
            return;
        };
        for entry in entries.flatten() {
            let ctrl = entry.path();
            let Ok(subsys_nqn) = fs::read_to_string(ctrl.join("subsysnqn")) else {
                continue;
            };
            if subsys_nqn.trim() != nqn {
                continue;
            }
            match read_ctrl_loss_tmo(&ctrl) {
                Some(actual) if actual == expected => {
                    debug!(nqn, ctrl_loss_tmo = actual, "kernel tuning verified");
                }
                Some(actual) => {
                    warn!(
                        nqn,
                        expected,
                        actual,
                        controller = %ctrl.display(),
                        "kernel applied a different ctrl_loss_tmo than requested"
                    );
                }
                None => {}
            }
        }
    }
}

fn read_ctrl_loss_tmo(ctrl: &Path) -> Option<i32> {
    fs::read_to_string(ctrl.join("ctrl_loss_tmo"))
        .ok()?
        .trim()
        .parse()
        .ok()
}
