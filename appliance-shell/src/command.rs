//! Admin shell command formatting.
//!
//! The appliance is driven through its text shell, so every value that ends
//! up inside a command line passes a strict allow-list first. This is the
//! single defense against command injection through user-controlled
//! identifiers; nothing below this module re-validates.

use crate::error::{Result, ShellError};

/// Maximum slot name length accepted by the appliance disk table.
const MAX_SLOT_LEN: usize = 64;

/// NVMe spec allows NQNs up to 223 characters.
const MAX_NQN_LEN: usize = 223;

/// Backing file paths are bounded well below PATH_MAX to keep command lines
/// printable.
const MAX_PATH_LEN: usize = 512;

/// Parameters for a file-backed, NVMe/TCP-exported disk entry.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    /// Disk-table slot name.
    pub slot: String,
    /// Backing file path on the appliance.
    pub file_path: String,
    /// Backing file size in bytes.
    pub size_bytes: u64,
    /// Subsystem NQN the disk is exported under.
    pub nqn: String,
    /// NVMe/TCP listener port.
    pub port: u16,
}

/// Validate a disk-table slot name: alphanumerics, dash and dot only.
pub fn validate_slot(slot: &str) -> Result<()> {
    if slot.is_empty() {
        return Err(ShellError::InvalidName("slot cannot be empty".into()));
    }
    if slot.len() > MAX_SLOT_LEN {
        return Err(ShellError::InvalidName(format!(
            "slot '{slot}' exceeds maximum length of {MAX_SLOT_LEN} characters"
        )));
    }
    if !slot
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ShellError::InvalidName(format!(
            "invalid characters in slot '{slot}': only alphanumerics, dash and dot allowed"
        )));
    }
    if slot.contains("..") {
        return Err(ShellError::InvalidName(format!(
            "slot '{slot}' contains a traversal sequence"
        )));
    }
    Ok(())
}

/// Validate an NQN: the slot character set plus colon.
pub fn validate_nqn(nqn: &str) -> Result<()> {
    if nqn.is_empty() {
        return Err(ShellError::InvalidName("NQN cannot be empty".into()));
    }
    if nqn.len() > MAX_NQN_LEN {
        return Err(ShellError::InvalidName(format!(
            "NQN '{nqn}' exceeds maximum length of {MAX_NQN_LEN} characters"
        )));
    }
    if !nqn
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
    {
        return Err(ShellError::InvalidName(format!(
            "invalid characters in NQN '{nqn}': only alphanumerics, dash, dot and colon allowed"
        )));
    }
    if nqn.contains("..") {
        return Err(ShellError::InvalidName(format!(
            "NQN '{nqn}' contains a traversal sequence"
        )));
    }
    Ok(())
}

/// Validate an appliance-side backing file path.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ShellError::InvalidName("path cannot be empty".into()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(ShellError::InvalidName(format!(
            "path exceeds maximum length of {MAX_PATH_LEN} characters"
        )));
    }
    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '/')
    {
        return Err(ShellError::InvalidName(
            "invalid characters in path: only alphanumerics, dash, dot, underscore and slash allowed"
                .into(),
        ));
    }
    if path.contains("..") {
        return Err(ShellError::InvalidName(
            "path contains a traversal sequence".into(),
        ));
    }
    Ok(())
}

/// `/disk add` for a fresh network-exported volume.
pub fn add_disk(spec: &DiskSpec) -> Result<String> {
    validate_slot(&spec.slot)?;
    validate_path(&spec.file_path)?;
    validate_nqn(&spec.nqn)?;
    Ok(format!(
        "/disk add type=file file-path={} file-size={} slot={} \
         nvme-tcp-export=yes nvme-tcp-port={} nvme-tcp-nqn={}",
        spec.file_path, spec.size_bytes, spec.slot, spec.port, spec.nqn
    ))
}

/// `/disk add` for a volume pre-populated from an existing slot.
///
/// The appliance performs a full copy of the source backing file; the copy
/// is exported the same way a fresh disk would be.
pub fn add_disk_copy_from(spec: &DiskSpec, source_slot: &str) -> Result<String> {
    validate_slot(&spec.slot)?;
    validate_slot(source_slot)?;
    validate_path(&spec.file_path)?;
    validate_nqn(&spec.nqn)?;
    Ok(format!(
        "/disk add type=file copy-from={} file-path={} file-size={} slot={} \
         nvme-tcp-export=yes nvme-tcp-port={} nvme-tcp-nqn={}",
        source_slot, spec.file_path, spec.size_bytes, spec.slot, spec.port, spec.nqn
    ))
}

/// `/disk add` for a snapshot: full copy of the source, no network export.
pub fn add_snapshot(snap_slot: &str, source_slot: &str, snap_path: &str) -> Result<String> {
    validate_slot(snap_slot)?;
    validate_slot(source_slot)?;
    validate_path(snap_path)?;
    Ok(format!(
        "/disk add type=file copy-from={source_slot} file-path={snap_path} slot={snap_slot}"
    ))
}

/// `/disk remove` by slot.
pub fn remove_disk(slot: &str) -> Result<String> {
    validate_slot(slot)?;
    Ok(format!("/disk remove [find slot=\"{slot}\"]"))
}

/// `/file remove` for a backing file left behind by a disk entry.
pub fn remove_file(path: &str) -> Result<String> {
    validate_path(path)?;
    Ok(format!("/file remove \"{path}\""))
}

/// `/disk print` for all slots carrying a prefix.
pub fn print_disks(prefix: &str) -> Result<String> {
    validate_slot(prefix)?;
    // The slot allow-list leaves dot as the only regex metacharacter.
    let escaped = prefix.replace('.', "\\.");
    Ok(format!(
        "/disk print detail without-paging where slot~\"^{escaped}\""
    ))
}

/// `/disk print` for one exact slot.
pub fn print_disk(slot: &str) -> Result<String> {
    validate_slot(slot)?;
    Ok(format!(
        "/disk print detail without-paging where slot=\"{slot}\""
    ))
}

/// `/disk print` for the backing pool entry, carrying `free-space`.
pub fn print_pool(pool: &str) -> Result<String> {
    validate_slot(pool)?;
    Ok(format!(
        "/disk print detail without-paging where slot=\"{pool}\""
    ))
}

/// `/disk set` to grow a backing file.
pub fn set_disk_size(slot: &str, size_bytes: u64) -> Result<String> {
    validate_slot(slot)?;
    Ok(format!(
        "/disk set [find slot=\"{slot}\"] file-size={size_bytes}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_slot() {
        assert!(validate_slot("pvc-8c7e3a4f-1111-4222-8333-444455556666").is_ok());
        assert!(validate_slot("snap-abc.1-at-1700000000").is_ok());
        assert!(validate_slot("").is_err());
        assert!(validate_slot("pvc x").is_err());
        assert!(validate_slot("pvc;reboot").is_err());
        assert!(validate_slot("pvc$(id)").is_err());
        assert!(validate_slot("a..b").is_err());
        assert!(validate_slot(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_nqn() {
        assert!(validate_nqn("nqn.2024-01.io.nvmeshelf:pvc-1234").is_ok());
        assert!(validate_nqn("").is_err());
        assert!(validate_nqn("nqn.2024-01.io.nvmeshelf:pvc;rm").is_err());
        assert!(validate_nqn(&"n".repeat(224)).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/storage/csi/pvc-1234.img").is_ok());
        assert!(validate_path("/storage/csi/../etc/passwd").is_err());
        assert!(validate_path("/storage/csi/a b").is_err());
        assert!(validate_path("/storage/`id`").is_err());
    }

    #[test]
    fn test_add_disk_format() {
        let spec = DiskSpec {
            slot: "pvc-1234".into(),
            file_path: "/storage/csi/pvc-1234.img".into(),
            size_bytes: 5_368_709_120,
            nqn: "nqn.2024-01.io.nvmeshelf:pvc-1234".into(),
            port: 4420,
        };
        let cmd = add_disk(&spec).unwrap();
        assert!(cmd.starts_with("/disk add type=file"));
        assert!(cmd.contains("file-size=5368709120"));
        assert!(cmd.contains("slot=pvc-1234"));
        assert!(cmd.contains("nvme-tcp-export=yes"));
        assert!(cmd.contains("nvme-tcp-port=4420"));
    }

    #[test]
    fn test_add_disk_rejects_bad_slot() {
        let spec = DiskSpec {
            slot: "pvc-1234; /system reboot".into(),
            file_path: "/storage/csi/pvc-1234.img".into(),
            size_bytes: 1,
            nqn: "nqn.2024-01.io.nvmeshelf:pvc-1234".into(),
            port: 4420,
        };
        assert!(matches!(add_disk(&spec), Err(ShellError::InvalidName(_))));
    }

    #[test]
    fn test_snapshot_has_no_export() {
        let cmd = add_snapshot("snap-1", "pvc-1234", "/storage/csi/snaps/snap-1.img").unwrap();
        assert!(!cmd.contains("nvme-tcp"));
        assert!(cmd.contains("copy-from=pvc-1234"));
    }

    #[test]
    fn test_print_disks_escapes_dots() {
        let cmd = print_disks("snap-ab.cd").unwrap();
        assert!(cmd.contains("slot~\"^snap-ab\\.cd\""));
    }
}
