use std::path::{Path, PathBuf};

use sandutils::{LOG_SUFFIX, PID_SUFFIX, SOCKET_SUFFIX, VSOCK_SUFFIX};

use crate::config::PathsConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File name of the guest kernel inside the kernel directory.
pub const KERNEL_FILENAME: &str = "vmlinux";

/// File name of the default base root filesystem.
pub const DEFAULT_ROOTFS_FILENAME: &str = "rootfs.ext4";

/// File name of the CPU template that masks AVX.
pub const CPU_TEMPLATE_FILENAME: &str = "cpu-template-no-avx.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Every on-disk location derived from a sandbox id. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    /// The hypervisor control socket.
    pub socket: PathBuf,

    /// The host side of the guest agent vsock channel.
    pub vsock: PathBuf,

    /// The hypervisor pid file.
    pub pid: PathBuf,

    /// The hypervisor log.
    pub log: PathBuf,

    /// The guest kernel image.
    pub kernel: PathBuf,

    /// The default base root filesystem image.
    pub rootfs: PathBuf,

    /// The writable root block device.
    pub root_device: PathBuf,

    /// The CPU template file.
    pub cpu_template: PathBuf,

    /// True when `root_device` is a cloned logical volume, false for a flat overlay file.
    pub uses_volume: bool,
}

/// Locations of a workspace's prebuild VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    /// The VM state file.
    pub snapshot: PathBuf,

    /// The guest memory file.
    pub memory: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxPaths {
    /// Resolves the paths of sandbox `id`. `volume_path` is the cloned logical volume, if any.
    pub fn resolve(config: &PathsConfig, id: &str, volume_path: Option<&Path>) -> Self {
        let socket_dir = config.get_socket_dir();
        let (root_device, uses_volume) = match volume_path {
            Some(volume) => (volume.to_path_buf(), true),
            None => (config.get_overlay_dir().join(format!("{id}.ext4")), false),
        };

        Self {
            socket: socket_dir.join(format!("{id}.{SOCKET_SUFFIX}")),
            vsock: socket_dir.join(format!("{id}.{VSOCK_SUFFIX}")),
            pid: socket_dir.join(format!("{id}.{PID_SUFFIX}")),
            log: config.get_log_dir().join(format!("{id}.{LOG_SUFFIX}")),
            kernel: config.get_kernel_dir().join(KERNEL_FILENAME),
            rootfs: config.get_rootfs_dir().join(DEFAULT_ROOTFS_FILENAME),
            root_device,
            cpu_template: config.get_sandbox_dir().join(CPU_TEMPLATE_FILENAME),
            uses_volume,
        }
    }

    /// The transient files that only exist while a hypervisor process is live.
    pub fn runtime_files(&self) -> [&Path; 3] {
        [&self.socket, &self.vsock, &self.pid]
    }
}

impl SnapshotPaths {
    /// Resolves the prebuild snapshot files of `workspace_id`.
    pub fn prebuild(config: &PathsConfig, workspace_id: &str) -> Self {
        let dir = config.get_sandbox_dir().join("snapshots");
        Self {
            snapshot: dir.join(format!("prebuild-{workspace_id}.snap")),
            memory: dir.join(format!("prebuild-{workspace_id}.mem")),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_overlay_paths() {
        let config = PathsConfig::default();
        let paths = SandboxPaths::resolve(&config, "abc123def456", None);

        assert_eq!(
            paths.socket,
            PathBuf::from("/var/lib/sandbox/sockets/abc123def456.sock")
        );
        assert_eq!(
            paths.vsock,
            PathBuf::from("/var/lib/sandbox/sockets/abc123def456.vsock")
        );
        assert_eq!(
            paths.pid,
            PathBuf::from("/var/lib/sandbox/sockets/abc123def456.pid")
        );
        assert_eq!(paths.log, PathBuf::from("/var/log/sandbox/abc123def456.log"));
        assert_eq!(
            paths.root_device,
            PathBuf::from("/var/lib/sandbox/overlays/abc123def456.ext4")
        );
        assert_eq!(
            paths.kernel,
            PathBuf::from("/var/lib/sandbox/firecracker/kernels/vmlinux")
        );
        assert!(!paths.uses_volume);
    }

    #[test]
    fn test_resolve_volume_paths() {
        let config = PathsConfig::default();
        let volume = Path::new("/dev/sandbox-vg/sandbox-abc");
        let paths = SandboxPaths::resolve(&config, "abc", Some(volume));

        assert!(paths.uses_volume);
        assert_eq!(paths.root_device, volume);
    }

    #[test]
    fn test_prebuild_snapshot_paths() {
        let paths = SnapshotPaths::prebuild(&PathsConfig::default(), "w1");
        assert_eq!(
            paths.snapshot,
            PathBuf::from("/var/lib/sandbox/snapshots/prebuild-w1.snap")
        );
        assert_eq!(
            paths.memory,
            PathBuf::from("/var/lib/sandbox/snapshots/prebuild-w1.mem")
        );
    }
}
