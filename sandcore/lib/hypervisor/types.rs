use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `PUT /boot-source`
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    /// Path to the uncompressed kernel.
    pub kernel_image_path: PathBuf,

    /// Kernel command line.
    pub boot_args: String,
}

/// `PUT /drives/{drive_id}`
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    /// Drive id, also the path segment.
    pub drive_id: String,

    /// Backing file or block device.
    pub path_on_host: PathBuf,

    /// Whether the guest boots from this drive.
    pub is_root_device: bool,

    /// Whether the guest sees the drive read-only.
    pub is_read_only: bool,
}

/// `PUT /network-interfaces/{iface_id}`
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    /// Interface id, also the path segment.
    pub iface_id: String,

    /// MAC address presented to the guest.
    pub guest_mac: String,

    /// Host tap device.
    pub host_dev_name: String,
}

/// `PUT /machine-config`
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,

    /// Memory size in MiB.
    pub mem_size_mib: u32,
}

/// `PUT /vsock`
#[derive(Debug, Clone, Serialize)]
pub struct Vsock {
    /// The guest context id.
    pub guest_cid: u32,

    /// Host-side Unix socket backing the device.
    pub uds_path: PathBuf,
}

/// `PUT /actions`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceAction {
    /// The action, e.g. `InstanceStart`.
    pub action_type: String,
}

/// `PATCH /vm`
#[derive(Debug, Clone, Serialize)]
pub struct VmStateUpdate {
    /// `Paused` or `Resumed`.
    pub state: String,
}

/// `PUT /snapshot/create`
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCreate {
    /// Always `Full`.
    pub snapshot_type: String,

    /// Where the VM state is written.
    pub snapshot_path: PathBuf,

    /// Where guest memory is written.
    pub mem_file_path: PathBuf,
}

/// `PUT /snapshot/load`
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLoad {
    /// The VM state file.
    pub snapshot_path: PathBuf,

    /// Guest memory source.
    pub mem_backend: MemBackend,

    /// Whether dirty-page tracking is enabled after load.
    pub enable_diff_snapshots: bool,

    /// Resume the VM right after loading.
    pub resume_vm: bool,

    /// Tap devices to rebind interfaces to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_overrides: Vec<NetworkOverride>,
}

/// Guest memory backend of a snapshot load.
#[derive(Debug, Clone, Serialize)]
pub struct MemBackend {
    /// The memory file.
    pub backend_path: PathBuf,

    /// Always `File`.
    pub backend_type: String,
}

/// Rebinds a snapshotted interface to a different host tap device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkOverride {
    /// The interface id in the snapshot.
    pub iface_id: String,

    /// The new host device.
    pub host_dev_name: String,
}

/// `GET /`
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    /// `Not started`, `Running` or `Paused`.
    pub state: String,
}

/// The run state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// The VM has not been started, or the control socket is unreachable.
    NotStarted,

    /// vCPUs are running.
    Running,

    /// vCPUs are paused.
    Paused,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<&str> for VmState {
    fn from(state: &str) -> Self {
        match state {
            "Running" => VmState::Running,
            "Paused" => VmState::Paused,
            _ => VmState::NotStarted,
        }
    }
}

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::NotStarted => f.write_str("Not started"),
            VmState::Running => f.write_str("Running"),
            VmState::Paused => f.write_str("Paused"),
        }
    }
}
