//! The host side effects of running a sandbox.
//!
//! Everything the orchestrator does to the host (tap devices, root devices, hypervisor
//! processes, the guest agent) goes through [`SandboxEnvironment`]. [`FirecrackerEnvironment`]
//! performs the real work; [`SimulatedEnvironment`] keeps the same contract in memory so the
//! orchestration can be exercised without KVM or root.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{ExecResult, GuestFile},
    models::{MachineShape, SandboxPaths, SnapshotPaths},
    network::NetworkAllocation,
    SandcoreResult,
};

mod firecracker;
mod inject;
mod simulated;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Which of a VM's sockets are present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketPresence {
    /// The hypervisor control socket.
    pub control: bool,

    /// The host side of the agent vsock.
    pub vsock: bool,
}

/// The host operations a sandbox lifecycle is built from.
#[async_trait]
pub trait SandboxEnvironment: Send + Sync {
    /// Creates a tap device attached to the bridge, replacing any stale one.
    async fn create_tap(&self, tap_device: &str) -> SandcoreResult<()>;

    /// Deletes a tap device. A missing device is not an error.
    async fn delete_tap(&self, tap_device: &str) -> SandcoreResult<()>;

    /// Copies the base image at `base` to the overlay file `overlay`.
    ///
    /// Fails with [`SandcoreError::NoBaseImage`](crate::SandcoreError::NoBaseImage) when the
    /// base image does not exist.
    async fn prepare_overlay(&self, base: &Path, overlay: &Path) -> SandcoreResult<()>;

    /// Removes an overlay file. A missing file is not an error.
    async fn remove_overlay(&self, overlay: &Path) -> SandcoreResult<()>;

    /// Whether the root device of a sandbox exists.
    async fn root_device_exists(&self, paths: &SandboxPaths) -> bool;

    /// Whether both files of a prebuild snapshot exist.
    async fn snapshot_exists(&self, snapshot: &SnapshotPaths) -> bool;

    /// Mounts the root device and writes `files` into it. The device is always unmounted
    /// afterwards.
    async fn write_guest_files(
        &self,
        sandbox_id: &str,
        paths: &SandboxPaths,
        files: &[GuestFile],
    ) -> SandcoreResult<()>;

    /// Starts a hypervisor process for the sandbox and returns its pid.
    async fn launch(&self, paths: &SandboxPaths) -> SandcoreResult<u32>;

    /// Configures kernel, drive, NIC, shape and vsock of a launched VM.
    async fn configure(
        &self,
        paths: &SandboxPaths,
        network: &NetworkAllocation,
        shape: MachineShape,
    ) -> SandcoreResult<()>;

    /// Restores a launched VM from a prebuild snapshot taken on `source`, rebinding its NIC to
    /// the sandbox's own tap device. The VM is resumed.
    async fn restore_snapshot(
        &self,
        paths: &SandboxPaths,
        source: &SandboxPaths,
        snapshot: &SnapshotPaths,
        network: &NetworkAllocation,
    ) -> SandcoreResult<()>;

    /// Boots a configured VM.
    async fn start_vm(&self, paths: &SandboxPaths) -> SandcoreResult<()>;

    /// Whether the VM reports itself running. Never errors.
    async fn is_running(&self, paths: &SandboxPaths) -> bool;

    /// Re-registers the vsock device of a running VM.
    async fn set_vsock(&self, paths: &SandboxPaths) -> SandcoreResult<()>;

    /// Whether the hypervisor process is alive.
    fn is_alive(&self, pid: u32) -> bool;

    /// Terminates the hypervisor process: SIGTERM, a grace period, then SIGKILL.
    async fn kill(&self, pid: u32) -> SandcoreResult<()>;

    /// Removes the control socket, vsock and pid file.
    async fn remove_runtime_files(&self, paths: &SandboxPaths) -> SandcoreResult<()>;

    /// Which sockets exist.
    async fn socket_presence(&self, paths: &SandboxPaths) -> SocketPresence;

    /// The last lines of the hypervisor log.
    async fn log_tail(&self, paths: &SandboxPaths) -> String;

    /// Waits for the guest agent to report healthy. Never errors.
    async fn wait_for_agent(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> bool;

    /// Runs a shell command in the guest.
    async fn guest_exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> SandcoreResult<ExecResult>;

    /// Writes files into a running guest through the agent.
    async fn guest_write_files(&self, sandbox_id: &str, files: &[GuestFile])
        -> SandcoreResult<()>;

    /// Starts a managed guest service.
    async fn start_guest_service(&self, sandbox_id: &str, name: &str) -> SandcoreResult<()>;

    /// Drops the cached agent channel of a sandbox.
    fn drop_agent_channel(&self, sandbox_id: &str);
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use firecracker::*;
pub use simulated::*;
