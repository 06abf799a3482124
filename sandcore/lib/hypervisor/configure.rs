use crate::{
    models::{MachineShape, SandboxPaths},
    network::NetworkAllocation,
    SandcoreResult,
};

use super::HypervisorClient;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Kernel command line of every sandbox.
pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off quiet loglevel=1 8250.nr_uarts=0 init=/etc/sandbox/sandbox-init.sh";

/// Drive id of the root device.
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Interface id of the guest NIC.
pub const GUEST_IFACE_ID: &str = "eth0";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Configures a freshly launched VM: kernel, root drive, NIC, CPU template, shape and vsock.
///
/// The VM is not started.
pub async fn configure_vm(
    client: &HypervisorClient,
    paths: &SandboxPaths,
    network: &NetworkAllocation,
    shape: MachineShape,
) -> SandcoreResult<()> {
    client.set_boot_source(&paths.kernel, BOOT_ARGS).await?;
    client
        .set_drive(ROOT_DRIVE_ID, &paths.root_device, true, false)
        .await?;
    client
        .set_network_interface(GUEST_IFACE_ID, &network.mac_address, &network.tap_device)
        .await?;

    if !client.set_cpu_config(&paths.cpu_template).await {
        tracing::debug!("booting without cpu template");
    }

    client
        .set_machine_config(shape.vcpus, shape.memory_mb)
        .await?;
    client.set_vsock(&paths.vsock).await?;

    Ok(())
}
