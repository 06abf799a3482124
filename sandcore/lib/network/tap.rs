use sandutils::{run, run_unchecked};

use crate::SandcoreResult;

use super::NetworkAllocator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkAllocator {
    /// Creates `tap_device` and attaches it to the bridge.
    ///
    /// Any device left over with the same name is deleted first, so this is safe to repeat.
    pub async fn create_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        let stale = run_unchecked("ip", ["link", "del", tap_device]).await?;
        if stale.success() {
            tracing::debug!(tap = tap_device, "removed stale tap device");
        }

        run("ip", ["tuntap", "add", "dev", tap_device, "mode", "tap"]).await?;
        run(
            "ip",
            [
                "link",
                "set",
                "dev",
                tap_device,
                "master",
                self.config().get_bridge().as_str(),
                "up",
            ],
        )
        .await?;

        tracing::debug!(tap = tap_device, bridge = %self.config().get_bridge(), "tap device created");
        Ok(())
    }

    /// Deletes `tap_device`. A device that does not exist is not an error.
    pub async fn delete_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        let output = run_unchecked("ip", ["link", "del", tap_device]).await?;
        if output.success() {
            tracing::debug!(tap = tap_device, "tap device deleted");
        } else {
            tracing::debug!(tap = tap_device, stderr = %output.stderr.trim(), "tap device already gone");
        }
        Ok(())
    }
}
