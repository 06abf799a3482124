use crate::{providers::SandboxEventKind, SandcoreResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Destroys a sandbox in any state and releases everything it holds.
    ///
    /// The hypervisor is stopped before the root device is deleted; the remaining teardown
    /// steps then run concurrently. Every step is best-effort; failures are logged and the
    /// remaining steps still run. Fails only when the id is unknown.
    pub async fn destroy(&self, sandbox_id: &str) -> SandcoreResult<()> {
        let sandbox = self.get(sandbox_id).await?;
        let paths = self.paths_of(&sandbox);

        tracing::info!(sandbox_id, status = %sandbox.status, "destroying sandbox");

        // The root device stays open until the hypervisor is gone.
        self.kill_and_clean(sandbox_id, sandbox.runtime.pid, &paths)
            .await;

        let root_device = async {
            let removed = if sandbox.runtime.volume_path.is_some() {
                self.storage().delete_sandbox_volume(sandbox_id).await
            } else {
                self.environment().remove_overlay(&paths.root_device).await
            };
            if let Err(e) = removed {
                tracing::warn!(sandbox_id, error = %e, "failed to delete root device");
            }
        };

        let tap = self.delete_tap_quietly(sandbox_id, &sandbox.runtime.tap_device);
        let routes = self.remove_all_routes(sandbox_id);

        futures::join!(root_device, tap, routes);

        if !sandbox.runtime.ip_address.is_empty() {
            self.network().release(&sandbox.runtime.ip_address);
        }
        self.environment().drop_agent_channel(sandbox_id);

        if let Err(e) = self.store().delete(sandbox_id).await {
            tracing::error!(sandbox_id, error = %e, "failed to delete sandbox record");
        }

        self.emit(SandboxEventKind::Deleted, &sandbox);
        tracing::info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }
}
