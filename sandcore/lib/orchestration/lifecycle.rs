use std::time::Duration;

use crate::{
    models::{Sandbox, SandboxPaths, SandboxStatus, ServiceUrls},
    network::NetworkAllocation,
    providers::SandboxEventKind,
    SandcoreError, SandcoreResult,
};

use super::{sync_files, Orchestrator, AUTOSTART_SERVICES};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Polling interval while waiting for a repaired vsock.
const VSOCK_REPAIR_POLL: Duration = Duration::from_millis(100);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Stops a running sandbox. The root device and the guest address are kept.
    pub async fn stop(&self, sandbox_id: &str) -> SandcoreResult<Sandbox> {
        let mut sandbox = self.get(sandbox_id).await?;
        require_status(&sandbox, "stop", SandboxStatus::Running)?;

        let paths = self.paths_of(&sandbox);
        self.kill_and_clean(sandbox_id, sandbox.runtime.pid, &paths)
            .await;
        self.environment().drop_agent_channel(sandbox_id);
        self.delete_tap_quietly(sandbox_id, &sandbox.runtime.tap_device)
            .await;
        self.remove_all_routes(sandbox_id).await;

        sandbox.status = SandboxStatus::Stopped;
        sandbox.runtime.pid = None;
        let sandbox = self.save(sandbox).await?;

        tracing::info!(sandbox_id, "sandbox stopped");
        self.emit(SandboxEventKind::Updated, &sandbox);
        Ok(sandbox)
    }

    /// Boots a stopped sandbox again from its existing root device.
    pub async fn start(&self, sandbox_id: &str) -> SandcoreResult<Sandbox> {
        let mut sandbox = self.get(sandbox_id).await?;
        require_status(&sandbox, "start", SandboxStatus::Stopped)?;

        let paths = self.paths_of(&sandbox);
        if !self.environment().root_device_exists(&paths).await {
            return Err(SandcoreError::Storage(format!(
                "root device {} of sandbox {sandbox_id} is missing",
                paths.root_device.display()
            )));
        }

        let network = NetworkAllocation {
            ip_address: sandbox.runtime.ip_address.clone(),
            mac_address: sandbox.runtime.mac_address.clone(),
            tap_device: sandbox.runtime.tap_device.clone(),
            gateway: self.config().get_network().gateway().to_string(),
        };
        self.network().mark_allocated(&network.ip_address);

        let mut pid = None;
        let urls = match self.boot_existing(&sandbox, &paths, &network, &mut pid).await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::error!(sandbox_id, error = %e, "restart failed, cleaning up");
                self.kill_and_clean(sandbox_id, pid, &paths).await;
                self.environment().drop_agent_channel(sandbox_id);
                self.delete_tap_quietly(sandbox_id, &network.tap_device)
                    .await;
                self.remove_all_routes(sandbox_id).await;
                self.mark_error(sandbox_id, e.to_string()).await;
                return Err(e);
            }
        };

        sandbox.status = SandboxStatus::Running;
        sandbox.runtime.pid = pid;
        sandbox.runtime.urls = urls;
        sandbox.runtime.error = None;
        let sandbox = self.save(sandbox).await?;

        tracing::info!(sandbox_id, pid = ?sandbox.runtime.pid, "sandbox started");
        self.emit(SandboxEventKind::Updated, &sandbox);
        Ok(sandbox)
    }

    /// Checks that a running sandbox is still alive and repairs a lost vsock.
    ///
    /// A dead hypervisor, or both sockets gone, moves the sandbox to `error`. Sandboxes that are
    /// not running are returned unchanged. Returns `None` for an unknown id.
    pub async fn status(&self, sandbox_id: &str) -> SandcoreResult<Option<Sandbox>> {
        let Some(sandbox) = self.store().get(sandbox_id).await? else {
            return Ok(None);
        };

        if sandbox.status != SandboxStatus::Running {
            return Ok(Some(sandbox));
        }

        let alive = sandbox
            .runtime
            .pid
            .is_some_and(|pid| self.environment().is_alive(pid));
        if !alive {
            return self
                .fail_liveness(sandbox, "hypervisor process is not running".to_string())
                .await;
        }

        let paths = self.paths_of(&sandbox);
        let presence = self.environment().socket_presence(&paths).await;

        if !presence.control && !presence.vsock {
            return self
                .fail_liveness(sandbox, "control and vsock sockets are missing".to_string())
                .await;
        }

        if !presence.vsock {
            tracing::warn!(sandbox_id, "vsock missing, re-registering");
            if let Err(e) = self.repair_vsock(sandbox_id, &paths).await {
                return self
                    .fail_liveness(sandbox, format!("vsock could not be restored: {e}"))
                    .await;
            }
        }

        Ok(Some(sandbox))
    }

    async fn boot_existing(
        &self,
        sandbox: &Sandbox,
        paths: &SandboxPaths,
        network: &NetworkAllocation,
        pid: &mut Option<u32>,
    ) -> SandcoreResult<ServiceUrls> {
        let sandbox_id = sandbox.id.as_str();

        self.environment().create_tap(&network.tap_device).await?;

        let launched = self.environment().launch(paths).await?;
        *pid = Some(launched);

        self.environment()
            .configure(paths, network, self.shape_of(sandbox))
            .await?;
        self.environment().start_vm(paths).await?;
        self.wait_for_boot(paths, launched).await?;

        if self.wait_for_agent(sandbox_id).await {
            self.resync_guest(sandbox).await;
        } else if self.config().get_require_agent() {
            return Err(SandcoreError::AgentUnavailable(sandbox_id.to_string()));
        } else {
            tracing::warn!(sandbox_id, "guest agent not ready after restart");
        }

        let urls = self
            .routes()
            .register_routes(sandbox_id, &network.ip_address, self.config().get_services())
            .await?;
        self.routes()
            .register_ssh_route(sandbox_id, &network.ip_address)
            .await?;

        Ok(urls)
    }

    /// Pushes current secrets and config files and starts the guest services. Best-effort.
    async fn resync_guest(&self, sandbox: &Sandbox) {
        let sandbox_id = sandbox.id.as_str();

        let workspace = match &sandbox.workspace_id {
            Some(id) => self.workspaces().workspace(id).await.ok().flatten(),
            None => None,
        };

        match self.workspaces().provisioning(workspace.as_ref()).await {
            Ok(provisioning) => {
                let files = sync_files(&provisioning);
                if !files.is_empty() {
                    if let Err(e) = self.environment().guest_write_files(sandbox_id, &files).await
                    {
                        tracing::warn!(sandbox_id, error = %e, "failed to push guest configuration");
                    }
                }
            }
            Err(e) => tracing::warn!(sandbox_id, error = %e, "failed to load provisioning"),
        }

        for service in AUTOSTART_SERVICES {
            if let Err(e) = self
                .environment()
                .start_guest_service(sandbox_id, service)
                .await
            {
                tracing::warn!(sandbox_id, service, error = %e, "failed to start guest service");
            }
        }
    }

    async fn repair_vsock(&self, sandbox_id: &str, paths: &SandboxPaths) -> SandcoreResult<()> {
        self.environment().drop_agent_channel(sandbox_id);
        self.environment().set_vsock(paths).await?;

        let timeout_ms = self.config().get_timeouts().get_vsock_repair_ms();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.environment().socket_presence(paths).await.vsock {
                tracing::info!(sandbox_id, "vsock restored");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandcoreError::custom(anyhow::anyhow!(
                    "vsock did not reappear within {timeout_ms}ms"
                )));
            }

            tokio::time::sleep(VSOCK_REPAIR_POLL).await;
        }
    }

    async fn fail_liveness(
        &self,
        mut sandbox: Sandbox,
        reason: String,
    ) -> SandcoreResult<Option<Sandbox>> {
        tracing::warn!(sandbox_id = %sandbox.id, reason = %reason, "liveness check failed");

        sandbox.status = SandboxStatus::Error;
        sandbox.runtime.error = Some(reason);
        let updated = self.store().update(&sandbox).await?;
        if let Some(updated) = &updated {
            self.emit(SandboxEventKind::Updated, updated);
        }
        Ok(updated)
    }

    async fn save(&self, sandbox: Sandbox) -> SandcoreResult<Sandbox> {
        self.store()
            .update(&sandbox)
            .await?
            .ok_or(SandcoreError::SandboxNotFound(sandbox.id))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn require_status(
    sandbox: &Sandbox,
    action: &'static str,
    expected: SandboxStatus,
) -> SandcoreResult<()> {
    if sandbox.status != expected {
        return Err(SandcoreError::InvalidState {
            id: sandbox.id.clone(),
            action,
            status: sandbox.status,
            expected,
        });
    }
    Ok(())
}
