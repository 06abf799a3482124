use std::{path::Path, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::SandcoreConfig,
    environment::SandboxEnvironment,
    models::{MachineShape, Sandbox, SandboxPaths, SandboxStatus},
    network::NetworkAllocator,
    providers::{
        DirectRoutes, EventSink, MemorySandboxStore, NoVolumes, RouteProvider, SandboxEvent,
        SandboxEventKind, SandboxStore, StaticWorkspaces, StorageProvider, TracingEventSink,
        WorkspaceProvider,
    },
    queue::{SpawnHandler, SpawnQueue},
    SandcoreError, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Provisions sandboxes and drives them through their lifecycle.
///
/// The orchestrator owns no mutable state of its own. Addresses live in the
/// [`NetworkAllocator`], records in the [`SandboxStore`] and host resources behind the
/// [`SandboxEnvironment`], all shared through `Arc`s, so one instance is safely used from many
/// tasks at once.
#[derive(TypedBuilder)]
pub struct Orchestrator {
    /// The sandcore configuration.
    config: SandcoreConfig,

    /// Where host side effects happen.
    environment: Arc<dyn SandboxEnvironment>,

    /// Guest address allocation.
    network: Arc<NetworkAllocator>,

    /// Sandbox records.
    #[builder(default = Arc::new(MemorySandboxStore::new()) as Arc<dyn SandboxStore>)]
    store: Arc<dyn SandboxStore>,

    /// Volume storage.
    #[builder(default = Arc::new(NoVolumes) as Arc<dyn StorageProvider>)]
    storage: Arc<dyn StorageProvider>,

    /// Public routes to guest services.
    #[builder(default = Arc::new(DirectRoutes) as Arc<dyn RouteProvider>)]
    routes: Arc<dyn RouteProvider>,

    /// Workspace definitions and secrets.
    #[builder(default = Arc::new(StaticWorkspaces::default()) as Arc<dyn WorkspaceProvider>)]
    workspaces: Arc<dyn WorkspaceProvider>,

    /// Lifecycle notifications.
    #[builder(default = Arc::new(TracingEventSink) as Arc<dyn EventSink>)]
    events: Arc<dyn EventSink>,

    /// Cancels every wait loop on shutdown.
    #[builder(default)]
    shutdown: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Looks up a sandbox.
    pub async fn get(&self, sandbox_id: &str) -> SandcoreResult<Sandbox> {
        self.store
            .get(sandbox_id)
            .await?
            .ok_or_else(|| SandcoreError::SandboxNotFound(sandbox_id.to_string()))
    }

    /// Every sandbox, oldest first.
    pub async fn list(&self) -> SandcoreResult<Vec<Sandbox>> {
        self.store.list().await
    }

    /// Marks the addresses of every persisted sandbox as taken. Called once at startup, before
    /// any spawn. Returns how many addresses were restored.
    pub async fn rehydrate(&self) -> SandcoreResult<usize> {
        let mut restored = 0;
        for sandbox in self.store.list().await? {
            if sandbox.runtime.ip_address.is_empty() {
                continue;
            }
            self.network.mark_allocated(&sandbox.runtime.ip_address);
            restored += 1;
        }

        tracing::info!(restored, "network allocations rehydrated");
        Ok(restored)
    }

    /// Cancels every in-flight wait. Spawns and restarts that are waiting fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The token cancelled by [`Orchestrator::shutdown`].
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// A spawn queue admitting spawns into this orchestrator, sized from the configuration.
    pub fn spawn_queue(self: &Arc<Self>) -> SpawnQueue {
        SpawnQueue::new(
            self.clone() as Arc<dyn SpawnHandler>,
            self.config.get_queue(),
            self.config.get_resources().get_max_sandboxes(),
        )
    }

    /// The configuration.
    pub fn config(&self) -> &SandcoreConfig {
        &self.config
    }

    /// The network allocator.
    pub fn network(&self) -> &Arc<NetworkAllocator> {
        &self.network
    }

    /// The record store.
    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    pub(crate) fn environment(&self) -> &dyn SandboxEnvironment {
        self.environment.as_ref()
    }

    pub(crate) fn storage(&self) -> &dyn StorageProvider {
        self.storage.as_ref()
    }

    pub(crate) fn routes(&self) -> &dyn RouteProvider {
        self.routes.as_ref()
    }

    pub(crate) fn workspaces(&self) -> &dyn WorkspaceProvider {
        self.workspaces.as_ref()
    }

    /// The on-disk locations of an existing sandbox.
    pub(crate) fn paths_of(&self, sandbox: &Sandbox) -> SandboxPaths {
        SandboxPaths::resolve(
            self.config.get_paths(),
            &sandbox.id,
            sandbox.runtime.volume_path.as_deref().map(Path::new),
        )
    }

    pub(crate) fn shape_of(&self, sandbox: &Sandbox) -> MachineShape {
        MachineShape {
            vcpus: sandbox.runtime.vcpus,
            memory_mb: sandbox.runtime.memory_mb,
        }
    }

    pub(crate) fn emit(&self, kind: SandboxEventKind, sandbox: &Sandbox) {
        self.events.emit(SandboxEvent::for_sandbox(kind, sandbox));
    }

    /// Polls until the VM reports running, the process dies or the boot deadline passes.
    pub(crate) async fn wait_for_boot(&self, paths: &SandboxPaths, pid: u32) -> SandcoreResult<()> {
        let timeouts = self.config.get_timeouts();
        let timeout_ms = timeouts.get_boot_ms();
        let poll = Duration::from_millis(timeouts.get_boot_poll_ms());
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if self.environment.is_running(paths).await {
                return Ok(());
            }

            if !self.environment.is_alive(pid) {
                return Err(SandcoreError::HypervisorDied {
                    log_tail: self.environment.log_tail(paths).await,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandcoreError::BootTimeout { timeout_ms });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(SandcoreError::custom(anyhow::anyhow!("boot wait cancelled by shutdown")));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Waits for the guest agent with the configured deadline.
    pub(crate) async fn wait_for_agent(&self, sandbox_id: &str) -> bool {
        let timeouts = self.config.get_timeouts();
        self.environment
            .wait_for_agent(
                sandbox_id,
                Duration::from_millis(timeouts.get_agent_wait_ms()),
                Duration::from_millis(timeouts.get_agent_poll_ms()),
                &self.shutdown,
            )
            .await
    }

    /// Kills the process of `pid`, if any, then removes the runtime files.
    pub(crate) async fn kill_and_clean(
        &self,
        sandbox_id: &str,
        pid: Option<u32>,
        paths: &SandboxPaths,
    ) {
        if let Some(pid) = pid {
            if let Err(e) = self.environment.kill(pid).await {
                tracing::warn!(sandbox_id, pid, error = %e, "failed to kill hypervisor");
            }
        }

        if let Err(e) = self.environment.remove_runtime_files(paths).await {
            tracing::warn!(sandbox_id, error = %e, "failed to remove runtime files");
        }
    }

    /// Removes the public and SSH routes of a sandbox.
    pub(crate) async fn remove_all_routes(&self, sandbox_id: &str) {
        if let Err(e) = self.routes.remove_routes(sandbox_id).await {
            tracing::warn!(sandbox_id, error = %e, "failed to remove routes");
        }
        if let Err(e) = self.routes.remove_ssh_route(sandbox_id).await {
            tracing::warn!(sandbox_id, error = %e, "failed to remove ssh route");
        }
    }

    /// Deletes a tap device, logging failures.
    pub(crate) async fn delete_tap_quietly(&self, sandbox_id: &str, tap_device: &str) {
        if tap_device.is_empty() {
            return;
        }
        if let Err(e) = self.environment.delete_tap(tap_device).await {
            tracing::warn!(sandbox_id, tap = tap_device, error = %e, "failed to delete tap device");
        }
    }

    /// Records a failure on a sandbox, logging when the store itself fails.
    pub(crate) async fn mark_error(&self, sandbox_id: &str, message: String) {
        match self
            .store
            .update_status(sandbox_id, SandboxStatus::Error, Some(message))
            .await
        {
            Ok(Some(sandbox)) => self.emit(SandboxEventKind::Updated, &sandbox),
            Ok(None) => tracing::debug!(sandbox_id, "no record to mark as failed"),
            Err(e) => tracing::error!(sandbox_id, error = %e, "failed to record sandbox error"),
        }
    }
}
