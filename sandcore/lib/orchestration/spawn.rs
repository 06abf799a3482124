use std::time::Duration;

use async_trait::async_trait;

use crate::{
    models::{
        GuestProvisioning, MachineShape, Repository, Sandbox, SandboxPaths, SandboxRuntime,
        SandboxStatus, SnapshotPaths, SpawnOptions, Workspace, DEFAULT_ROOTFS_FILENAME,
    },
    network::NetworkAllocation,
    providers::{ResizeOutcome, SandboxEventKind, VolumeRequest},
    queue::SpawnHandler,
    utils::generate_sandbox_id,
    SandcoreError, SandcoreResult,
};

use super::{
    boot_files, clone_steps, network_reconfigure_command, sync_files, GuestContext, Orchestrator,
    AUTOSTART_SERVICES,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Budget of the in-guest network reconfiguration after a snapshot restore.
const NETWORK_RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget of the in-guest filesystem expansion.
const EXPAND_FS_TIMEOUT: Duration = Duration::from_secs(30);

/// Grows the guest root filesystem to the size of its volume.
const EXPAND_FS_COMMAND: &str = "resize2fs /dev/vda";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a spawn has created so far, for rollback.
struct SpawnProgress {
    sandbox_id: String,
    network: NetworkAllocation,
    paths: Option<SandboxPaths>,
    volume: bool,
    overlay: bool,
    record: bool,
    pid: Option<u32>,
}

/// A prebuild snapshot the new VM can resume from.
struct RestorePlan {
    snapshot: SnapshotPaths,
    source: SandboxPaths,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Provisions and boots a new sandbox.
    ///
    /// Any failure after the network allocation rolls back every resource created so far and
    /// leaves the record, if one was persisted, in the `error` state.
    pub async fn spawn(&self, options: SpawnOptions) -> SandcoreResult<Sandbox> {
        options.validate()?;

        let workspace = match &options.workspace_id {
            Some(id) => Some(
                self.workspaces()
                    .workspace(id)
                    .await?
                    .ok_or_else(|| SandcoreError::Validation(format!("unknown workspace {id}")))?,
            ),
            None => None,
        };

        let max_sandboxes = self.config().get_resources().get_max_sandboxes();
        let active = self.store().count_by_status(SandboxStatus::Creating).await?
            + self.store().count_by_status(SandboxStatus::Running).await?;
        if active >= max_sandboxes {
            return Err(SandcoreError::ResourceExhausted(format!(
                "{active} of {max_sandboxes} sandboxes are active"
            )));
        }

        let sandbox_id = generate_sandbox_id();
        let network = self.network().allocate(&sandbox_id)?;

        tracing::info!(
            sandbox_id,
            workspace_id = ?options.workspace_id,
            ip = %network.ip_address,
            "spawning sandbox"
        );

        let mut progress = SpawnProgress {
            sandbox_id: sandbox_id.clone(),
            network,
            paths: None,
            volume: false,
            overlay: false,
            record: false,
            pid: None,
        };

        match self
            .provision(&options, workspace.as_ref(), &mut progress)
            .await
        {
            Ok(sandbox) => {
                tracing::info!(sandbox_id, pid = ?sandbox.runtime.pid, "sandbox running");
                Ok(sandbox)
            }
            Err(e) => {
                tracing::error!(sandbox_id, error = %e, "spawn failed, rolling back");
                self.rollback(&progress, &e).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        options: &SpawnOptions,
        workspace: Option<&Workspace>,
        progress: &mut SpawnProgress,
    ) -> SandcoreResult<Sandbox> {
        let config = self.config();
        let sandbox_id = progress.sandbox_id.clone();
        let network = progress.network.clone();
        let shape = MachineShape {
            vcpus: options
                .vcpus
                .or(workspace.and_then(|ws| ws.vcpus))
                .unwrap_or(config.get_resources().get_vcpus()),
            memory_mb: options
                .memory_mb
                .or(workspace.and_then(|ws| ws.memory_mb))
                .unwrap_or(config.get_resources().get_memory_mb()),
        };
        let base_image = options
            .base_image
            .clone()
            .or_else(|| workspace.and_then(|ws| ws.base_image.clone()));

        // Root device.
        let use_prebuild = match workspace {
            Some(ws) if ws.has_ready_prebuild() => self.storage().has_prebuild(&ws.id).await,
            _ => false,
        };

        let volume_path = if use_prebuild || self.storage().is_available().await {
            let request = VolumeRequest {
                workspace_id: workspace.map(|ws| ws.id.clone()),
                base_image: base_image.clone(),
                use_prebuild,
            };
            let path = self
                .storage()
                .create_sandbox_volume(&sandbox_id, &request)
                .await?;
            progress.volume = true;

            if !use_prebuild {
                self.resize_volume(&sandbox_id).await;
            }
            Some(path)
        } else {
            None
        };

        let paths = SandboxPaths::resolve(config.get_paths(), &sandbox_id, volume_path.as_deref());
        progress.paths = Some(paths.clone());

        if volume_path.is_none() {
            let base = match &base_image {
                Some(image) => config
                    .get_paths()
                    .get_rootfs_dir()
                    .join(format!("{image}.ext4")),
                None => config.get_paths().get_rootfs_dir().join(DEFAULT_ROOTFS_FILENAME),
            };
            progress.overlay = true;
            self.environment()
                .prepare_overlay(&base, &paths.root_device)
                .await?;
        }

        // Record.
        let mut sandbox = Sandbox::creating(
            sandbox_id.clone(),
            workspace.map(|ws| ws.id.clone()),
            SandboxRuntime {
                ip_address: network.ip_address.clone(),
                mac_address: network.mac_address.clone(),
                tap_device: network.tap_device.clone(),
                vcpus: shape.vcpus,
                memory_mb: shape.memory_mb,
                volume_path: volume_path.map(|p| p.display().to_string()),
                used_prebuild: use_prebuild,
                ..Default::default()
            },
        );
        self.store().create(&sandbox).await?;
        progress.record = true;

        // Host and VM.
        self.environment().create_tap(&network.tap_device).await?;

        let provisioning = self.workspaces().provisioning(workspace).await?;
        let restore = match workspace {
            Some(ws) if use_prebuild => self.restore_plan(ws).await,
            _ => None,
        };

        if restore.is_none() {
            let files = boot_files(&GuestContext {
                sandbox_id: &sandbox_id,
                workspace,
                network: &network,
                dns_servers: config.get_network().get_dns_servers(),
                ports: config.get_services(),
                provisioning: &provisioning,
            })?;
            self.environment()
                .write_guest_files(&sandbox_id, &paths, &files)
                .await?;
        }

        let pid = self.environment().launch(&paths).await?;
        progress.pid = Some(pid);

        match &restore {
            Some(plan) => {
                self.environment()
                    .restore_snapshot(&paths, &plan.source, &plan.snapshot, &network)
                    .await?
            }
            None => {
                self.environment().configure(&paths, &network, shape).await?;
                self.environment().start_vm(&paths).await?;
            }
        }

        self.wait_for_boot(&paths, pid).await?;
        tracing::info!(sandbox_id, pid, restored = restore.is_some(), "VM booted");

        // Guest.
        let repositories = workspace
            .map(|ws| ws.repositories.as_slice())
            .unwrap_or_default();
        let must_clone = !use_prebuild && !repositories.is_empty();

        let agent_ready = self.wait_for_agent(&sandbox_id).await;
        if !agent_ready {
            if config.get_require_agent() || must_clone {
                return Err(SandcoreError::AgentUnavailable(sandbox_id));
            }
            tracing::warn!(sandbox_id, "guest agent not ready, continuing without it");
        }

        if agent_ready {
            if restore.is_some() {
                self.reconfigure_restored_guest(&sandbox_id, &network, &provisioning)
                    .await?;
            }

            if progress.volume && !use_prebuild {
                self.expand_filesystem(&sandbox_id).await;
            }

            if must_clone {
                for repository in repositories {
                    self.clone_repository(&sandbox_id, repository).await?;
                }
            }

            for service in AUTOSTART_SERVICES {
                if let Err(e) = self
                    .environment()
                    .start_guest_service(&sandbox_id, service)
                    .await
                {
                    tracing::warn!(sandbox_id, service, error = %e, "failed to start guest service");
                }
            }
        }

        // Routes.
        let urls = self
            .routes()
            .register_routes(&sandbox_id, &network.ip_address, config.get_services())
            .await?;
        self.routes()
            .register_ssh_route(&sandbox_id, &network.ip_address)
            .await?;

        sandbox.status = SandboxStatus::Running;
        sandbox.runtime.pid = Some(pid);
        sandbox.runtime.urls = urls;
        let sandbox = self
            .store()
            .update(&sandbox)
            .await?
            .ok_or_else(|| SandcoreError::SandboxNotFound(sandbox_id.clone()))?;

        self.emit(SandboxEventKind::Created, &sandbox);
        Ok(sandbox)
    }

    /// Tears down everything a failed spawn created. The hypervisor is stopped first; every
    /// later step runs even when others fail.
    async fn rollback(&self, progress: &SpawnProgress, error: &SandcoreError) {
        let sandbox_id = progress.sandbox_id.as_str();

        if let Some(paths) = &progress.paths {
            self.kill_and_clean(sandbox_id, progress.pid, paths).await;
        }

        let root_device = async {
            if progress.volume {
                if let Err(e) = self.storage().delete_sandbox_volume(sandbox_id).await {
                    tracing::warn!(sandbox_id, error = %e, "failed to delete volume");
                }
            } else if let (true, Some(paths)) = (progress.overlay, &progress.paths) {
                if let Err(e) = self.environment().remove_overlay(&paths.root_device).await {
                    tracing::warn!(sandbox_id, error = %e, "failed to remove overlay");
                }
            }
        };

        let tap = self.delete_tap_quietly(sandbox_id, &progress.network.tap_device);
        let routes = self.remove_all_routes(sandbox_id);

        futures::join!(root_device, tap, routes);

        self.network().release(&progress.network.ip_address);
        self.environment().drop_agent_channel(sandbox_id);

        if progress.record {
            self.mark_error(sandbox_id, error.to_string()).await;
        }

        tracing::info!(sandbox_id, "spawn rolled back");
    }

    async fn resize_volume(&self, sandbox_id: &str) {
        let size_gb = self.config().get_resources().get_volume_size_gb();
        match self
            .storage()
            .resize_sandbox_volume(sandbox_id, size_gb)
            .await
        {
            Ok(ResizeOutcome::Resized {
                previous_gb,
                new_gb,
            }) => tracing::debug!(sandbox_id, previous_gb, new_gb, "volume resized"),
            Ok(ResizeOutcome::Unchanged) => {}
            Err(e) => tracing::warn!(sandbox_id, error = %e, "failed to resize volume"),
        }
    }

    async fn expand_filesystem(&self, sandbox_id: &str) {
        match self
            .environment()
            .guest_exec(sandbox_id, EXPAND_FS_COMMAND, Some(EXPAND_FS_TIMEOUT))
            .await
        {
            Ok(result) if result.success() => {
                tracing::debug!(sandbox_id, "guest filesystem expanded")
            }
            Ok(result) => {
                tracing::warn!(sandbox_id, stderr = %result.stderr.trim(), "filesystem expansion failed")
            }
            Err(e) => tracing::warn!(sandbox_id, error = %e, "filesystem expansion failed"),
        }
    }

    async fn clone_repository(
        &self,
        sandbox_id: &str,
        repository: &Repository,
    ) -> SandcoreResult<()> {
        let url = self.workspaces().clone_url(repository).await?;
        let timeout = Duration::from_millis(self.config().get_timeouts().get_clone_ms());

        for step in clone_steps(repository, &url) {
            let result = self
                .environment()
                .guest_exec(sandbox_id, &step.command, Some(timeout))
                .await;

            match result {
                Ok(output) if output.success() => {}
                Ok(output) if step.required => {
                    let stderr = if output.stderr.trim().is_empty() {
                        output.stdout
                    } else {
                        output.stderr
                    };
                    return Err(SandcoreError::GuestCommand {
                        context: step.context,
                        stderr: stderr.trim().to_string(),
                    });
                }
                Err(e) if step.required => return Err(e),
                Ok(output) => {
                    tracing::debug!(sandbox_id, step = %step.context, code = output.exit_code, "optional clone step failed")
                }
                Err(e) => {
                    tracing::debug!(sandbox_id, step = %step.context, error = %e, "optional clone step failed")
                }
            }
        }

        tracing::info!(sandbox_id, url = %repository.url, "repository cloned");
        Ok(())
    }

    /// A snapshot restore needs the snapshot files and the layout of the sandbox it was taken
    /// from. Without either the sandbox cold-boots from the prebuild volume.
    async fn restore_plan(&self, workspace: &Workspace) -> Option<RestorePlan> {
        let snapshot = SnapshotPaths::prebuild(self.config().get_paths(), &workspace.id);
        if !self.environment().snapshot_exists(&snapshot).await {
            return None;
        }

        let source_id = workspace.prebuild.as_ref()?.latest_id.as_deref()?;
        let source_volume = self.storage().volume_path(source_id);
        let source = SandboxPaths::resolve(
            self.config().get_paths(),
            source_id,
            source_volume.as_deref(),
        );

        Some(RestorePlan { snapshot, source })
    }

    async fn reconfigure_restored_guest(
        &self,
        sandbox_id: &str,
        network: &NetworkAllocation,
        provisioning: &GuestProvisioning,
    ) -> SandcoreResult<()> {
        let result = self
            .environment()
            .guest_exec(
                sandbox_id,
                &network_reconfigure_command(network),
                Some(NETWORK_RECONFIGURE_TIMEOUT),
            )
            .await?;
        if !result.success() {
            return Err(SandcoreError::GuestCommand {
                context: "reconfigure guest network".to_string(),
                stderr: result.stderr.trim().to_string(),
            });
        }

        let files = sync_files(provisioning);
        if !files.is_empty() {
            if let Err(e) = self.environment().guest_write_files(sandbox_id, &files).await {
                tracing::warn!(sandbox_id, error = %e, "failed to push guest configuration");
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SpawnHandler for Orchestrator {
    async fn spawn(&self, options: SpawnOptions) -> SandcoreResult<Sandbox> {
        Orchestrator::spawn(self, options).await
    }
}
