use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use sandutils::{
    is_process_alive, remove_file_if_exists, run, run_unchecked, tail_file, terminate_process,
};
use tokio::{fs, time};
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{AgentClient, ExecResult, GuestFile},
    config::SandcoreConfig,
    hypervisor::{
        configure_vm, HypervisorClient, HypervisorLauncher, NetworkOverride, GUEST_IFACE_ID,
        LOG_TAIL_LINES,
    },
    models::{MachineShape, SandboxPaths, SnapshotPaths},
    network::{NetworkAllocation, NetworkAllocator},
    SandcoreError, SandcoreResult,
};

use super::{inject::write_files_under, SandboxEnvironment, SocketPresence};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Polling interval while waiting for a vsock file to appear.
const VSOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs sandboxes as Firecracker microVMs on this host.
///
/// Needs `ip`, `cp`, `mount` and `umount` on the path and enough privileges to manage tap
/// devices and loop mounts.
pub struct FirecrackerEnvironment {
    config: SandcoreConfig,
    network: Arc<NetworkAllocator>,
    agent: Arc<AgentClient>,
    launcher: HypervisorLauncher,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerEnvironment {
    /// Creates the environment.
    pub fn new(
        config: SandcoreConfig,
        network: Arc<NetworkAllocator>,
        agent: Arc<AgentClient>,
    ) -> Self {
        let timeouts = config.get_timeouts();
        let launcher = HypervisorLauncher::new(
            config.get_firecracker_bin(),
            Duration::from_millis(timeouts.get_launch_grace_ms()),
            Duration::from_millis(timeouts.get_socket_wait_ms()),
        );

        Self {
            config,
            network,
            agent,
            launcher,
        }
    }

    fn mount_point(&self, sandbox_id: &str) -> PathBuf {
        self.config
            .get_paths()
            .get_sandbox_dir()
            .join("mounts")
            .join(sandbox_id)
    }

    fn client(&self, paths: &SandboxPaths) -> HypervisorClient {
        let timeout = Duration::from_millis(self.config.get_timeouts().get_api_timeout_ms());
        HypervisorClient::new(&paths.socket).with_timeout(timeout)
    }

    async fn wait_for_file(&self, path: &Path, timeout: Duration) -> bool {
        let deadline = time::Instant::now() + timeout;
        while !path.exists() {
            if time::Instant::now() >= deadline {
                return false;
            }
            time::sleep(VSOCK_POLL_INTERVAL).await;
        }
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxEnvironment for FirecrackerEnvironment {
    async fn create_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        self.network.create_tap(tap_device).await
    }

    async fn delete_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        self.network.delete_tap(tap_device).await
    }

    async fn prepare_overlay(&self, base: &Path, overlay: &Path) -> SandcoreResult<()> {
        if !fs::try_exists(base).await.unwrap_or(false) {
            return Err(SandcoreError::NoBaseImage(base.display().to_string()));
        }

        if let Some(parent) = overlay.parent() {
            fs::create_dir_all(parent).await?;
        }

        run(
            "cp",
            [
                "--sparse=always".to_string(),
                base.display().to_string(),
                overlay.display().to_string(),
            ],
        )
        .await?;

        tracing::debug!(base = %base.display(), overlay = %overlay.display(), "overlay created");
        Ok(())
    }

    async fn remove_overlay(&self, overlay: &Path) -> SandcoreResult<()> {
        if remove_file_if_exists(overlay).await? {
            tracing::debug!(overlay = %overlay.display(), "overlay removed");
        }
        Ok(())
    }

    async fn root_device_exists(&self, paths: &SandboxPaths) -> bool {
        fs::try_exists(&paths.root_device).await.unwrap_or(false)
    }

    async fn snapshot_exists(&self, snapshot: &SnapshotPaths) -> bool {
        fs::try_exists(&snapshot.snapshot).await.unwrap_or(false)
            && fs::try_exists(&snapshot.memory).await.unwrap_or(false)
    }

    async fn write_guest_files(
        &self,
        sandbox_id: &str,
        paths: &SandboxPaths,
        files: &[GuestFile],
    ) -> SandcoreResult<()> {
        let mount_point = self.mount_point(sandbox_id);
        fs::create_dir_all(&mount_point).await?;

        let device = paths.root_device.display().to_string();
        let target = mount_point.display().to_string();
        if paths.uses_volume {
            run("mount", [device.as_str(), target.as_str()]).await?;
        } else {
            run("mount", ["-o", "loop", device.as_str(), target.as_str()]).await?;
        }

        let result = write_files_under(&mount_point, files).await;

        let unmounted = run_unchecked("umount", [target.as_str()]).await?;
        if !unmounted.success() {
            tracing::warn!(
                sandbox_id,
                mount_point = %target,
                stderr = %unmounted.stderr.trim(),
                "failed to unmount root device"
            );
        } else if let Err(e) = fs::remove_dir(&mount_point).await {
            tracing::debug!(sandbox_id, error = %e, "could not remove mount point");
        }

        result?;
        tracing::debug!(sandbox_id, count = files.len(), "guest files injected");
        Ok(())
    }

    async fn launch(&self, paths: &SandboxPaths) -> SandcoreResult<u32> {
        self.launcher.launch(paths).await
    }

    async fn configure(
        &self,
        paths: &SandboxPaths,
        network: &NetworkAllocation,
        shape: MachineShape,
    ) -> SandcoreResult<()> {
        configure_vm(&self.client(paths), paths, network, shape).await
    }

    async fn restore_snapshot(
        &self,
        paths: &SandboxPaths,
        source: &SandboxPaths,
        snapshot: &SnapshotPaths,
        network: &NetworkAllocation,
    ) -> SandcoreResult<()> {
        // The snapshot refers to the source sandbox's drive and vsock paths.
        if source.root_device != paths.root_device {
            match fs::symlink_metadata(&source.root_device).await {
                Ok(meta) if !meta.file_type().is_symlink() => {
                    return Err(SandcoreError::Storage(format!(
                        "prebuild source drive {} is still in use",
                        source.root_device.display()
                    )));
                }
                Ok(_) => {
                    fs::remove_file(&source.root_device).await?;
                }
                Err(_) => {}
            }
            fs::symlink(&paths.root_device, &source.root_device).await?;
        }
        remove_file_if_exists(&source.vsock).await?;

        let client = self.client(paths);
        let loaded = client
            .load_snapshot(
                &snapshot.snapshot,
                &snapshot.memory,
                vec![NetworkOverride {
                    iface_id: GUEST_IFACE_ID.to_string(),
                    host_dev_name: network.tap_device.clone(),
                }],
            )
            .await;

        let vsock_wait = Duration::from_millis(self.config.get_timeouts().get_vsock_repair_ms());
        let vsock_ready = loaded.is_ok() && self.wait_for_file(&source.vsock, vsock_wait).await;

        if source.root_device != paths.root_device {
            if let Err(e) = remove_file_if_exists(&source.root_device).await {
                tracing::warn!(error = %e, "failed to remove drive symlink");
            }
        }

        loaded?;
        if !vsock_ready {
            return Err(SandcoreError::custom(anyhow::anyhow!(
                "vsock {} did not appear after snapshot restore",
                source.vsock.display()
            )));
        }

        remove_file_if_exists(&paths.vsock).await?;
        fs::symlink(&source.vsock, &paths.vsock).await?;

        tracing::info!(snapshot = %snapshot.snapshot.display(), "VM restored from snapshot");
        Ok(())
    }

    async fn start_vm(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        self.client(paths).start().await
    }

    async fn is_running(&self, paths: &SandboxPaths) -> bool {
        self.client(paths).is_running().await
    }

    async fn set_vsock(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        self.client(paths)
            .set_vsock(&paths.vsock)
            .await
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    async fn kill(&self, pid: u32) -> SandcoreResult<()> {
        let grace = Duration::from_millis(self.config.get_timeouts().get_kill_grace_ms());
        terminate_process(pid, grace).await?;
        Ok(())
    }

    async fn remove_runtime_files(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        for file in paths.runtime_files() {
            remove_file_if_exists(file).await?;
        }
        Ok(())
    }

    async fn socket_presence(&self, paths: &SandboxPaths) -> SocketPresence {
        SocketPresence {
            control: fs::try_exists(&paths.socket).await.unwrap_or(false),
            vsock: fs::try_exists(&paths.vsock).await.unwrap_or(false),
        }
    }

    async fn log_tail(&self, paths: &SandboxPaths) -> String {
        tail_file(&paths.log, LOG_TAIL_LINES).await
    }

    async fn wait_for_agent(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        self.agent
            .wait_for_agent(sandbox_id, timeout, interval, cancel)
            .await
    }

    async fn guest_exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> SandcoreResult<ExecResult> {
        self.agent.exec(sandbox_id, command, timeout).await
    }

    async fn guest_write_files(
        &self,
        sandbox_id: &str,
        files: &[GuestFile],
    ) -> SandcoreResult<()> {
        self.agent.write_files(sandbox_id, files).await?;
        Ok(())
    }

    async fn start_guest_service(&self, sandbox_id: &str, name: &str) -> SandcoreResult<()> {
        let status = self.agent.start_service(sandbox_id, name).await?;
        tracing::debug!(sandbox_id, service = name, running = status.running, "guest service started");
        Ok(())
    }

    fn drop_agent_channel(&self, sandbox_id: &str) {
        self.agent.disconnect(sandbox_id);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::{AgentConfig, NetworkConfig, PathsConfig};

    fn environment(root: &Path) -> FirecrackerEnvironment {
        let config = SandcoreConfig::builder()
            .paths(PathsConfig::contained_in(root))
            .build();
        let agent = AgentClient::new(config.get_paths().get_socket_dir(), &AgentConfig::default());
        FirecrackerEnvironment::new(
            config,
            Arc::new(NetworkAllocator::new(NetworkConfig::default())),
            Arc::new(agent),
        )
    }

    #[tokio::test]
    async fn test_prepare_overlay_copies_base_image() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let env = environment(dir.path());
        let base = dir.path().join("rootfs").join("dev-base.ext4");
        let overlay = dir.path().join("overlays").join("abc.ext4");

        let err = env.prepare_overlay(&base, &overlay).await.unwrap_err();
        assert!(matches!(err, SandcoreError::NoBaseImage(_)));
        assert!(!overlay.exists());

        fs::create_dir_all(base.parent().unwrap()).await?;
        fs::write(&base, b"ext4 image").await?;
        env.prepare_overlay(&base, &overlay).await?;
        assert_eq!(fs::read(&overlay).await?, b"ext4 image");

        env.remove_overlay(&overlay).await?;
        env.remove_overlay(&overlay).await?;
        assert!(!overlay.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_runtime_files_and_socket_presence() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let env = environment(dir.path());
        let paths = SandboxPaths::resolve(&PathsConfig::contained_in(dir.path()), "abc", None);

        fs::create_dir_all(paths.socket.parent().unwrap()).await?;
        fs::write(&paths.socket, b"").await?;
        fs::write(&paths.pid, b"42").await?;

        let presence = env.socket_presence(&paths).await;
        assert!(presence.control);
        assert!(!presence.vsock);
        assert!(!env.is_running(&paths).await);

        env.remove_runtime_files(&paths).await?;
        env.remove_runtime_files(&paths).await?;
        assert!(!paths.socket.exists());
        assert!(!paths.pid.exists());

        Ok(())
    }
}
