//! Sandbox orchestration.
//!
//! [`Orchestrator`] composes the network allocator, the host environment and the pluggable
//! providers into the sandbox lifecycle: spawn with full rollback, stop, start, destroy and
//! liveness checking with vsock repair.

mod destroy;
mod lifecycle;
mod liveness;
mod orchestrator;
mod provision;
mod spawn;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use orchestrator::*;
pub use provision::*;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, OnceLock,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        config::{PathsConfig, ResourcesConfig, SandcoreConfig, ServicePorts, TimeoutsConfig},
        environment::{SimulatedEnvironment, SimulatedFault},
        models::{
            GuestProvisioning, PrebuildInfo, PrebuildStatus, Repository, Sandbox, SandboxPaths,
            SandboxRuntime, SandboxStatus, ServiceUrls, SnapshotPaths, SpawnOptions, Workspace,
        },
        network::{NetworkAllocation, NetworkAllocator},
        providers::{
            BroadcastEventSink, DirectRoutes, MemorySandboxStore, ResizeOutcome, RouteProvider,
            SandboxEvent, SandboxEventKind, SandboxStore, StaticWorkspaces, StorageProvider,
            VolumeInfo, VolumeRequest,
        },
        SandcoreError, SandcoreResult,
    };

    //----------------------------------------------------------------------------------------------
    // Fixtures
    //----------------------------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeStorage {
        available: bool,
        fail_create: AtomicBool,
        volumes: Mutex<BTreeSet<String>>,
        prebuilds: Mutex<BTreeSet<String>>,
        host: OnceLock<Arc<SimulatedEnvironment>>,
        live_pids_at_delete: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl StorageProvider for FakeStorage {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn create_sandbox_volume(
            &self,
            sandbox_id: &str,
            _request: &VolumeRequest,
        ) -> SandcoreResult<PathBuf> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(SandcoreError::Storage("thin pool is full".to_string()));
            }
            self.volumes.lock().unwrap().insert(sandbox_id.to_string());
            Ok(volume_path(sandbox_id))
        }

        async fn delete_sandbox_volume(&self, sandbox_id: &str) -> SandcoreResult<()> {
            if let Some(host) = self.host.get() {
                self.live_pids_at_delete
                    .lock()
                    .unwrap()
                    .push(host.live_pids());
            }
            self.volumes.lock().unwrap().remove(sandbox_id);
            Ok(())
        }

        async fn has_prebuild(&self, workspace_id: &str) -> bool {
            self.prebuilds.lock().unwrap().contains(workspace_id)
        }

        async fn create_prebuild(
            &self,
            workspace_id: &str,
            _source_sandbox_id: &str,
        ) -> SandcoreResult<()> {
            self.prebuilds
                .lock()
                .unwrap()
                .insert(workspace_id.to_string());
            Ok(())
        }

        fn volume_path(&self, sandbox_id: &str) -> Option<PathBuf> {
            Some(volume_path(sandbox_id))
        }

        async fn volume_info(&self, sandbox_id: &str) -> SandcoreResult<Option<VolumeInfo>> {
            let exists = self.volumes.lock().unwrap().contains(sandbox_id);
            Ok(exists.then(|| VolumeInfo {
                path: volume_path(sandbox_id),
                size_bytes: 10 << 30,
            }))
        }

        async fn resize_sandbox_volume(
            &self,
            _sandbox_id: &str,
            size_gb: u32,
        ) -> SandcoreResult<ResizeOutcome> {
            Ok(ResizeOutcome::Resized {
                previous_gb: 10,
                new_gb: size_gb,
            })
        }
    }

    #[derive(Default)]
    struct FakeRoutes {
        fail: AtomicBool,
        routes: Mutex<BTreeSet<String>>,
        ssh: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl RouteProvider for FakeRoutes {
        async fn register_routes(
            &self,
            sandbox_id: &str,
            ip_address: &str,
            ports: &ServicePorts,
        ) -> SandcoreResult<ServiceUrls> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SandcoreError::Route("proxy unreachable".to_string()));
            }
            self.routes.lock().unwrap().insert(sandbox_id.to_string());
            DirectRoutes
                .register_routes(sandbox_id, ip_address, ports)
                .await
        }

        async fn remove_routes(&self, sandbox_id: &str) -> SandcoreResult<()> {
            self.routes.lock().unwrap().remove(sandbox_id);
            Ok(())
        }

        async fn register_ssh_route(
            &self,
            sandbox_id: &str,
            _ip_address: &str,
        ) -> SandcoreResult<()> {
            self.ssh.lock().unwrap().insert(sandbox_id.to_string());
            Ok(())
        }

        async fn remove_ssh_route(&self, sandbox_id: &str) -> SandcoreResult<()> {
            self.ssh.lock().unwrap().remove(sandbox_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Setup {
        volumes: bool,
        require_agent: bool,
        max_sandboxes: Option<usize>,
        base_images: Option<Vec<&'static str>>,
        kill_delay: Option<Duration>,
        workspaces: Vec<Workspace>,
        provisioning: GuestProvisioning,
    }

    struct Harness {
        dir: TempDir,
        env: Arc<SimulatedEnvironment>,
        store: Arc<MemorySandboxStore>,
        storage: Arc<FakeStorage>,
        routes: Arc<FakeRoutes>,
        events: broadcast::Receiver<SandboxEvent>,
        orchestrator: Arc<Orchestrator>,
    }

    impl Harness {
        fn paths(&self) -> PathsConfig {
            PathsConfig::contained_in(self.dir.path())
        }

        fn drain_events(&mut self) -> Vec<SandboxEventKind> {
            let mut kinds = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                kinds.push(event.kind);
            }
            kinds
        }

        fn assert_nothing_held(&self) {
            assert!(self.env.taps().is_empty(), "taps: {:?}", self.env.taps());
            assert!(self.env.overlays().is_empty());
            assert!(self.env.sockets().is_empty());
            assert!(self.env.live_pids().is_empty());
            assert!(self.storage.volumes.lock().unwrap().is_empty());
            assert!(self.routes.routes.lock().unwrap().is_empty());
            assert!(self.routes.ssh.lock().unwrap().is_empty());
            assert_eq!(self.orchestrator.network().allocated_count(), 0);
        }
    }

    fn harness(setup: Setup) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::contained_in(dir.path());

        let mut env = SimulatedEnvironment::new();
        if let Some(images) = &setup.base_images {
            let rootfs_dir = paths.get_rootfs_dir().clone();
            env = env.with_base_images(
                images
                    .iter()
                    .map(|name| rootfs_dir.join(format!("{name}.ext4"))),
            );
        }
        if let Some(delay) = setup.kill_delay {
            env = env.with_kill_delay(delay);
        }
        let env = Arc::new(env);

        let config = SandcoreConfig::builder()
            .paths(paths)
            .resources(
                ResourcesConfig::builder()
                    .max_sandboxes(setup.max_sandboxes.unwrap_or(20))
                    .build(),
            )
            .timeouts(
                TimeoutsConfig::builder()
                    .boot_ms(200)
                    .boot_poll_ms(10)
                    .agent_wait_ms(50)
                    .agent_poll_ms(10)
                    .kill_grace_ms(10)
                    .vsock_repair_ms(200)
                    .build(),
            )
            .require_agent(setup.require_agent)
            .simulated(true)
            .build();

        let network = Arc::new(NetworkAllocator::new(config.get_network().clone()));
        let store = Arc::new(MemorySandboxStore::new());
        let storage = Arc::new(FakeStorage {
            available: setup.volumes,
            ..Default::default()
        });
        let _ = storage.host.set(env.clone());
        let routes = Arc::new(FakeRoutes::default());
        let sink = BroadcastEventSink::default();
        let events = sink.subscribe();
        let workspaces =
            StaticWorkspaces::new(setup.workspaces).with_provisioning(setup.provisioning);

        let orchestrator = Orchestrator::builder()
            .config(config)
            .environment(env.clone())
            .network(network)
            .store(store.clone())
            .storage(storage.clone())
            .routes(routes.clone())
            .workspaces(Arc::new(workspaces))
            .events(Arc::new(sink))
            .build();

        Harness {
            dir,
            env,
            store,
            storage,
            routes,
            events,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn volume_path(sandbox_id: &str) -> PathBuf {
        PathBuf::from(format!("/dev/sandbox-vg/sandbox-{sandbox_id}"))
    }

    fn repository() -> Repository {
        Repository {
            url: "https://github.com/acme/app.git".to_string(),
            branch: "main".to_string(),
            clone_path: "/workspace/app".to_string(),
            source_id: None,
        }
    }

    fn workspace(id: &str, base_image: Option<&str>, repositories: Vec<Repository>) -> Workspace {
        Workspace {
            id: id.to_string(),
            name: format!("{id} workspace"),
            base_image: base_image.map(str::to_string),
            repositories,
            ..Default::default()
        }
    }

    fn in_workspace(id: &str) -> SpawnOptions {
        SpawnOptions::builder().workspace_id(id).build()
    }

    //----------------------------------------------------------------------------------------------
    // Spawn
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_spawn_from_workspace_image() -> anyhow::Result<()> {
        let mut h = harness(Setup {
            base_images: Some(vec!["dev-base"]),
            workspaces: vec![workspace("w1", Some("dev-base"), vec![repository()])],
            ..Default::default()
        });

        let sandbox = h.orchestrator.spawn(in_workspace("w1")).await?;

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.workspace_id.as_deref(), Some("w1"));
        assert_eq!(sandbox.runtime.ip_address, "172.16.0.10");
        assert_eq!(sandbox.runtime.vcpus, 2);
        assert_eq!(sandbox.runtime.memory_mb, 2048);
        assert!(sandbox.runtime.volume_path.is_none());
        assert!(!sandbox.runtime.used_prebuild);
        assert_eq!(sandbox.runtime.urls.vscode, "http://172.16.0.10:8080");

        let pid = sandbox.runtime.pid.expect("running sandbox has a pid");
        assert_eq!(h.env.live_pids(), vec![pid]);

        let overlay = h
            .paths()
            .get_overlay_dir()
            .join(format!("{}.ext4", sandbox.id));
        assert!(h.env.overlays().contains(&overlay));
        assert!(h.env.taps().contains(&sandbox.runtime.tap_device));

        let injected: Vec<_> = h
            .env
            .injected_files(&sandbox.id)
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert!(injected.contains(&NETWORK_SCRIPT_PATH.to_string()));
        assert!(injected.contains(&SANDBOX_CONFIG_PATH.to_string()));

        let commands: Vec<_> = h.env.exec_log().into_iter().map(|(_, c)| c).collect();
        assert!(commands
            .iter()
            .any(|c| c.contains("git clone") && c.contains("acme/app.git")));

        let services: Vec<_> = h
            .env
            .started_services()
            .into_iter()
            .map(|(_, s)| s)
            .collect();
        assert_eq!(services, AUTOSTART_SERVICES.to_vec());

        assert!(h.routes.routes.lock().unwrap().contains(&sandbox.id));
        assert!(h.routes.ssh.lock().unwrap().contains(&sandbox.id));
        assert_eq!(h.drain_events(), vec![SandboxEventKind::Created]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_spawn_on_volume_resizes_and_expands() -> anyhow::Result<()> {
        let h = harness(Setup {
            volumes: true,
            ..Default::default()
        });

        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;

        assert_eq!(
            sandbox.runtime.volume_path.as_deref(),
            Some(volume_path(&sandbox.id).to_str().unwrap())
        );
        assert!(h.env.overlays().is_empty());
        assert!(h
            .env
            .exec_log()
            .iter()
            .any(|(_, c)| c.starts_with("resize2fs")));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_spawn_validates_before_allocating() -> anyhow::Result<()> {
        let h = harness(Setup::default());

        let err = h
            .orchestrator
            .spawn(SpawnOptions::builder().vcpus(32).build())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::Validation(_)));

        let err = h.orchestrator.spawn(in_workspace("ghost")).await.unwrap_err();
        assert!(matches!(err, SandcoreError::Validation(_)));

        h.assert_nothing_held();
        assert!(h.orchestrator.list().await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_spawn_respects_sandbox_cap() -> anyhow::Result<()> {
        let h = harness(Setup {
            max_sandboxes: Some(1),
            ..Default::default()
        });

        h.orchestrator.spawn(SpawnOptions::default()).await?;
        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::ResourceExhausted(_)));
        assert_eq!(h.orchestrator.network().allocated_count(), 1);

        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Rollback
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_addresses_run_out() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let network = h.orchestrator.network();
        let mut held = Vec::new();
        while let Ok(allocation) = network.allocate("filler") {
            held.push(allocation.ip_address);
        }

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::ResourceExhausted(_)));
        assert!(h.env.taps().is_empty());
        assert!(h.orchestrator.list().await?.is_empty());
        assert_eq!(network.allocated_count(), held.len());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_base_image_is_missing() -> anyhow::Result<()> {
        let h = harness(Setup {
            base_images: Some(vec![]),
            workspaces: vec![workspace("w1", Some("dev-base"), vec![])],
            ..Default::default()
        });

        let err = h.orchestrator.spawn(in_workspace("w1")).await.unwrap_err();
        assert!(matches!(err, SandcoreError::NoBaseImage(_)));

        h.assert_nothing_held();
        assert!(h.orchestrator.list().await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_volume_creation_fails() -> anyhow::Result<()> {
        let h = harness(Setup {
            volumes: true,
            ..Default::default()
        });
        h.storage.fail_create.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::Storage(_)));

        h.assert_nothing_held();
        assert!(h.orchestrator.list().await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_hypervisor_dies() -> anyhow::Result<()> {
        let mut h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::Launch);

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::HypervisorDied { .. }));

        h.assert_nothing_held();

        let records = h.orchestrator.list().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SandboxStatus::Error);
        assert!(records[0]
            .runtime
            .error
            .as_deref()
            .is_some_and(|e| e.contains("/dev/kvm")));
        assert_eq!(h.drain_events(), vec![SandboxEventKind::Updated]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_boot_times_out() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::BootHang);

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::BootTimeout { timeout_ms: 200 }));

        h.assert_nothing_held();
        assert_eq!(h.orchestrator.list().await?[0].status, SandboxStatus::Error);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_when_route_registration_fails() -> anyhow::Result<()> {
        let h = harness(Setup {
            volumes: true,
            ..Default::default()
        });
        h.routes.fail.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::Route(_)));

        h.assert_nothing_held();
        let record = &h.orchestrator.list().await?[0];
        assert_eq!(record.status, SandboxStatus::Error);
        assert!(!h.env.has_agent_channel(&record.id));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_aborts_boot_wait() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::BootHang);
        h.orchestrator.shutdown();

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::Custom(_)));
        assert!(err.to_string().contains("shutdown"));

        h.assert_nothing_held();
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Guest agent
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_missing_agent_is_tolerated_without_repositories() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::AgentUnavailable);

        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(h.env.started_services().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_agent_fails_when_repositories_need_cloning() -> anyhow::Result<()> {
        let h = harness(Setup {
            workspaces: vec![workspace("w1", None, vec![repository()])],
            ..Default::default()
        });
        h.env.inject_fault(SimulatedFault::AgentUnavailable);

        let err = h.orchestrator.spawn(in_workspace("w1")).await.unwrap_err();
        assert!(matches!(err, SandcoreError::AgentUnavailable(_)));
        h.assert_nothing_held();

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_agent_fails_when_required() -> anyhow::Result<()> {
        let h = harness(Setup {
            require_agent: true,
            ..Default::default()
        });
        h.env.inject_fault(SimulatedFault::AgentUnavailable);

        let err = h
            .orchestrator
            .spawn(SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandcoreError::AgentUnavailable(_)));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_clone_failure_surfaces_guest_stderr() -> anyhow::Result<()> {
        let h = harness(Setup {
            workspaces: vec![workspace("w1", None, vec![repository()])],
            ..Default::default()
        });
        h.env.inject_fault(SimulatedFault::GuestExec);

        let err = h.orchestrator.spawn(in_workspace("w1")).await.unwrap_err();
        match err {
            SandcoreError::GuestCommand { stderr, .. } => {
                assert_eq!(stderr, "fatal: simulated failure")
            }
            other => panic!("unexpected error: {other}"),
        }
        h.assert_nothing_held();

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_restore_from_prebuild_snapshot() -> anyhow::Result<()> {
        let mut ws = workspace("w1", None, vec![repository()]);
        ws.prebuild = Some(PrebuildInfo {
            status: PrebuildStatus::Ready,
            latest_id: Some("src123def456".to_string()),
        });

        let h = harness(Setup {
            volumes: true,
            workspaces: vec![ws],
            provisioning: GuestProvisioning {
                secrets: BTreeMap::from([("API_KEY".to_string(), "s3cr3t".to_string())]),
                ..Default::default()
            },
            ..Default::default()
        });
        h.storage
            .prebuilds
            .lock()
            .unwrap()
            .insert("w1".to_string());
        h.env
            .add_snapshot(&SnapshotPaths::prebuild(&h.paths(), "w1"));

        let sandbox = h.orchestrator.spawn(in_workspace("w1")).await?;

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(sandbox.runtime.used_prebuild);
        assert!(h.env.injected_files(&sandbox.id).is_empty());

        let pushed: Vec<_> = h
            .env
            .pushed_files(&sandbox.id)
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert!(pushed.contains(&SECRETS_ENV_PATH.to_string()));

        let commands: Vec<_> = h.env.exec_log().into_iter().map(|(_, c)| c).collect();
        let reconfigure = network_reconfigure_command(&NetworkAllocation {
            ip_address: sandbox.runtime.ip_address.clone(),
            mac_address: sandbox.runtime.mac_address.clone(),
            tap_device: sandbox.runtime.tap_device.clone(),
            gateway: "172.16.0.1".to_string(),
        });
        assert!(commands.contains(&reconfigure));
        assert!(!commands.iter().any(|c| c.contains("git clone")));
        assert!(!commands.iter().any(|c| c.starts_with("resize2fs")));

        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Lifecycle
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_stop_start_cycle() -> anyhow::Result<()> {
        let mut h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        let first_pid = sandbox.runtime.pid;

        let stopped = h.orchestrator.stop(&sandbox.id).await?;
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        assert_eq!(stopped.runtime.pid, None);
        assert!(h.env.live_pids().is_empty());
        assert!(h.env.taps().is_empty());
        assert!(!h.env.overlays().is_empty());
        assert!(h
            .orchestrator
            .network()
            .is_allocated(&sandbox.runtime.ip_address));

        let err = h.orchestrator.stop(&sandbox.id).await.unwrap_err();
        assert!(matches!(
            err,
            SandcoreError::InvalidState {
                status: SandboxStatus::Stopped,
                ..
            }
        ));

        let started = h.orchestrator.start(&sandbox.id).await?;
        assert_eq!(started.status, SandboxStatus::Running);
        assert!(started.runtime.pid.is_some());
        assert_ne!(started.runtime.pid, first_pid);
        assert_eq!(started.runtime.ip_address, sandbox.runtime.ip_address);
        assert!(h.env.taps().contains(&sandbox.runtime.tap_device));

        let err = h.orchestrator.start(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, SandcoreError::InvalidState { .. }));

        assert_eq!(
            h.drain_events(),
            vec![
                SandboxEventKind::Created,
                SandboxEventKind::Updated,
                SandboxEventKind::Updated
            ]
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_sandbox_cannot_be_stopped_or_started() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::StartVm);
        assert!(h.orchestrator.spawn(SpawnOptions::default()).await.is_err());

        let id = h.orchestrator.list().await?[0].id.clone();
        assert!(matches!(
            h.orchestrator.stop(&id).await,
            Err(SandcoreError::InvalidState { .. })
        ));
        assert!(matches!(
            h.orchestrator.start(&id).await,
            Err(SandcoreError::InvalidState { .. })
        ));
        assert!(matches!(
            h.orchestrator.stop("nope").await,
            Err(SandcoreError::SandboxNotFound(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_creating_sandbox_cannot_be_stopped_or_started() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let runtime = SandboxRuntime {
            tap_device: "tap-mid".to_string(),
            pid: Some(4242),
            ..Default::default()
        };
        let record = Sandbox::creating("sbx-mid", None, runtime);
        h.store.create(&record).await?;

        let err = h.orchestrator.stop("sbx-mid").await.unwrap_err();
        assert!(matches!(err, SandcoreError::InvalidState { .. }));
        let err = h.orchestrator.start("sbx-mid").await.unwrap_err();
        assert!(matches!(err, SandcoreError::InvalidState { .. }));

        assert!(h.env.taps().is_empty());
        assert!(h.env.live_pids().is_empty());
        assert!(h.env.overlays().is_empty());

        let stored = h.store.get("sbx-mid").await?.unwrap();
        assert_eq!(stored.status, SandboxStatus::Creating);
        assert_eq!(stored.runtime.pid, Some(4242));
        assert_eq!(stored.updated_at, record.updated_at);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_restart_marks_error() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        h.orchestrator.stop(&sandbox.id).await?;

        h.env.inject_fault(SimulatedFault::Configure);
        let err = h.orchestrator.start(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, SandcoreError::HypervisorApi { status: 400, .. }));

        let record = h.orchestrator.get(&sandbox.id).await?;
        assert_eq!(record.status, SandboxStatus::Error);
        assert!(h.env.live_pids().is_empty());
        assert!(h.env.taps().is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_destroy_releases_everything() -> anyhow::Result<()> {
        let mut h = harness(Setup {
            volumes: true,
            ..Default::default()
        });
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;

        h.orchestrator.destroy(&sandbox.id).await?;

        h.assert_nothing_held();
        assert!(!h.env.has_agent_channel(&sandbox.id));
        assert!(matches!(
            h.orchestrator.get(&sandbox.id).await,
            Err(SandcoreError::SandboxNotFound(_))
        ));
        assert_eq!(
            h.drain_events(),
            vec![SandboxEventKind::Created, SandboxEventKind::Deleted]
        );

        let err = h.orchestrator.destroy(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, SandcoreError::SandboxNotFound(_)));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_destroy_stops_hypervisor_before_deleting_volume() -> anyhow::Result<()> {
        let h = harness(Setup {
            volumes: true,
            kill_delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        assert_eq!(h.env.live_pids().len(), 1);

        h.orchestrator.destroy(&sandbox.id).await?;

        let seen = h.storage.live_pids_at_delete.lock().unwrap().clone();
        assert_eq!(seen, vec![Vec::<u32>::new()]);
        h.assert_nothing_held();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_stops_hypervisor_before_deleting_volume() -> anyhow::Result<()> {
        let h = harness(Setup {
            volumes: true,
            kill_delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        h.env.inject_fault(SimulatedFault::BootHang);

        assert!(h.orchestrator.spawn(SpawnOptions::default()).await.is_err());

        let seen = h.storage.live_pids_at_delete.lock().unwrap().clone();
        assert_eq!(seen, vec![Vec::<u32>::new()]);
        h.assert_nothing_held();
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_destroy_after_failed_spawn() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        h.env.inject_fault(SimulatedFault::BootHang);
        assert!(h.orchestrator.spawn(SpawnOptions::default()).await.is_err());

        let id = h.orchestrator.list().await?[0].id.clone();
        h.env.inject_fault(SimulatedFault::DeleteTap);
        h.orchestrator.destroy(&id).await?;

        assert!(h.orchestrator.list().await?.is_empty());
        assert_eq!(h.orchestrator.network().allocated_count(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rehydrate_restores_addresses() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;

        let restarted = Orchestrator::builder()
            .config(h.orchestrator.config().clone())
            .environment(h.env.clone())
            .network(Arc::new(NetworkAllocator::new(
                h.orchestrator.config().get_network().clone(),
            )))
            .store(h.store.clone())
            .build();

        assert_eq!(restarted.rehydrate().await?, 1);
        assert!(restarted
            .network()
            .is_allocated(&sandbox.runtime.ip_address));

        let next = restarted.network().allocate("next")?;
        assert_ne!(next.ip_address, sandbox.runtime.ip_address);
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Liveness
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_status_detects_crashed_hypervisor() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let crashed = h.orchestrator.spawn(SpawnOptions::default()).await?;
        let healthy = h.orchestrator.spawn(SpawnOptions::default()).await?;

        h.env.simulate_crash(crashed.runtime.pid.unwrap());

        let failed = h.orchestrator.check_liveness().await?;
        assert_eq!(failed, vec![crashed.id.clone()]);

        let record = h.orchestrator.get(&crashed.id).await?;
        assert_eq!(record.status, SandboxStatus::Error);
        assert_eq!(
            record.runtime.error.as_deref(),
            Some("hypervisor process is not running")
        );
        assert_eq!(
            h.orchestrator.get(&healthy.id).await?.status,
            SandboxStatus::Running
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_status_repairs_missing_vsock() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        let paths = SandboxPaths::resolve(&h.paths(), &sandbox.id, None);

        h.env.remove_socket_file(&paths.vsock);
        let checked = h.orchestrator.status(&sandbox.id).await?.unwrap();

        assert_eq!(checked.status, SandboxStatus::Running);
        assert!(h.env.sockets().contains(&paths.vsock));
        assert!(!h.env.has_agent_channel(&sandbox.id));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_status_fails_when_vsock_cannot_be_repaired() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        let paths = SandboxPaths::resolve(&h.paths(), &sandbox.id, None);

        h.env.inject_fault(SimulatedFault::SetVsock);
        h.env.remove_socket_file(&paths.vsock);
        let checked = h.orchestrator.status(&sandbox.id).await?.unwrap();

        assert_eq!(checked.status, SandboxStatus::Error);
        assert!(checked
            .runtime
            .error
            .is_some_and(|e| e.starts_with("vsock could not be restored")));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_status_fails_when_sockets_are_gone() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let sandbox = h.orchestrator.spawn(SpawnOptions::default()).await?;
        let paths = SandboxPaths::resolve(&h.paths(), &sandbox.id, None);

        h.env.remove_socket_file(&paths.socket);
        h.env.remove_socket_file(&paths.vsock);
        let checked = h.orchestrator.status(&sandbox.id).await?.unwrap();
        assert_eq!(checked.status, SandboxStatus::Error);

        assert!(h.orchestrator.status("missing").await?.is_none());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_liveness_checker_stops_on_shutdown() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let orchestrator = h.orchestrator.clone();
        let checker = tokio::spawn(async move { orchestrator.run_liveness_checker().await });

        h.orchestrator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), checker).await??;

        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Queue
    //----------------------------------------------------------------------------------------------

    #[test_log::test(tokio::test)]
    async fn test_queue_spawns_through_orchestrator() -> anyhow::Result<()> {
        let h = harness(Setup::default());
        let queue = h.orchestrator.spawn_queue();
        assert_eq!(queue.max_concurrent(), 3);

        let sandbox = queue
            .enqueue_and_wait(SpawnOptions::default(), Some(Duration::from_secs(5)))
            .await?;
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(h.store.list().await?.len(), 1);
        assert_eq!(queue.get_stats().completed, 1);

        Ok(())
    }
}
