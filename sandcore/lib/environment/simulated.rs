use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{ExecResult, GuestFile},
    models::{MachineShape, SandboxPaths, SnapshotPaths},
    network::NetworkAllocation,
    SandcoreError, SandcoreResult,
};

use super::{SandboxEnvironment, SocketPresence};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Simulated pids start above the largest `pid_max` Linux allows, so they never name a real
/// process.
const FIRST_SIMULATED_PID: u32 = 5_000_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A failure [`SimulatedEnvironment`] can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedFault {
    /// `create_tap` fails.
    CreateTap,

    /// `delete_tap` fails.
    DeleteTap,

    /// `prepare_overlay` fails.
    PrepareOverlay,

    /// `write_guest_files` fails.
    WriteGuestFiles,

    /// The hypervisor dies during launch.
    Launch,

    /// `configure` is rejected by the hypervisor.
    Configure,

    /// `restore_snapshot` is rejected by the hypervisor.
    RestoreSnapshot,

    /// `start_vm` is rejected by the hypervisor.
    StartVm,

    /// The VM never reports running.
    BootHang,

    /// The guest agent never becomes healthy.
    AgentUnavailable,

    /// Guest commands exit non-zero.
    GuestExec,

    /// Guest services fail to start.
    StartService,

    /// `set_vsock` is rejected.
    SetVsock,
}

/// An in-memory host. Processes, sockets, taps and overlays are bookkeeping entries only.
#[derive(Debug)]
pub struct SimulatedEnvironment {
    state: Mutex<SimulatedState>,
    kill_delay: Duration,
}

#[derive(Debug)]
struct SimulatedState {
    next_pid: u32,
    processes: HashMap<u32, SimulatedProcess>,
    taps: BTreeSet<String>,
    overlays: BTreeSet<PathBuf>,
    sockets: BTreeSet<PathBuf>,
    snapshots: BTreeSet<PathBuf>,
    base_images: Option<BTreeSet<PathBuf>>,
    injected_files: HashMap<String, Vec<GuestFile>>,
    pushed_files: HashMap<String, Vec<GuestFile>>,
    exec_log: Vec<(String, String)>,
    services: Vec<(String, String)>,
    agent_channels: BTreeSet<String>,
    faults: HashSet<SimulatedFault>,
}

#[derive(Debug)]
struct SimulatedProcess {
    socket: PathBuf,
    alive: bool,
    booted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedEnvironment {
    /// Creates an empty host where every base image exists.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                next_pid: FIRST_SIMULATED_PID,
                processes: HashMap::new(),
                taps: BTreeSet::new(),
                overlays: BTreeSet::new(),
                sockets: BTreeSet::new(),
                snapshots: BTreeSet::new(),
                base_images: None,
                injected_files: HashMap::new(),
                pushed_files: HashMap::new(),
                exec_log: Vec::new(),
                services: Vec::new(),
                agent_channels: BTreeSet::new(),
                faults: HashSet::new(),
            }),
            kill_delay: Duration::ZERO,
        }
    }

    /// Makes `kill` take `delay` before the process is gone, like a hypervisor that only
    /// exits after its grace period.
    pub fn with_kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = delay;
        self
    }

    /// Restricts the existing base images to `images`.
    pub fn with_base_images(self, images: impl IntoIterator<Item = PathBuf>) -> Self {
        self.lock().base_images = Some(images.into_iter().collect());
        self
    }

    /// Makes `fault` happen on every matching call until cleared.
    pub fn inject_fault(&self, fault: SimulatedFault) {
        self.lock().faults.insert(fault);
    }

    /// Clears a previously injected fault.
    pub fn clear_fault(&self, fault: SimulatedFault) {
        self.lock().faults.remove(&fault);
    }

    /// Registers a prebuild snapshot.
    pub fn add_snapshot(&self, snapshot: &SnapshotPaths) {
        self.lock().snapshots.insert(snapshot.snapshot.clone());
    }

    /// Kills a hypervisor process behind the orchestrator's back.
    pub fn simulate_crash(&self, pid: u32) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.alive = false;
            process.booted = false;
        }
    }

    /// Deletes a socket file behind the orchestrator's back.
    pub fn remove_socket_file(&self, path: &Path) {
        self.lock().sockets.remove(path);
    }

    /// Tap devices that currently exist.
    pub fn taps(&self) -> BTreeSet<String> {
        self.lock().taps.clone()
    }

    /// Overlay files that currently exist.
    pub fn overlays(&self) -> BTreeSet<PathBuf> {
        self.lock().overlays.clone()
    }

    /// Socket files that currently exist.
    pub fn sockets(&self) -> BTreeSet<PathBuf> {
        self.lock().sockets.clone()
    }

    /// Pids of live hypervisor processes.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<_> = self
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Files injected into the root device of `sandbox_id` before boot.
    pub fn injected_files(&self, sandbox_id: &str) -> Vec<GuestFile> {
        self.lock()
            .injected_files
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Files pushed to the running guest of `sandbox_id` through the agent.
    pub fn pushed_files(&self, sandbox_id: &str) -> Vec<GuestFile> {
        self.lock()
            .pushed_files
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every guest command run so far, as `(sandbox_id, command)`.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.lock().exec_log.clone()
    }

    /// Every guest service started so far, as `(sandbox_id, service)`.
    pub fn started_services(&self) -> Vec<(String, String)> {
        self.lock().services.clone()
    }

    /// Whether an agent channel to `sandbox_id` is cached.
    pub fn has_agent_channel(&self, sandbox_id: &str) -> bool {
        self.lock().agent_channels.contains(sandbox_id)
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SimulatedState {
    fn fails(&self, fault: SimulatedFault) -> bool {
        self.faults.contains(&fault)
    }

    fn process_at(&mut self, socket: &Path) -> Option<&mut SimulatedProcess> {
        self.processes
            .values_mut()
            .find(|p| p.alive && p.socket == socket)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SimulatedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxEnvironment for SimulatedEnvironment {
    async fn create_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::CreateTap) {
            return Err(simulated_failure("create tap"));
        }
        state.taps.insert(tap_device.to_string());
        Ok(())
    }

    async fn delete_tap(&self, tap_device: &str) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::DeleteTap) {
            return Err(simulated_failure("delete tap"));
        }
        state.taps.remove(tap_device);
        Ok(())
    }

    async fn prepare_overlay(&self, base: &Path, overlay: &Path) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::PrepareOverlay) {
            return Err(simulated_failure("copy base image"));
        }
        if let Some(images) = &state.base_images {
            if !images.contains(base) {
                return Err(SandcoreError::NoBaseImage(base.display().to_string()));
            }
        }
        state.overlays.insert(overlay.to_path_buf());
        Ok(())
    }

    async fn remove_overlay(&self, overlay: &Path) -> SandcoreResult<()> {
        self.lock().overlays.remove(overlay);
        Ok(())
    }

    async fn root_device_exists(&self, paths: &SandboxPaths) -> bool {
        paths.uses_volume || self.lock().overlays.contains(&paths.root_device)
    }

    async fn snapshot_exists(&self, snapshot: &SnapshotPaths) -> bool {
        self.lock().snapshots.contains(&snapshot.snapshot)
    }

    async fn write_guest_files(
        &self,
        sandbox_id: &str,
        paths: &SandboxPaths,
        files: &[GuestFile],
    ) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::WriteGuestFiles) {
            return Err(simulated_failure("mount root device"));
        }
        if !paths.uses_volume && !state.overlays.contains(&paths.root_device) {
            return Err(simulated_failure("root device missing"));
        }
        state
            .injected_files
            .entry(sandbox_id.to_string())
            .or_default()
            .extend(files.iter().cloned());
        Ok(())
    }

    async fn launch(&self, paths: &SandboxPaths) -> SandcoreResult<u32> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::Launch) {
            return Err(SandcoreError::HypervisorDied {
                log_tail: "simulated: unable to open /dev/kvm".to_string(),
            });
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            SimulatedProcess {
                socket: paths.socket.clone(),
                alive: true,
                booted: false,
            },
        );
        state.sockets.insert(paths.socket.clone());
        Ok(pid)
    }

    async fn configure(
        &self,
        paths: &SandboxPaths,
        _network: &NetworkAllocation,
        _shape: MachineShape,
    ) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::Configure) {
            return Err(api_rejection("machine configuration rejected"));
        }
        if state.process_at(&paths.socket).is_none() {
            return Err(simulated_failure("control socket refused connection"));
        }
        state.sockets.insert(paths.vsock.clone());
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        paths: &SandboxPaths,
        _source: &SandboxPaths,
        snapshot: &SnapshotPaths,
        _network: &NetworkAllocation,
    ) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::RestoreSnapshot) {
            return Err(api_rejection("snapshot load rejected"));
        }
        if !state.snapshots.contains(&snapshot.snapshot) {
            return Err(api_rejection("snapshot file missing"));
        }
        let boots = !state.fails(SimulatedFault::BootHang);
        let Some(process) = state.process_at(&paths.socket) else {
            return Err(simulated_failure("control socket refused connection"));
        };
        process.booted = boots;
        state.sockets.insert(paths.vsock.clone());
        Ok(())
    }

    async fn start_vm(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::StartVm) {
            return Err(api_rejection("InstanceStart rejected"));
        }
        let boots = !state.fails(SimulatedFault::BootHang);
        let Some(process) = state.process_at(&paths.socket) else {
            return Err(simulated_failure("control socket refused connection"));
        };
        process.booted = boots;
        Ok(())
    }

    async fn is_running(&self, paths: &SandboxPaths) -> bool {
        self.lock()
            .process_at(&paths.socket)
            .is_some_and(|p| p.booted)
    }

    async fn set_vsock(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::SetVsock) {
            return Err(api_rejection("vsock device rejected"));
        }
        if state.process_at(&paths.socket).is_none() {
            return Err(simulated_failure("control socket refused connection"));
        }
        state.sockets.insert(paths.vsock.clone());
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.lock().processes.get(&pid).is_some_and(|p| p.alive)
    }

    async fn kill(&self, pid: u32) -> SandcoreResult<()> {
        if !self.kill_delay.is_zero() {
            tokio::time::sleep(self.kill_delay).await;
        }

        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.alive = false;
            process.booted = false;
        }
        Ok(())
    }

    async fn remove_runtime_files(&self, paths: &SandboxPaths) -> SandcoreResult<()> {
        let mut state = self.lock();
        state.sockets.remove(&paths.socket);
        state.sockets.remove(&paths.vsock);
        Ok(())
    }

    async fn socket_presence(&self, paths: &SandboxPaths) -> SocketPresence {
        let state = self.lock();
        SocketPresence {
            control: state.sockets.contains(&paths.socket),
            vsock: state.sockets.contains(&paths.vsock),
        }
    }

    async fn log_tail(&self, _paths: &SandboxPaths) -> String {
        "simulated hypervisor log".to_string()
    }

    async fn wait_for_agent(
        &self,
        sandbox_id: &str,
        _timeout: Duration,
        _interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let mut state = self.lock();
        if cancel.is_cancelled() || state.fails(SimulatedFault::AgentUnavailable) {
            return false;
        }
        state.agent_channels.insert(sandbox_id.to_string());
        true
    }

    async fn guest_exec(
        &self,
        sandbox_id: &str,
        command: &str,
        _timeout: Option<Duration>,
    ) -> SandcoreResult<ExecResult> {
        let mut state = self.lock();
        state
            .exec_log
            .push((sandbox_id.to_string(), command.to_string()));

        if state.fails(SimulatedFault::GuestExec) {
            return Ok(ExecResult {
                exit_code: 128,
                stdout: String::new(),
                stderr: "fatal: simulated failure".to_string(),
            });
        }

        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn guest_write_files(
        &self,
        sandbox_id: &str,
        files: &[GuestFile],
    ) -> SandcoreResult<()> {
        self.lock()
            .pushed_files
            .entry(sandbox_id.to_string())
            .or_default()
            .extend(files.iter().cloned());
        Ok(())
    }

    async fn start_guest_service(&self, sandbox_id: &str, name: &str) -> SandcoreResult<()> {
        let mut state = self.lock();
        if state.fails(SimulatedFault::StartService) {
            return Err(SandcoreError::AgentRequest {
                path: format!("/services/{name}/start"),
                reason: "simulated failure".to_string(),
            });
        }
        state
            .services
            .push((sandbox_id.to_string(), name.to_string()));
        Ok(())
    }

    fn drop_agent_channel(&self, sandbox_id: &str) {
        self.lock().agent_channels.remove(sandbox_id);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn simulated_failure(what: &str) -> SandcoreError {
    SandcoreError::custom(anyhow::anyhow!("simulated failure: {what}"))
}

fn api_rejection(body: &str) -> SandcoreError {
    SandcoreError::HypervisorApi {
        status: 400,
        body: body.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
