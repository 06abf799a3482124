use std::{
    env,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use getset::{CopyGetters, Getters};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{SandcoreError, SandcoreResult};

use super::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Points at the TOML configuration file.
pub const SANDCORE_CONFIG_ENV_VAR: &str = "SANDCORE_CONFIG";

/// Overrides [`PathsConfig::sandbox_dir`] and every directory derived from it.
pub const SANDBOX_DIR_ENV_VAR: &str = "SANDBOX_DIR";

/// Overrides [`PathsConfig::log_dir`].
pub const SANDBOX_LOG_DIR_ENV_VAR: &str = "SANDBOX_LOG_DIR";

/// Overrides [`SandcoreConfig::firecracker_bin`].
pub const FIRECRACKER_BIN_ENV_VAR: &str = "FIRECRACKER_BIN";

/// Overrides [`SandcoreConfig::simulated`].
pub const SANDCORE_SIMULATED_ENV_VAR: &str = "SANDCORE_SIMULATED";

/// Overrides [`PathsConfig::database`].
pub const SANDCORE_DB_ENV_VAR: &str = "SANDCORE_DB";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The sandcore configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters)]
#[serde(default)]
pub struct SandcoreConfig {
    /// Directory layout.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    paths: PathsConfig,

    /// The hypervisor binary.
    #[builder(default = PathBuf::from(DEFAULT_FIRECRACKER_BIN), setter(into))]
    #[getset(get = "pub with_prefix")]
    firecracker_bin: PathBuf,

    /// Default VM shape and fleet limits.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    resources: ResourcesConfig,

    /// Guest networking.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    network: NetworkConfig,

    /// Spawn queue tuning.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    queue: QueueConfig,

    /// Deadlines and polling intervals.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    timeouts: TimeoutsConfig,

    /// Guest agent settings.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    agent: AgentConfig,

    /// Guest service ports published through routes.
    #[builder(default)]
    #[getset(get = "pub with_prefix")]
    services: ServicePorts,

    /// Fail a spawn when the guest agent never becomes healthy.
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    require_agent: bool,

    /// Run against the simulated host environment instead of real VMs.
    #[builder(default)]
    #[getset(get_copy = "pub with_prefix")]
    simulated: bool,
}

/// Directory layout of an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct PathsConfig {
    /// Root of all sandbox state.
    #[builder(setter(into))]
    sandbox_dir: PathBuf,

    /// Directory holding `vmlinux`.
    #[builder(setter(into))]
    kernel_dir: PathBuf,

    /// Directory holding base root filesystem images.
    #[builder(setter(into))]
    rootfs_dir: PathBuf,

    /// Directory holding per-sandbox overlay files.
    #[builder(setter(into))]
    overlay_dir: PathBuf,

    /// Directory holding control sockets, vsock sockets and pid files.
    #[builder(setter(into))]
    socket_dir: PathBuf,

    /// Directory holding hypervisor logs.
    #[builder(setter(into))]
    log_dir: PathBuf,

    /// The SQLite database of sandbox records.
    #[builder(setter(into))]
    database: PathBuf,
}

/// Default VM shape and fleet limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default)]
pub struct ResourcesConfig {
    /// Default vCPU count.
    #[builder(default = DEFAULT_VCPUS)]
    vcpus: u8,

    /// Default memory size in MiB.
    #[builder(default = DEFAULT_MEMORY_MB)]
    memory_mb: u32,

    /// Cap on `creating` + `running` sandboxes.
    #[builder(default = DEFAULT_MAX_SANDBOXES)]
    max_sandboxes: usize,

    /// Size cloned volumes are grown to before first boot.
    #[builder(default = DEFAULT_VOLUME_SIZE_GB)]
    volume_size_gb: u32,
}

/// Guest networking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct NetworkConfig {
    /// The guest subnet; the first host address is the gateway.
    guest_network: Ipv4Network,

    /// First octet handed to guests.
    first_host_octet: u8,

    /// The bridge tap devices are attached to.
    #[builder(setter(into))]
    bridge: String,

    /// Nameservers written into the guest's resolv.conf.
    dns_servers: Vec<String>,
}

/// Spawn queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default)]
pub struct QueueConfig {
    /// Explicit concurrency limit; derived from the sandbox cap when unset.
    #[builder(default, setter(strip_option))]
    max_concurrent: Option<usize>,

    /// Attempts beyond the first.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Delay between attempts.
    #[builder(default = DEFAULT_RETRY_DELAY_MS)]
    retry_delay_ms: u64,

    /// Retention of terminal jobs.
    #[builder(default = DEFAULT_JOB_RETENTION_SECS)]
    job_retention_secs: u64,
}

/// Deadlines and polling intervals, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Grace period a new hypervisor process must survive.
    #[builder(default = DEFAULT_LAUNCH_GRACE_MS)]
    launch_grace_ms: u64,

    /// Deadline for the control socket to appear.
    #[builder(default = DEFAULT_SOCKET_WAIT_MS)]
    socket_wait_ms: u64,

    /// Boot deadline.
    #[builder(default = DEFAULT_BOOT_TIMEOUT_MS)]
    boot_ms: u64,

    /// Boot polling interval.
    #[builder(default = DEFAULT_BOOT_POLL_MS)]
    boot_poll_ms: u64,

    /// Agent readiness deadline.
    #[builder(default = DEFAULT_AGENT_WAIT_MS)]
    agent_wait_ms: u64,

    /// Agent readiness polling interval.
    #[builder(default = DEFAULT_AGENT_POLL_MS)]
    agent_poll_ms: u64,

    /// Deadline of one hypervisor control API call.
    #[builder(default = DEFAULT_API_TIMEOUT_MS)]
    api_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL.
    #[builder(default = DEFAULT_KILL_GRACE_MS)]
    kill_grace_ms: u64,

    /// How long a vsock repair waits for the socket file.
    #[builder(default = DEFAULT_VSOCK_REPAIR_MS)]
    vsock_repair_ms: u64,

    /// Deadline of one repository clone.
    #[builder(default = DEFAULT_CLONE_TIMEOUT_MS)]
    clone_ms: u64,

    /// Interval of the background liveness checker, in seconds.
    #[builder(default = DEFAULT_LIVENESS_INTERVAL_SECS)]
    liveness_interval_secs: u64,
}

/// Guest agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default)]
pub struct AgentConfig {
    /// The guest-side vsock port.
    #[builder(default = DEFAULT_AGENT_PORT)]
    port: u32,

    /// Default per-request timeout.
    #[builder(default = DEFAULT_AGENT_TIMEOUT_MS)]
    request_timeout_ms: u64,
}

/// Guest service ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default)]
pub struct ServicePorts {
    /// code-server.
    #[builder(default = 8080)]
    vscode: u16,

    /// opencode.
    #[builder(default = 3000)]
    opencode: u16,

    /// ttyd.
    #[builder(default = 7681)]
    terminal: u16,

    /// sshd.
    #[builder(default = 22)]
    ssh: u16,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandcoreConfig {
    /// Loads the configuration: `.env`, then the TOML file (explicit path or `SANDCORE_CONFIG`),
    /// then environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> SandcoreResult<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(SANDCORE_CONFIG_ENV_VAR).map(PathBuf::from));

        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::from_toml_str(&content)?
            }
            Some(path) => {
                tracing::warn!(
                    path = %path.display(),
                    "configuration file not found, using defaults"
                );
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> SandcoreResult<Self> {
        toml::from_str(content).map_err(|e| SandcoreError::Config(e.to_string()))
    }

    /// Applies `SANDBOX_DIR`, `SANDBOX_LOG_DIR`, `FIRECRACKER_BIN`, `SANDCORE_DB` and
    /// `SANDCORE_SIMULATED`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var(SANDBOX_DIR_ENV_VAR) {
            let log_dir = self.paths.log_dir.clone();
            self.paths = PathsConfig::rooted_at(dir);
            self.paths.log_dir = log_dir;
        }

        if let Ok(dir) = env::var(SANDBOX_LOG_DIR_ENV_VAR) {
            self.paths.log_dir = PathBuf::from(dir);
        }

        if let Ok(db) = env::var(SANDCORE_DB_ENV_VAR) {
            self.paths.database = PathBuf::from(db);
        }

        if let Ok(bin) = env::var(FIRECRACKER_BIN_ENV_VAR) {
            self.firecracker_bin = PathBuf::from(bin);
        }

        if let Ok(flag) = env::var(SANDCORE_SIMULATED_ENV_VAR) {
            self.simulated = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Marks the configuration as simulated.
    pub fn into_simulated(mut self) -> Self {
        self.simulated = true;
        self
    }
}

impl PathsConfig {
    /// Lays every directory out under `sandbox_dir`, keeping the default log directory.
    pub fn rooted_at(sandbox_dir: impl Into<PathBuf>) -> Self {
        let sandbox_dir = sandbox_dir.into();
        Self {
            kernel_dir: sandbox_dir.join("firecracker").join("kernels"),
            rootfs_dir: sandbox_dir.join("firecracker").join("rootfs"),
            overlay_dir: sandbox_dir.join("overlays"),
            socket_dir: sandbox_dir.join("sockets"),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            database: sandbox_dir.join("sandcore.db"),
            sandbox_dir,
        }
    }

    /// Lays every directory, logs included, out under `root`. Used by tests and simulations.
    pub fn contained_in(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut paths = Self::rooted_at(root);
        paths.log_dir = root.join("logs");
        paths
    }
}

impl NetworkConfig {
    /// The gateway address, i.e. the first host of the guest network.
    pub fn gateway(&self) -> Ipv4Addr {
        self.guest_network.nth(1).unwrap_or(self.guest_network.network())
    }
}

impl QueueConfig {
    /// The concurrency limit: explicit, else 3 on hosts allowing more than 3 sandboxes, else 2.
    pub fn effective_max_concurrent(&self, max_sandboxes: usize) -> usize {
        self.max_concurrent
            .unwrap_or(if max_sandboxes > 3 { 3 } else { 2 })
            .max(1)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SandcoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::rooted_at(DEFAULT_SANDBOX_DIR)
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            guest_network: DEFAULT_GUEST_NETWORK
                .parse()
                .expect("default guest network is a valid CIDR"),
            first_host_octet: DEFAULT_FIRST_HOST_OCTET,
            bridge: DEFAULT_BRIDGE.to_string(),
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
