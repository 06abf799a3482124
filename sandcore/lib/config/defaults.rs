//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs per sandbox.
pub const DEFAULT_VCPUS: u8 = 2;

/// The default memory per sandbox in MiB.
pub const DEFAULT_MEMORY_MB: u32 = 2048;

/// The default cap on `creating` + `running` sandboxes.
pub const DEFAULT_MAX_SANDBOXES: usize = 20;

/// The default size of a cloned volume in GiB.
pub const DEFAULT_VOLUME_SIZE_GB: u32 = 50;

/// Root of all sandbox state.
pub const DEFAULT_SANDBOX_DIR: &str = "/var/lib/sandbox";

/// Where hypervisor logs are written.
pub const DEFAULT_LOG_DIR: &str = "/var/log/sandbox";

/// The hypervisor binary.
pub const DEFAULT_FIRECRACKER_BIN: &str = "/usr/local/bin/firecracker";

/// The guest subnet.
pub const DEFAULT_GUEST_NETWORK: &str = "172.16.0.0/24";

/// First host octet handed to guests; lower ones are reserved for the host side.
pub const DEFAULT_FIRST_HOST_OCTET: u8 = 10;

/// The bridge tap devices are attached to.
pub const DEFAULT_BRIDGE: &str = "br0";

/// The guest-side vsock port the agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 9998;

/// The context id assigned to every guest.
pub const GUEST_CID: u32 = 3;

/// Default per-request agent timeout.
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 10_000;

/// Spawn attempts beyond the first before a job is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Delay between spawn attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// How long terminal jobs are kept.
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 3600;

/// Boot deadline, also the default `enqueue_and_wait` deadline.
pub const DEFAULT_BOOT_TIMEOUT_MS: u64 = 30_000;

/// How long to wait for the guest agent after boot.
pub const DEFAULT_AGENT_WAIT_MS: u64 = 60_000;

/// Polling interval while waiting for the guest agent.
pub const DEFAULT_AGENT_POLL_MS: u64 = 2_000;

/// Grace period a freshly launched hypervisor must survive.
pub const DEFAULT_LAUNCH_GRACE_MS: u64 = 50;

/// How long to wait for a freshly launched hypervisor's control socket.
pub const DEFAULT_SOCKET_WAIT_MS: u64 = 2_000;

/// Polling interval while waiting for boot.
pub const DEFAULT_BOOT_POLL_MS: u64 = 50;

/// Deadline of one hypervisor control API call.
pub const DEFAULT_API_TIMEOUT_MS: u64 = 5_000;

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE_MS: u64 = 500;

/// How long a vsock repair waits for the socket file to reappear.
pub const DEFAULT_VSOCK_REPAIR_MS: u64 = 2_000;

/// Deadline of a single in-guest `git clone`.
pub const DEFAULT_CLONE_TIMEOUT_MS: u64 = 120_000;

/// Interval of the background liveness checker.
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 30;
