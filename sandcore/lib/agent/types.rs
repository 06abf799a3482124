use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    /// `healthy` once the agent is ready.
    pub status: String,

    /// The sandbox id the guest believes it is.
    #[serde(default)]
    pub sandbox_id: Option<String>,

    /// Which guest services are up.
    #[serde(default)]
    pub services: BTreeMap<String, bool>,

    /// Guest uptime in seconds.
    #[serde(default)]
    pub uptime: f64,
}

/// Used/free/total figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Total capacity.
    pub total: u64,

    /// Used capacity.
    pub used: u64,

    /// Free capacity.
    pub free: u64,
}

/// `GET /metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// CPU utilisation in percent.
    pub cpu: f64,

    /// Memory in bytes.
    pub memory: Usage,

    /// Root filesystem in bytes.
    pub disk: Usage,

    /// When the sample was taken.
    pub timestamp: String,
}

/// `POST /exec` request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRequest {
    /// Shell command line.
    pub command: String,

    /// Execution budget in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Result of a guest command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    /// Exit code.
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,
}

/// One command of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchCommand {
    /// Caller-chosen id echoed in the result.
    pub id: String,

    /// Shell command line.
    pub command: String,

    /// Execution budget in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `POST /exec/batch` request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct BatchExecRequest<'a> {
    pub commands: &'a [BatchCommand],
}

/// One result of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchExecResult {
    /// The command id.
    pub id: String,

    /// Exit code.
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,
}

/// `POST /exec/batch` response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BatchExecResponse {
    pub results: Vec<BatchExecResult>,
}

/// A registered application port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPort {
    /// Guest port.
    pub port: u16,

    /// Display name.
    pub name: String,

    /// Registration time.
    pub registered_at: String,
}

/// `POST /apps` request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RegisterAppRequest<'a> {
    pub port: u16,
    pub name: &'a str,
}

/// A `{ success }` acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the operation took effect.
    pub success: bool,
}

/// A configuration file the agent knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredConfig {
    /// Absolute guest path.
    pub path: String,

    /// Path shown to users, e.g. with `~`.
    pub display_path: String,

    /// `opencode`, `vscode` or `other`.
    pub category: String,

    /// Whether the file exists.
    pub exists: bool,

    /// Size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscoverConfigsResponse {
    pub configs: Vec<DiscoveredConfig>,
}

/// `GET /config/read`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileContent {
    /// Absolute guest path.
    pub path: String,

    /// Path shown to users.
    pub display_path: String,

    /// File content.
    pub content: String,

    /// `json` or `text`.
    pub content_type: String,

    /// Size in bytes.
    pub size: u64,
}

/// A long-running developer command inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevCommandStatus {
    /// Command name.
    pub name: String,

    /// `running`, `stopped`, ...
    pub status: String,

    /// Process id.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Port the command serves on.
    #[serde(default)]
    pub port: Option<u16>,

    /// Start time.
    #[serde(default)]
    pub started_at: Option<String>,

    /// Exit code once stopped.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DevListResponse {
    pub commands: Vec<DevCommandStatus>,
}

/// `POST /dev/{name}/start` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevCommand {
    /// Shell command line.
    pub command: String,

    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Extra environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Port the command serves on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `POST /dev/{name}/start` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevStartResult {
    /// New status.
    pub status: String,

    /// Command name.
    pub name: String,

    /// Process id.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Where output is written.
    #[serde(default)]
    pub log_file: Option<String>,

    /// Start time.
    #[serde(default)]
    pub started_at: Option<String>,
}

/// Response of the stop endpoints for dev commands and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    /// New status.
    pub status: String,

    /// Command or service name.
    pub name: String,

    /// Process id that was stopped.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Human readable note.
    #[serde(default)]
    pub message: Option<String>,

    /// Exit code.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// `GET /dev/{name}/logs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevLogs {
    /// Command name.
    pub name: String,

    /// Log content from the requested offset.
    pub content: String,

    /// Offset to pass on the next call.
    pub next_offset: u64,
}

/// A file written by `POST /files/write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestFile {
    /// Absolute guest path.
    pub path: String,

    /// File content.
    pub content: String,

    /// Octal mode, e.g. `600`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// `dev` or `root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WriteFilesRequest<'a> {
    pub files: &'a [GuestFile],
}

/// Per-file outcome of `POST /files/write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWriteResult {
    /// Guest path.
    pub path: String,

    /// Whether it was written.
    pub success: bool,

    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WriteFilesResponse {
    pub results: Vec<FileWriteResult>,
}

/// A managed guest service (code-server, opencode, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Service name.
    pub name: String,

    /// Whether it is running.
    pub running: bool,

    /// Process id.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Listening port.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServicesResponse {
    pub services: Vec<ServiceStatus>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentHealth {
    /// Whether the agent reports itself ready.
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

impl ExecResult {
    /// Whether the command exited with 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl GuestFile {
    /// A file with default mode and ownership.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: None,
            owner: None,
        }
    }

    /// Sets the octal mode.
    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }
}
