use std::{
    fmt::{self, Display},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SandcoreError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sandbox is a microVM provisioned for one developer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    /// The sandbox id. Every derived resource name is namespaced by it.
    pub id: String,

    /// The lifecycle status.
    pub status: SandboxStatus,

    /// The owning workspace, if any.
    pub workspace_id: Option<String>,

    /// Mutable runtime information.
    pub runtime: SandboxRuntime,

    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,

    /// When the sandbox was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// The lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// The spawn pipeline is running.
    Creating,

    /// The VM is booted.
    Running,

    /// The VM process is gone but the volume is kept.
    Stopped,

    /// Spawn or a liveness check failed.
    Error,
}

/// Runtime information about a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRuntime {
    /// The guest IPv4 address.
    pub ip_address: String,

    /// The guest MAC address.
    pub mac_address: String,

    /// The host tap device name.
    pub tap_device: String,

    /// The hypervisor process id while the VM is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Public URLs for the guest services.
    #[serde(default)]
    pub urls: ServiceUrls,

    /// Number of vCPUs.
    pub vcpus: u8,

    /// Memory size in MiB.
    pub memory_mb: u32,

    /// The logical volume backing the root device, when volumes are in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,

    /// Whether the root device was cloned from a prebuild.
    #[serde(default)]
    pub used_prebuild: bool,

    /// The last error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Public URLs for the services running in a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUrls {
    /// Browser-based VS Code.
    pub vscode: String,

    /// The opencode web UI.
    pub opencode: String,

    /// The web terminal.
    pub terminal: String,

    /// SSH connection string.
    pub ssh: String,

    /// Optional browser preview.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// A fresh record in the `creating` state.
    pub fn creating(
        id: impl Into<String>,
        workspace_id: Option<String>,
        runtime: SandboxRuntime,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SandboxStatus::Creating,
            workspace_id,
            runtime,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the sandbox counts against the active-sandbox cap.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SandboxStatus::Creating | SandboxStatus::Running
        )
    }
}

impl SandboxStatus {
    /// Returns the lowercase name used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = SandcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SandboxStatus::Creating),
            "running" => Ok(SandboxStatus::Running),
            "stopped" => Ok(SandboxStatus::Stopped),
            "error" => Ok(SandboxStatus::Error),
            other => Err(SandcoreError::Validation(format!(
                "unknown sandbox status: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
