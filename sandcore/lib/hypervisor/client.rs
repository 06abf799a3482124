use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use hyper::Method;
use serde::Serialize;
use tokio::{fs, time};

use crate::{
    config::{DEFAULT_API_TIMEOUT_MS, GUEST_CID},
    transport::HttpConnection,
    SandcoreError, SandcoreResult,
};

use super::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Talks to one VM's control socket.
///
/// Every call opens its own connection; the hypervisor API serves one request per connection
/// comfortably and a VM is configured with only a handful of calls. Each call, from connect to
/// the last byte of the answer, is bounded by the client's timeout.
#[derive(Debug, Clone)]
pub struct HypervisorClient {
    socket: PathBuf,
    timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorClient {
    /// Creates a client for the control socket at `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: Duration::from_millis(DEFAULT_API_TIMEOUT_MS),
        }
    }

    /// Replaces the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The control socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sets the kernel and its command line.
    pub async fn set_boot_source(
        &self,
        kernel_image_path: impl Into<PathBuf>,
        boot_args: impl Into<String>,
    ) -> SandcoreResult<()> {
        let body = BootSource {
            kernel_image_path: kernel_image_path.into(),
            boot_args: boot_args.into(),
        };
        self.call(Method::PUT, "/boot-source", Some(&body)).await?;
        Ok(())
    }

    /// Attaches a block device.
    pub async fn set_drive(
        &self,
        drive_id: &str,
        path_on_host: impl Into<PathBuf>,
        is_root_device: bool,
        is_read_only: bool,
    ) -> SandcoreResult<()> {
        let body = Drive {
            drive_id: drive_id.to_string(),
            path_on_host: path_on_host.into(),
            is_root_device,
            is_read_only,
        };
        self.call(Method::PUT, &format!("/drives/{drive_id}"), Some(&body))
            .await?;
        Ok(())
    }

    /// Attaches a network interface backed by a host tap device.
    pub async fn set_network_interface(
        &self,
        iface_id: &str,
        guest_mac: &str,
        host_dev_name: &str,
    ) -> SandcoreResult<()> {
        let body = NetworkInterface {
            iface_id: iface_id.to_string(),
            guest_mac: guest_mac.to_string(),
            host_dev_name: host_dev_name.to_string(),
        };
        self.call(
            Method::PUT,
            &format!("/network-interfaces/{iface_id}"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Applies a CPU template read from a JSON file.
    ///
    /// Best-effort: returns `false` when the file is missing or anything fails, and never errors.
    pub async fn set_cpu_config(&self, template_path: impl AsRef<Path>) -> bool {
        let template_path = template_path.as_ref();
        let content = match fs::read(template_path).await {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!(path = %template_path.display(), "no cpu template, skipping");
                return false;
            }
        };

        let template: serde_json::Value = match serde_json::from_slice(&content) {
            Ok(template) => template,
            Err(e) => {
                tracing::warn!(path = %template_path.display(), error = %e, "invalid cpu template");
                return false;
            }
        };

        match self.call(Method::PUT, "/cpu-config", Some(&template)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to apply cpu template");
                false
            }
        }
    }

    /// Sets the vCPU count and memory size.
    pub async fn set_machine_config(&self, vcpu_count: u8, mem_size_mib: u32) -> SandcoreResult<()> {
        let body = MachineConfig {
            vcpu_count,
            mem_size_mib,
        };
        self.call(Method::PUT, "/machine-config", Some(&body))
            .await?;
        Ok(())
    }

    /// Attaches the vsock device backed by the Unix socket at `uds_path`.
    pub async fn set_vsock(&self, uds_path: impl Into<PathBuf>) -> SandcoreResult<()> {
        let body = Vsock {
            guest_cid: GUEST_CID,
            uds_path: uds_path.into(),
        };
        self.call(Method::PUT, "/vsock", Some(&body)).await?;
        Ok(())
    }

    /// Boots the configured VM.
    pub async fn start(&self) -> SandcoreResult<()> {
        let body = InstanceAction {
            action_type: "InstanceStart".to_string(),
        };
        self.call(Method::PUT, "/actions", Some(&body)).await?;
        Ok(())
    }

    /// Pauses the vCPUs.
    pub async fn pause(&self) -> SandcoreResult<()> {
        self.patch_vm_state("Paused").await
    }

    /// Resumes the vCPUs.
    pub async fn resume(&self) -> SandcoreResult<()> {
        self.patch_vm_state("Resumed").await
    }

    /// Reads the instance state.
    pub async fn instance_info(&self) -> SandcoreResult<InstanceInfo> {
        let body = self.call::<()>(Method::GET, "/", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// The VM state. An unreachable socket or malformed answer reads as [`VmState::NotStarted`].
    pub async fn vm_state(&self) -> VmState {
        match self.instance_info().await {
            Ok(info) => VmState::from(info.state.as_str()),
            Err(e) => {
                tracing::trace!(socket = %self.socket.display(), error = %e, "vm state unavailable");
                VmState::NotStarted
            }
        }
    }

    /// Whether the VM is running. Never errors.
    pub async fn is_running(&self) -> bool {
        self.vm_state().await == VmState::Running
    }

    /// Whether the VM is paused. Never errors.
    pub async fn is_paused(&self) -> bool {
        self.vm_state().await == VmState::Paused
    }

    /// Pauses the VM and writes a full snapshot.
    pub async fn create_snapshot(
        &self,
        snapshot_path: impl Into<PathBuf>,
        mem_file_path: impl Into<PathBuf>,
    ) -> SandcoreResult<()> {
        self.pause().await?;

        let body = SnapshotCreate {
            snapshot_type: "Full".to_string(),
            snapshot_path: snapshot_path.into(),
            mem_file_path: mem_file_path.into(),
        };
        self.call(Method::PUT, "/snapshot/create", Some(&body))
            .await?;
        Ok(())
    }

    /// Loads a snapshot into a fresh hypervisor process and resumes it, optionally rebinding
    /// interfaces to new tap devices.
    pub async fn load_snapshot(
        &self,
        snapshot_path: impl Into<PathBuf>,
        mem_file_path: impl Into<PathBuf>,
        network_overrides: Vec<NetworkOverride>,
    ) -> SandcoreResult<()> {
        let body = SnapshotLoad {
            snapshot_path: snapshot_path.into(),
            mem_backend: MemBackend {
                backend_path: mem_file_path.into(),
                backend_type: "File".to_string(),
            },
            enable_diff_snapshots: false,
            resume_vm: true,
            network_overrides,
        };
        self.call(Method::PUT, "/snapshot/load", Some(&body)).await?;
        Ok(())
    }

    async fn patch_vm_state(&self, state: &str) -> SandcoreResult<()> {
        let body = VmStateUpdate {
            state: state.to_string(),
        };
        self.call(Method::PATCH, "/vm", Some(&body)).await?;
        Ok(())
    }

    /// Sends one request, mapping non-2xx answers to [`SandcoreError::HypervisorApi`] and an
    /// expired deadline to a custom error.
    async fn call<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> SandcoreResult<Bytes> {
        let body = body.map(serde_json::to_vec).transpose()?;

        let exchange = async {
            let mut conn = HttpConnection::connect_unix(&self.socket).await?;
            conn.send(method.clone(), path, body).await
        };
        let response = match time::timeout(self.timeout, exchange).await {
            Ok(response) => response?,
            Err(_) => {
                tracing::debug!(%method, path, timeout = ?self.timeout, "hypervisor call timed out");
                return Err(SandcoreError::custom(anyhow::anyhow!(
                    "hypervisor call {method} {path} timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !response.status.is_success() {
            let err = SandcoreError::HypervisorApi {
                status: response.status.as_u16(),
                body: response.text(),
            };
            tracing::debug!(%method, path, error = %err, "hypervisor call rejected");
            return Err(err);
        }

        Ok(response.body)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::transport::testing::{self, RecordedRequest};

    #[tokio::test]
    async fn test_configuration_requests() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("vm.sock");
        let log = testing::serve_at(
            &socket,
            Arc::new(|_: &RecordedRequest| (204, String::new())),
        );

        let client = HypervisorClient::new(&socket);
        client
            .set_boot_source("/k/vmlinux", "console=ttyS0")
            .await?;
        client.set_drive("rootfs", "/o/a.ext4", true, false).await?;
        client
            .set_network_interface("eth0", "06:00:AC:10:00:0A", "tap-abc")
            .await?;
        client.set_machine_config(2, 2048).await?;
        client.set_vsock("/s/a.vsock").await?;
        client.start().await?;

        let recorded = log.lock().unwrap().clone();
        let paths: Vec<_> = recorded
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect();
        assert_eq!(
            paths,
            [
                "PUT /boot-source",
                "PUT /drives/rootfs",
                "PUT /network-interfaces/eth0",
                "PUT /machine-config",
                "PUT /vsock",
                "PUT /actions",
            ]
        );

        let drive: serde_json::Value = serde_json::from_str(&recorded[1].body)?;
        assert_eq!(drive["is_root_device"], true);
        assert_eq!(drive["path_on_host"], "/o/a.ext4");

        let vsock: serde_json::Value = serde_json::from_str(&recorded[4].body)?;
        assert_eq!(vsock["guest_cid"], 3);

        let action: serde_json::Value = serde_json::from_str(&recorded[5].body)?;
        assert_eq!(action["action_type"], "InstanceStart");

        Ok(())
    }

    #[tokio::test]
    async fn test_non_success_is_typed_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("vm.sock");
        testing::serve_at(
            &socket,
            Arc::new(|_: &RecordedRequest| {
                (400, r#"{"fault_message":"bad drive"}"#.to_string())
            }),
        );

        let client = HypervisorClient::new(&socket);
        let err = client
            .set_drive("rootfs", "/missing", true, false)
            .await
            .unwrap_err();

        match err {
            SandcoreError::HypervisorApi { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("bad drive"));
            }
            other => panic!("unexpected error: {other}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_state_queries_swallow_errors() -> anyhow::Result<()> {
        let dir = tempdir()?;

        let client = HypervisorClient::new(dir.path().join("absent.sock"));
        assert_eq!(client.vm_state().await, VmState::NotStarted);
        assert!(!client.is_running().await);
        assert!(!client.is_paused().await);

        let socket = dir.path().join("vm.sock");
        testing::serve_at(
            &socket,
            Arc::new(|_: &RecordedRequest| {
                (200, r#"{"id":"x","state":"Running"}"#.to_string())
            }),
        );
        let client = HypervisorClient::new(&socket);
        assert!(client.is_running().await);
        assert!(!client.is_paused().await);

        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_requests() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("vm.sock");
        let log = testing::serve_at(
            &socket,
            Arc::new(|_: &RecordedRequest| (204, String::new())),
        );

        let client = HypervisorClient::new(&socket);
        client.create_snapshot("/snap/a.snap", "/snap/a.mem").await?;
        client
            .load_snapshot(
                "/snap/a.snap",
                "/snap/a.mem",
                vec![NetworkOverride {
                    iface_id: "eth0".into(),
                    host_dev_name: "tap-new".into(),
                }],
            )
            .await?;

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded[0].path, "/vm");
        assert!(recorded[0].body.contains("Paused"));
        assert_eq!(recorded[1].path, "/snapshot/create");

        let load: serde_json::Value = serde_json::from_str(&recorded[2].body)?;
        assert_eq!(load["mem_backend"]["backend_type"], "File");
        assert_eq!(load["resume_vm"], true);
        assert_eq!(load["network_overrides"][0]["host_dev_name"], "tap-new");

        Ok(())
    }

    #[tokio::test]
    async fn test_cpu_config_is_best_effort() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("vm.sock");
        let log = testing::serve_at(
            &socket,
            Arc::new(|_: &RecordedRequest| (204, String::new())),
        );
        let client = HypervisorClient::new(&socket);

        assert!(!client.set_cpu_config(dir.path().join("none.json")).await);

        let template = dir.path().join("cpu.json");
        fs::write(&template, r#"{"cpuid_modifiers":[]}"#).await?;
        assert!(client.set_cpu_config(&template).await);

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/cpu-config");

        Ok(())
    }

    #[tokio::test]
    async fn test_silent_hypervisor_times_out() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let socket = dir.path().join("vm.sock");
        let listener = tokio::net::UnixListener::bind(&socket)?;

        // Accepts connections and holds them open without ever answering.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = HypervisorClient::new(&socket).with_timeout(Duration::from_millis(100));
        let bound = Duration::from_secs(5);

        assert!(!time::timeout(bound, client.is_running()).await?);
        assert_eq!(time::timeout(bound, client.vm_state()).await?, VmState::NotStarted);

        let err = time::timeout(bound, client.start())
            .await?
            .expect_err("a silent hypervisor must not hang the call");
        assert!(err.to_string().contains("timed out"));
        assert!(!matches!(err, SandcoreError::HypervisorApi { .. }));

        server.abort();
        Ok(())
    }
}
