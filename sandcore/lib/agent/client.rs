use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as SyncMutex},
    time::Duration,
};

use hyper::Method;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sandutils::VSOCK_SUFFIX;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::Mutex, time};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AgentConfig, transport::HttpConnection, SandcoreError, SandcoreResult,
};

use super::{channel::open_channel, *};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Command budget used by `exec` when the caller gives none.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Added to a command's budget to get the request timeout.
const EXEC_MARGIN: Duration = Duration::from_secs(5);

/// Request timeout of `dev_start`.
const DEV_START_TIMEOUT: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type Channel = Arc<Mutex<HttpConnection>>;

/// Talks to the in-guest agent of every sandbox over its vsock channel.
///
/// Channels are opened lazily, one per sandbox, and reused across requests. Any failed
/// request discards the channel and is retried exactly once over a fresh one.
pub struct AgentClient {
    socket_dir: PathBuf,
    port: u32,
    default_timeout: Duration,
    channels: SyncMutex<HashMap<String, Channel>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentClient {
    /// Creates a client resolving vsock sockets under `socket_dir`.
    pub fn new(socket_dir: impl Into<PathBuf>, config: &AgentConfig) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            port: config.get_port(),
            default_timeout: Duration::from_millis(config.get_request_timeout_ms()),
            channels: SyncMutex::new(HashMap::new()),
        }
    }

    /// `GET /health`
    pub async fn health(&self, sandbox_id: &str) -> SandcoreResult<AgentHealth> {
        self.get(sandbox_id, "/health").await
    }

    /// `GET /metrics`
    pub async fn metrics(&self, sandbox_id: &str) -> SandcoreResult<AgentMetrics> {
        self.get(sandbox_id, "/metrics").await
    }

    /// `GET /config`
    pub async fn config(&self, sandbox_id: &str) -> SandcoreResult<serde_json::Value> {
        self.get(sandbox_id, "/config").await
    }

    /// `GET /editor-config`
    pub async fn editor_config(&self, sandbox_id: &str) -> SandcoreResult<serde_json::Value> {
        self.get(sandbox_id, "/editor-config").await
    }

    /// Runs a shell command in the guest. The request is allowed `timeout` plus a margin,
    /// `timeout` defaulting to 30s.
    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> SandcoreResult<ExecResult> {
        let budget = timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
        let body = ExecRequest {
            command: command.to_string(),
            timeout: timeout.map(|t| t.as_millis() as u64),
        };

        self.request(
            sandbox_id,
            Method::POST,
            "/exec",
            Some(&body),
            budget + EXEC_MARGIN,
        )
        .await
    }

    /// Runs several commands in one request. The request timeout is the longest command budget
    /// plus a margin.
    pub async fn batch_exec(
        &self,
        sandbox_id: &str,
        commands: &[BatchCommand],
    ) -> SandcoreResult<Vec<BatchExecResult>> {
        let longest = commands
            .iter()
            .map(|c| c.timeout.map(Duration::from_millis).unwrap_or(DEFAULT_EXEC_TIMEOUT))
            .max()
            .unwrap_or(DEFAULT_EXEC_TIMEOUT);

        let response: BatchExecResponse = self
            .request(
                sandbox_id,
                Method::POST,
                "/exec/batch",
                Some(&BatchExecRequest { commands }),
                longest + EXEC_MARGIN,
            )
            .await?;

        Ok(response.results)
    }

    /// `GET /apps`
    pub async fn list_apps(&self, sandbox_id: &str) -> SandcoreResult<Vec<AppPort>> {
        self.get(sandbox_id, "/apps").await
    }

    /// `POST /apps`
    pub async fn register_app(
        &self,
        sandbox_id: &str,
        port: u16,
        name: &str,
    ) -> SandcoreResult<AppPort> {
        let body = RegisterAppRequest { port, name };
        self.request(sandbox_id, Method::POST, "/apps", Some(&body), self.default_timeout)
            .await
    }

    /// `DELETE /apps/{port}`
    pub async fn unregister_app(&self, sandbox_id: &str, port: u16) -> SandcoreResult<Ack> {
        self.request::<(), _>(
            sandbox_id,
            Method::DELETE,
            &format!("/apps/{port}"),
            None,
            self.default_timeout,
        )
        .await
    }

    /// `GET /config/discover`
    pub async fn discover_configs(
        &self,
        sandbox_id: &str,
    ) -> SandcoreResult<Vec<DiscoveredConfig>> {
        let response: DiscoverConfigsResponse = self.get(sandbox_id, "/config/discover").await?;
        Ok(response.configs)
    }

    /// `GET /config/read?path=...`
    pub async fn read_config(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> SandcoreResult<ConfigFileContent> {
        let path = format!(
            "/config/read?path={}",
            utf8_percent_encode(path, NON_ALPHANUMERIC)
        );
        self.get(sandbox_id, &path).await
    }

    /// `GET /dev`
    pub async fn dev_list(&self, sandbox_id: &str) -> SandcoreResult<Vec<DevCommandStatus>> {
        let response: DevListResponse = self.get(sandbox_id, "/dev").await?;
        Ok(response.commands)
    }

    /// `POST /dev/{name}/start`
    pub async fn dev_start(
        &self,
        sandbox_id: &str,
        name: &str,
        command: &DevCommand,
    ) -> SandcoreResult<DevStartResult> {
        self.request(
            sandbox_id,
            Method::POST,
            &format!("/dev/{}/start", encode_segment(name)),
            Some(command),
            DEV_START_TIMEOUT,
        )
        .await
    }

    /// `POST /dev/{name}/stop`
    pub async fn dev_stop(&self, sandbox_id: &str, name: &str) -> SandcoreResult<StopResult> {
        self.request::<(), _>(
            sandbox_id,
            Method::POST,
            &format!("/dev/{}/stop", encode_segment(name)),
            None,
            self.default_timeout,
        )
        .await
    }

    /// `GET /dev/{name}/logs`
    pub async fn dev_logs(
        &self,
        sandbox_id: &str,
        name: &str,
        offset: u64,
        limit: u64,
    ) -> SandcoreResult<DevLogs> {
        let path = format!(
            "/dev/{}/logs?offset={offset}&limit={limit}",
            encode_segment(name)
        );
        self.get(sandbox_id, &path).await
    }

    /// Writes files into the guest. Fails when any single file was not written.
    pub async fn write_files(
        &self,
        sandbox_id: &str,
        files: &[GuestFile],
    ) -> SandcoreResult<Vec<FileWriteResult>> {
        let response: WriteFilesResponse = self
            .request(
                sandbox_id,
                Method::POST,
                "/files/write",
                Some(&WriteFilesRequest { files }),
                self.default_timeout,
            )
            .await?;

        if let Some(failed) = response.results.iter().find(|r| !r.success) {
            return Err(SandcoreError::GuestCommand {
                context: format!("write {}", failed.path),
                stderr: failed.error.clone().unwrap_or_default(),
            });
        }

        Ok(response.results)
    }

    /// `GET /services`
    pub async fn list_services(&self, sandbox_id: &str) -> SandcoreResult<Vec<ServiceStatus>> {
        let response: ServicesResponse = self.get(sandbox_id, "/services").await?;
        Ok(response.services)
    }

    /// `POST /services/{name}/start`
    pub async fn start_service(
        &self,
        sandbox_id: &str,
        name: &str,
    ) -> SandcoreResult<ServiceStatus> {
        self.request::<(), _>(
            sandbox_id,
            Method::POST,
            &format!("/services/{}/start", encode_segment(name)),
            None,
            DEV_START_TIMEOUT,
        )
        .await
    }

    /// `POST /services/{name}/stop`
    pub async fn stop_service(&self, sandbox_id: &str, name: &str) -> SandcoreResult<StopResult> {
        self.request::<(), _>(
            sandbox_id,
            Method::POST,
            &format!("/services/{}/stop", encode_segment(name)),
            None,
            self.default_timeout,
        )
        .await
    }

    /// Polls `health` every `interval` until the agent reports healthy, `timeout` elapses or
    /// `cancel` fires. Never errors.
    pub async fn wait_for_agent(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = time::Instant::now() + timeout;

        loop {
            match self.health(sandbox_id).await {
                Ok(health) if health.is_healthy() => {
                    tracing::info!(sandbox_id, "agent is healthy");
                    return true;
                }
                Ok(health) => {
                    tracing::debug!(sandbox_id, status = %health.status, "agent not ready yet")
                }
                Err(e) => tracing::debug!(sandbox_id, error = %e, "agent not reachable yet"),
            }

            if time::Instant::now() + interval >= deadline {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(sandbox_id, "agent wait cancelled");
                    return false;
                }
                _ = time::sleep(interval) => {}
            }
        }

        tracing::warn!(
            sandbox_id,
            timeout_ms = timeout.as_millis() as u64,
            "agent did not become healthy in time"
        );
        false
    }

    /// Drops the channel of `sandbox_id`, if any.
    pub fn disconnect(&self, sandbox_id: &str) {
        if self.lock().remove(sandbox_id).is_some() {
            tracing::debug!(sandbox_id, "agent channel dropped");
        }
    }

    /// Whether a channel to `sandbox_id` is currently held.
    pub fn is_connected(&self, sandbox_id: &str) -> bool {
        self.lock().contains_key(sandbox_id)
    }

    /// The vsock socket of `sandbox_id`.
    pub fn vsock_path(&self, sandbox_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{sandbox_id}.{VSOCK_SUFFIX}"))
    }

    async fn get<T: DeserializeOwned>(&self, sandbox_id: &str, path: &str) -> SandcoreResult<T> {
        self.request::<(), _>(sandbox_id, Method::GET, path, None, self.default_timeout)
            .await
    }

    /// Sends a request, retrying once over a fresh channel when the first attempt fails.
    async fn request<B, T>(
        &self,
        sandbox_id: &str,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> SandcoreResult<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let body = body.map(serde_json::to_vec).transpose()?;

        match self
            .attempt(sandbox_id, method.clone(), path, body.clone(), timeout)
            .await
        {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::debug!(sandbox_id, path, error = %first, "agent request failed, retrying");
                self.disconnect(sandbox_id);

                let result = self.attempt(sandbox_id, method, path, body, timeout).await;
                if result.is_err() {
                    self.disconnect(sandbox_id);
                }
                result
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        sandbox_id: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> SandcoreResult<T> {
        let exchange = async {
            let channel = self.channel(sandbox_id).await?;
            let mut conn = channel.lock().await;
            if conn.is_closed() {
                return Err(request_error(path, "channel closed"));
            }

            let response = conn
                .send(method, path, body)
                .await
                .map_err(|e| request_error(path, e))?;

            if !response.status.is_success() {
                return Err(request_error(
                    path,
                    format!("status {}: {}", response.status.as_u16(), response.text()),
                ));
            }

            serde_json::from_slice(&response.body).map_err(|e| request_error(path, e))
        };

        time::timeout(timeout, exchange).await.map_err(|_| {
            request_error(path, format!("timed out after {}ms", timeout.as_millis()))
        })?
    }

    /// The channel of `sandbox_id`, opened if none is held. The map lock is not held while
    /// the handshake runs.
    async fn channel(&self, sandbox_id: &str) -> SandcoreResult<Channel> {
        let existing = self.lock().get(sandbox_id).cloned();
        if let Some(channel) = existing {
            return Ok(channel);
        }

        let conn = open_channel(&self.vsock_path(sandbox_id), self.port).await?;
        let channel = Arc::new(Mutex::new(conn));
        let channel = self
            .lock()
            .entry(sandbox_id.to_string())
            .or_insert(channel)
            .clone();

        Ok(channel)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The socket directory.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn request_error(path: &str, reason: impl ToString) -> SandcoreError {
    SandcoreError::AgentRequest {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
