use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use sandutils::{remove_file_if_exists, tail_file, write_pid_file};
use tokio::{
    fs,
    process::{Child, Command},
    time,
};

use crate::{models::SandboxPaths, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Number of log lines attached to launch and boot failures.
pub const LOG_TAIL_LINES: usize = 20;

/// Polling interval while waiting for the control socket.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Starts hypervisor processes.
#[derive(Debug, Clone)]
pub struct HypervisorLauncher {
    binary: PathBuf,
    grace: Duration,
    socket_wait: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorLauncher {
    /// Creates a launcher for `binary`.
    ///
    /// `grace` is how long a new process must survive before it counts as started, and
    /// `socket_wait` bounds the wait for its control socket.
    pub fn new(binary: impl Into<PathBuf>, grace: Duration, socket_wait: Duration) -> Self {
        Self {
            binary: binary.into(),
            grace,
            socket_wait,
        }
    }

    /// Launches a hypervisor bound to `paths.socket` and returns its pid.
    ///
    /// A stale socket is removed and the log truncated first. Fails with
    /// [`SandcoreError::HypervisorDied`] when the process exits during the grace period or
    /// before its control socket shows up. A process still running when the launch fails is
    /// killed and reaped before the error is returned.
    pub async fn launch(&self, paths: &SandboxPaths) -> SandcoreResult<u32> {
        for dir in [paths.socket.parent(), paths.log.parent()].into_iter().flatten() {
            fs::create_dir_all(dir).await?;
        }

        remove_file_if_exists(&paths.socket).await?;
        fs::File::create(&paths.log).await?;

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(&paths.socket)
            .arg("--log-path")
            .arg(&paths.log)
            .arg("--level")
            .arg("Warning")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| SandcoreError::HypervisorDied {
                log_tail: "process exited before its pid could be read".to_string(),
            })?;

        if let Err(e) = self.wait_until_ready(&mut child, paths, pid).await {
            // A child that never became usable must not outlive the failed launch.
            if let Err(kill_err) = child.start_kill() {
                tracing::debug!(pid, error = %kill_err, "hypervisor already exited");
            }
            let _ = child.wait().await;
            return Err(e);
        }

        Ok(pid)
    }

    /// The binary this launcher starts.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn wait_until_ready(
        &self,
        child: &mut Child,
        paths: &SandboxPaths,
        pid: u32,
    ) -> SandcoreResult<()> {
        write_pid_file(&paths.pid, pid).await?;
        tracing::debug!(pid, socket = %paths.socket.display(), "hypervisor spawned");

        time::sleep(self.grace).await;
        if let Some(status) = child.try_wait()? {
            tracing::error!(pid, ?status, "hypervisor exited during startup");
            return Err(SandcoreError::HypervisorDied {
                log_tail: tail_file(&paths.log, LOG_TAIL_LINES).await,
            });
        }

        let deadline = time::Instant::now() + self.socket_wait;
        while !paths.socket.exists() {
            if let Some(status) = child.try_wait()? {
                tracing::error!(pid, ?status, "hypervisor exited before binding its socket");
                return Err(SandcoreError::HypervisorDied {
                    log_tail: tail_file(&paths.log, LOG_TAIL_LINES).await,
                });
            }

            if time::Instant::now() >= deadline {
                return Err(SandcoreError::custom(anyhow::anyhow!(
                    "control socket {} did not appear within {}ms",
                    paths.socket.display(),
                    self.socket_wait.as_millis()
                )));
            }

            time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use sandutils::{is_process_alive, read_pid_file, terminate_process};
    use tempfile::tempdir;

    use super::*;
    use crate::config::PathsConfig;

    async fn write_script(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(path)
    }

    #[tokio::test]
    async fn test_launch_writes_pid_and_waits_for_socket() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // Creates the file passed after --api-sock, then idles.
        let bin = write_script(dir.path(), "fc", r#"touch "$2"; exec sleep 30"#).await?;
        let paths = SandboxPaths::resolve(&PathsConfig::contained_in(dir.path()), "sbx1", None);

        let launcher = HypervisorLauncher::new(
            &bin,
            Duration::from_millis(20),
            Duration::from_secs(2),
        );
        let pid = launcher.launch(&paths).await?;

        assert!(is_process_alive(pid));
        assert_eq!(read_pid_file(&paths.pid).await, Some(pid));
        assert!(paths.socket.exists());
        assert!(paths.log.exists());

        terminate_process(pid, Duration::from_millis(200)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_launch_reports_early_death_with_log_tail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // The log path is the 4th argument.
        let bin = write_script(dir.path(), "fc", r#"echo "kvm unavailable" >> "$4"; exit 1"#).await?;
        let paths = SandboxPaths::resolve(&PathsConfig::contained_in(dir.path()), "sbx2", None);

        let launcher = HypervisorLauncher::new(
            &bin,
            Duration::from_millis(200),
            Duration::from_secs(1),
        );
        let err = launcher.launch(&paths).await.unwrap_err();

        match err {
            SandcoreError::HypervisorDied { log_tail } => {
                assert!(log_tail.contains("kvm unavailable"))
            }
            other => panic!("unexpected error: {other}"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_launch_kills_process_without_socket() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // Stays up but never binds its control socket.
        let bin = write_script(dir.path(), "fc", "exec sleep 30").await?;
        let paths = SandboxPaths::resolve(&PathsConfig::contained_in(dir.path()), "sbx3", None);

        let launcher = HypervisorLauncher::new(
            &bin,
            Duration::from_millis(20),
            Duration::from_millis(200),
        );
        let err = launcher.launch(&paths).await.unwrap_err();
        assert!(err.to_string().contains("did not appear"), "{err}");

        let pid = read_pid_file(&paths.pid)
            .await
            .expect("pid file is written before the socket wait");
        assert!(!is_process_alive(pid));

        Ok(())
    }
}
