//! Process liveness and termination helpers.

use std::{path::Path, time::Duration};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{fs, time};

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often a terminating process is polled for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether a process with the given pid exists, the same way `kill -0` does.
///
/// A process we lack permission to signal still counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: u32, sig: Signal) -> SandutilsResult<()> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SandutilsError::Signal { pid, source }),
    }
}

/// Terminates a process: SIGTERM, then SIGKILL if it is still alive after `grace`.
///
/// Returns once the process is gone or the kill has been delivered.
pub async fn terminate_process(pid: u32, grace: Duration) -> SandutilsResult<()> {
    if !is_process_alive(pid) {
        return Ok(());
    }

    send_signal(pid, Signal::SIGTERM)?;

    let deadline = time::Instant::now() + grace;
    while time::Instant::now() < deadline {
        reap(pid);
        if !is_process_alive(pid) {
            tracing::debug!(pid, "process exited after SIGTERM");
            return Ok(());
        }
        time::sleep(EXIT_POLL_INTERVAL).await;
    }

    tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::SIGKILL)?;
    reap(pid);

    Ok(())
}

/// Reads a pid file. Returns `None` when it is missing or malformed.
pub async fn read_pid_file(path: impl AsRef<Path>) -> Option<u32> {
    let content = fs::read_to_string(path.as_ref()).await.ok()?;
    content.trim().parse().ok()
}

/// Writes a pid file, creating its parent directory if needed.
pub async fn write_pid_file(path: impl AsRef<Path>, pid: u32) -> SandutilsResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, pid.to_string()).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Collects the exit status if `pid` is our own zombie child so `kill -0` stops seeing it.
fn reap(pid: u32) {
    use nix::sys::wait::{waitpid, WaitPidFlag};
    let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
