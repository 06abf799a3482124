//! `sandutils::path` is a module containing path utilities for the sandcore project.

use std::path::{Path, PathBuf};

use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The extension of a hypervisor control socket.
pub const SOCKET_SUFFIX: &str = "sock";

/// The extension of a host-side vsock channel socket.
pub const VSOCK_SUFFIX: &str = "vsock";

/// The extension of a pid file.
pub const PID_SUFFIX: &str = "pid";

/// The extension of log files.
pub const LOG_SUFFIX: &str = "log";

/// How many bytes from the end of a log are read when collecting a tail.
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves an absolute guest path (e.g. `/home/dev/.gitconfig`) to a location under `root`,
/// where `root` is the host mount point of the guest filesystem.
///
/// `.` components are dropped and `..` is resolved; any attempt to climb above the guest root
/// or a relative input is rejected.
pub fn resolve_guest_path(root: impl AsRef<Path>, guest_path: &str) -> SandutilsResult<PathBuf> {
    if guest_path.is_empty() {
        return Err(SandutilsError::PathValidation(
            "guest path cannot be empty".to_string(),
        ));
    }

    let path = Utf8UnixPathBuf::from(guest_path);
    let mut parts: Vec<&str> = Vec::new();
    let mut saw_root = false;

    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir => saw_root = true,
            Utf8UnixComponent::CurDir => {}
            Utf8UnixComponent::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandutilsError::PathValidation(format!(
                        "guest path escapes the root: {guest_path}"
                    )));
                }
            }
            Utf8UnixComponent::Normal(c) => parts.push(c),
        }
    }

    if !saw_root {
        return Err(SandutilsError::PathValidation(format!(
            "guest path must be absolute: {guest_path}"
        )));
    }

    let mut resolved = root.as_ref().to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

/// Removes a file, treating a missing file as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_file_if_exists(path: impl AsRef<Path>) -> SandutilsResult<bool> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Returns the last `lines` lines of a text file, or an empty string if it cannot be read.
pub async fn tail_file(path: impl AsRef<Path>, lines: usize) -> String {
    let Ok(mut file) = fs::File::open(path.as_ref()).await else {
        return String::new();
    };

    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => return String::new(),
    };

    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return String::new();
    }

    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
