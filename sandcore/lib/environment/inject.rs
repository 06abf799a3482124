use std::{os::unix::fs::PermissionsExt, path::Path};

use nix::unistd::{chown, Gid, Uid};
use sandutils::resolve_guest_path;
use tokio::fs;

use crate::{agent::GuestFile, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes `files` into the guest filesystem mounted at `root`.
///
/// Parent directories are created. Modes are octal strings; owners are resolved against the
/// guest's own `/etc/passwd`, not the host's.
pub(crate) async fn write_files_under(root: &Path, files: &[GuestFile]) -> SandcoreResult<()> {
    let passwd = fs::read_to_string(root.join("etc/passwd"))
        .await
        .unwrap_or_default();

    for file in files {
        let target = resolve_guest_path(root, &file.path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&target, &file.content).await?;

        if let Some(mode) = &file.mode {
            let mode = u32::from_str_radix(mode, 8).map_err(|_| {
                SandcoreError::Validation(format!("invalid mode {mode} for {}", file.path))
            })?;
            fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
        }

        if let Some(owner) = &file.owner {
            match lookup_owner(&passwd, owner) {
                Some((uid, gid)) => {
                    chown(&target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                        .map_err(SandcoreError::custom)?;
                }
                None => {
                    tracing::warn!(path = %file.path, owner, "unknown guest user, keeping ownership")
                }
            }
        }

        tracing::trace!(path = %file.path, "guest file written");
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Finds `(uid, gid)` of `name` in passwd-formatted text. `root` always resolves.
fn lookup_owner(passwd: &str, name: &str) -> Option<(u32, u32)> {
    let found = passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }

        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        Some((uid, gid))
    });

    found.or_else(|| (name == "root").then_some((0, 0)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
