//! Thin wrappers for running host commands (`ip`, `mount`, `cp`, ...).

use std::process::Stdio;

use tokio::process::Command;

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The captured result of a host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `program` with `args`, returning its output whatever the exit status.
pub async fn run_unchecked<I, S>(program: &str, args: I) -> SandutilsResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    tracing::trace!(program, ?args, "running host command");

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs `program` with `args` and fails with [`SandutilsError::CommandFailed`] on a non-zero exit.
pub async fn run<I, S>(program: &str, args: I) -> SandutilsResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    let output = run_unchecked(program, &args).await?;

    if !output.success() {
        return Err(SandutilsError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(output)
}

/// Runs a script through `sh -c`.
pub async fn run_shell(script: &str) -> SandutilsResult<CommandOutput> {
    run("sh", ["-c", script]).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() -> anyhow::Result<()> {
        let output = run("echo", ["hello", "sandbox"]).await?;
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello sandbox");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_fails_on_non_zero_exit() {
        let err = run_shell("echo boom >&2; exit 3").await.unwrap_err();
        match err {
            SandutilsError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_unchecked_keeps_status() -> anyhow::Result<()> {
        let output = run_unchecked("sh", ["-c", "exit 1"]).await?;
        assert!(!output.success());
        assert_eq!(output.code, Some(1));
        Ok(())
    }
}
