//! Tracing setup for the `sandcore` binary.
//!
//! Logs go to stderr, filtered by `RUST_LOG`. With a log directory, a daily rolling file is
//! written as well; keep the returned [`LogGuard`] alive until exit so buffered lines are
//! flushed.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::SandcoreResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "sandcore.log";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Flushes the file writer when dropped.
#[derive(Debug)]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs the global subscriber. Call once from `main`.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> SandcoreResult<LogGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .init();
        return Ok(LogGuard { _file_guard: None });
    };

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();

    Ok(LogGuard {
        _file_guard: Some(guard),
    })
}
