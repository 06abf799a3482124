//! `sandutils::error` is a module containing error utilities for the sandcore project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandutils-related operation.
pub type SandutilsResult<T> = Result<T, SandutilsError>;

/// An error that occurred in one of the host helpers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SandutilsError {
    /// A path failed validation.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// A host command exited with a non-zero status.
    #[error("command `{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,

        /// The exit code, if the process exited normally.
        code: Option<i32>,

        /// Captured standard error.
        stderr: String,
    },

    /// A signal could not be delivered to a process.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// The target process id.
        pid: u32,

        /// The underlying errno.
        source: nix::errno::Errno,
    },

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SandutilsError {
        SandutilsError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SandutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SandutilsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
