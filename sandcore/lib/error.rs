use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

use crate::models::SandboxStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandcore-related operation.
pub type SandcoreResult<T> = Result<T, SandcoreError>;

/// An error that occurred while provisioning or managing a sandbox.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SandcoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error raised by one of the host helpers.
    #[error(transparent)]
    Utils(#[from] sandutils::SandutilsError),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A transport-level HTTP error on a local socket.
    #[error("http transport error: {0}")]
    Http(#[from] hyper::Error),

    /// An invalid HTTP request was constructed.
    #[error("invalid http request: {0}")]
    HttpRequest(#[from] hyper::http::Error),

    /// A spawned task failed to join.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No sandbox with the given id exists.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// A host resource (IP addresses, sandbox slots) has run out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The sandbox is not in a state that permits the requested transition.
    #[error("cannot {action} sandbox {id}: status is {status}, expected {expected}")]
    InvalidState {
        /// The sandbox id.
        id: String,

        /// The attempted action.
        action: &'static str,

        /// The current status.
        status: SandboxStatus,

        /// The status the action requires.
        expected: SandboxStatus,
    },

    /// A caller-supplied value was rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// The hypervisor API answered with a non-2xx status.
    #[error("hypervisor API error [{status}]: {body}")]
    HypervisorApi {
        /// HTTP status code.
        status: u16,

        /// Response body.
        body: String,
    },

    /// The hypervisor process died while starting.
    #[error("hypervisor process died on startup: {log_tail}")]
    HypervisorDied {
        /// The last lines of the hypervisor log.
        log_tail: String,
    },

    /// The VM did not reach the running state in time.
    #[error("VM did not boot within {timeout_ms}ms")]
    BootTimeout {
        /// The boot deadline that elapsed.
        timeout_ms: u64,
    },

    /// The guest agent channel handshake was rejected or malformed.
    #[error("agent handshake failed: {0}")]
    AgentHandshake(String),

    /// A request to the guest agent failed.
    #[error("agent request {path} failed: {reason}")]
    AgentRequest {
        /// The request path.
        path: String,

        /// What went wrong.
        reason: String,
    },

    /// The guest agent never reported healthy.
    #[error("agent for sandbox {0} did not become healthy")]
    AgentUnavailable(String),

    /// A command run inside the guest failed.
    #[error("guest command failed ({context}): {stderr}")]
    GuestCommand {
        /// What the command was for.
        context: String,

        /// The command's stderr, or stdout when stderr was empty.
        stderr: String,
    },

    /// No base image could be found to clone the root device from.
    #[error("no base image available: {0}")]
    NoBaseImage(String),

    /// The storage provider failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The route provider failed.
    #[error("route registration error: {0}")]
    Route(String),

    /// A queued spawn did not finish before its deadline.
    #[error("spawn timeout")]
    SpawnTimeout,

    /// A queued spawn was cancelled before it started.
    #[error("cancelled")]
    JobCancelled,

    /// A queued spawn failed after all retries.
    #[error("spawn job {job_id} failed: {message}")]
    SpawnFailed {
        /// The job id.
        job_id: String,

        /// The final error message.
        message: String,
    },
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SandcoreError {
        SandcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// The HTTP status an API layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            SandcoreError::SandboxNotFound(_) => 404,
            SandcoreError::InvalidState { .. } => 409,
            SandcoreError::Validation(_) => 400,
            SandcoreError::ResourceExhausted(_) => 429,
            SandcoreError::AgentUnavailable(_) | SandcoreError::SpawnTimeout => 503,
            _ => 500,
        }
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

/// Creates an `Ok` `SandcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SandcoreResult<T> {
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
