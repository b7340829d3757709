//! Error types for leasepool.

use leasepool_protocol::OpResult;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using leasepool's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in leasepool operations.
#[derive(Error, Debug)]
pub enum Error {
    // Catalog and lease preconditions
    /// Device is not in the catalog.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No available device matched the lease criteria.
    #[error("no available device matches: {0}")]
    NoMatch(String),

    /// Identity is not a known user.
    #[error("user not recognized as valid user: {0}")]
    UnknownUser(String),

    /// Device is not currently leased.
    #[error("device not leased: {0}")]
    NotLeased(String),

    /// Device is leased by someone else.
    #[error("device {device} not leased by {actor}")]
    NotLessee {
        /// Device name.
        device: String,
        /// Identity that attempted the action.
        actor: String,
    },

    /// Device is already leased.
    #[error("device {device} already leased by {lessor}")]
    AlreadyLeased {
        /// Device name.
        device: String,
        /// Current lessor.
        lessor: String,
    },

    /// Device is physical but a VM operation was requested.
    #[error("device is not a virtual machine: {0}")]
    NotVirtual(String),

    /// Identity is not on the device's permitted-user list.
    #[error("user {user} not permitted to lease {device}")]
    NotPermitted {
        /// Device name.
        device: String,
        /// Rejected identity.
        user: String,
    },

    /// Identity lacks the privilege for an administrative operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Device already exists in the catalog.
    #[error("device already exists: {0}")]
    DeviceExists(String),

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Snapshot name rejected by the binding rules.
    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    /// Host name unusable as a ping target.
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    // Backend errors
    /// Device names a hypervisor binding that is not configured.
    #[error("hypervisor not found: {0}")]
    HypervisorNotFound(String),

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// Backend control plane rejected or failed a request.
    #[error("{backend} error: {message}")]
    Backend {
        /// Backend name.
        backend: String,
        /// Error message.
        message: String,
    },

    /// HTTP transport error talking to a control plane.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Named snapshot does not exist on the backend.
    #[error("snapshot not found: {vm}/{snapshot}")]
    SnapshotNotFound {
        /// VM name.
        vm: String,
        /// Snapshot name.
        snapshot: String,
    },

    /// Backend does not support the operation.
    #[error("{backend} does not implement {operation}")]
    NotImplemented {
        /// Backend name.
        backend: String,
        /// Operation name.
        operation: &'static str,
    },

    // Polling outcomes
    /// Desired state not observed before the deadline.
    #[error("timed out waiting for {what} to become {desired}; last state {last}")]
    Timeout {
        /// What was being polled.
        what: String,
        /// Desired state.
        desired: String,
        /// Last observed state.
        last: String,
    },

    /// Abort state observed while polling.
    #[error("{what} entered {state} while waiting for {desired}")]
    WaitAborted {
        /// What was being polled.
        what: String,
        /// Desired state.
        desired: String,
        /// Abort state that was observed.
        state: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config {}: {message}", path.display())]
    ConfigLoad {
        /// Config file path.
        path: PathBuf,
        /// Parse or read error.
        message: String,
    },

    // Storage errors
    /// Catalog or lease file could not be read or written.
    #[error("storage error: {}: {message}", path.display())]
    Storage {
        /// File path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Create a not implemented error.
    pub fn not_implemented(backend: impl Into<String>, operation: &'static str) -> Self {
        Self::NotImplemented {
            backend: backend.into(),
            operation,
        }
    }

    /// Create a storage error.
    pub fn storage(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Failed operation result carrying this error's message and code.
    pub fn to_result(&self) -> OpResult {
        OpResult::failed(self.to_string(), self.code())
    }

    /// Whether this is a polling timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Stable category code reported in operation results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DeviceNotFound(_)
            | Error::NoMatch(_)
            | Error::HypervisorNotFound(_)
            | Error::SnapshotNotFound { .. } => "NOT_FOUND",
            Error::UnknownUser(_) | Error::Unauthorized(_) | Error::NotPermitted { .. } => {
                "UNAUTHORIZED"
            }
            Error::NotLeased(_)
            | Error::NotLessee { .. }
            | Error::AlreadyLeased { .. }
            | Error::NotVirtual(_)
            | Error::DeviceExists(_)
            | Error::InvalidState { .. }
            | Error::InvalidSnapshotName(_)
            | Error::InvalidHostname(_) => "PRECONDITION",
            Error::CommandFailed { .. }
            | Error::Backend { .. }
            | Error::Http(_)
            | Error::WaitAborted { .. } => "BACKEND",
            Error::Timeout { .. } => "TIMEOUT",
            Error::NotImplemented { .. } => "NOT_IMPLEMENTED",
            Error::Config(_)
            | Error::ConfigLoad { .. }
            | Error::Storage { .. }
            | Error::Json(_)
            | Error::Io(_) => "INTERNAL",
        }
    }
}
