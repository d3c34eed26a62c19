//! Error types for the jedi process runtime.
//!
//! Every fallible runtime operation returns [`RuntimeResult`]. The variants
//! fall into four groups:
//!
//! - spawn failures (`ForkFailed`, `SharedMemoryAllocationFailed`,
//!   `SetUidFailed`, `SetGidFailed`, `ExecFailed`) and abnormal termination
//!   (`Signaled`), re-surfaced from a process's recorded outcome on every read;
//! - lifecycle misuse (`IllegalState`, `Interrupted`);
//! - access and I/O problems (`PermissionDenied`, `Io`, `StreamUnavailable`,
//!   `NoSuchProcess`);
//! - capability and argument problems (`Unsupported`, `InvalidArgument`,
//!   `Config`).
//!
//! ```rust
//! use jedi_common::{RuntimeError, RuntimeResult};
//!
//! fn read_exit_code(running: bool) -> RuntimeResult<i32> {
//!     if running {
//!         return Err(RuntimeError::illegal_state("exit_value", "running"));
//!     }
//!     Ok(0)
//! }
//!
//! assert!(read_exit_code(true).is_err());
//! ```

use crate::types::StdStream;
use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Main error type for runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The OS refused to create a new process.
    #[error("Can not make fork, needed by exec: {command}")]
    ForkFailed { command: String },

    /// The parent/child coordination channel could not be allocated.
    #[error("Can not allocate shared memory for spawn of {command}")]
    SharedMemoryAllocationFailed { command: String },

    /// The child could not switch to the requested user.
    #[error("setuid({uid}): Operation not permitted")]
    SetUidFailed { uid: u32 },

    /// The child could not switch to the requested group.
    #[error("setgid({gid}): Operation not permitted")]
    SetGidFailed { gid: u32 },

    /// The child image could not be replaced (or its stdio could not be wired).
    #[error("Can not execute {command}: errno {errno}")]
    ExecFailed { command: String, errno: i32 },

    /// The child was terminated by a signal.
    #[error("The process was interrupted with signal: {signal}")]
    Signaled { signal: i32 },

    /// The operation is not valid in the current lifecycle phase.
    #[error("Illegal state for {operation}: process is {state}")]
    IllegalState { operation: String, state: String },

    /// The caller lacks the rights to act on the target.
    #[error("Permission denied: {operation} on {target}")]
    PermissionDenied { operation: String, target: String },

    /// Stream or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested standard stream is not wired for this process.
    #[error("{stream} stream not available")]
    StreamUnavailable { stream: StdStream },

    /// The waiting side lost track of the process before it finished.
    #[error("Process {id} was interrupted before completion")]
    Interrupted { id: String },

    /// The target pid does not exist.
    #[error("No such process: {pid}")]
    NoSuchProcess { pid: u32 },

    /// The backend does not implement the requested operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    /// A precondition on an argument was violated.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Runtime configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    pub fn fork_failed(command: impl Into<String>) -> Self {
        Self::ForkFailed {
            command: command.into(),
        }
    }

    pub fn shared_memory_allocation_failed(command: impl Into<String>) -> Self {
        Self::SharedMemoryAllocationFailed {
            command: command.into(),
        }
    }

    pub fn exec_failed(command: impl Into<String>, errno: i32) -> Self {
        Self::ExecFailed {
            command: command.into(),
            errno,
        }
    }

    pub fn illegal_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::IllegalState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    pub fn permission_denied(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
            target: target.into(),
        }
    }

    pub fn interrupted(id: impl Into<String>) -> Self {
        Self::Interrupted { id: id.into() }
    }

    pub fn unsupported(backend: &'static str, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend,
            operation: operation.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Converts an I/O error from a file-metadata or signalling call,
    /// promoting `PermissionDenied` to the dedicated variant.
    pub fn from_io(operation: &str, target: impl Into<String>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::permission_denied(operation, target)
        } else {
            Self::Io(err)
        }
    }

    /// True for the failure kinds recorded when a spawn never produced a
    /// running image.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            Self::ForkFailed { .. }
                | Self::SharedMemoryAllocationFailed { .. }
                | Self::SetUidFailed { .. }
                | Self::SetGidFailed { .. }
                | Self::ExecFailed { .. }
        )
    }
}
