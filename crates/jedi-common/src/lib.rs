//! # Jedi Common
//!
//! Types shared by every layer of the jedi process runtime.
//!
//! This crate provides the error taxonomy surfaced by spawning, waiting,
//! signalling and file-metadata operations, and the request model that
//! describes what to run, as whom, and where its standard streams go.

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{RuntimeError, RuntimeResult};
pub use types::{
    validate_id, Command, CommandInput, ExecRequest, Identity, Redirections, StdStream,
    StdioTarget, UNSET_ID,
};
