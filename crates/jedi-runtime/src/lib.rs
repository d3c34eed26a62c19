//! # Jedi Runtime
//!
//! Process execution runtime with two backends:
//!
//! - [`HostBackend`] launches children through `std::process` and exposes
//!   live stdio pipes. It has no admission control and rejects identity
//!   overrides and file redirections.
//! - [`UnixBackend`] forks natively, drops to a requested uid/gid, wires
//!   stdio to files, and caps in-flight children through an
//!   [`AdmissionController`].
//!
//! Every exec returns a [`Process`] facade. A dedicated reaping worker per
//! child records exactly one terminal state and notifies listeners.
//!
//! ```rust,no_run
//! use jedi_common::ExecRequest;
//! use jedi_runtime::{registry, RuntimeConfig};
//!
//! let config = RuntimeConfig::load_from_string("backend: unix").unwrap();
//! registry::init(&config).unwrap();
//!
//! let process = registry::runtime()
//!     .exec(ExecRequest::new(["sh", "-c", "exit 3"]))
//!     .unwrap();
//! assert_eq!(process.wait().unwrap().to_string(), "exited(3)");
//! assert_eq!(process.exit_value().unwrap(), 3);
//! ```

pub mod admission;
pub mod backend;
mod completion;
pub mod config;
pub mod events;
pub mod facade;
pub mod host;
pub mod registry;
pub mod spawned;
pub mod streams;
pub mod unix;

pub use admission::{AdmissionController, AdmissionPermit};
pub use backend::Backend;
pub use config::{AdmissionConfig, BackendKind, RuntimeConfig};
pub use events::{ListenerId, ProcessEvent, ProcessEventKind, ProcessEventListener, ProcessId};
pub use facade::Process;
pub use host::{HostBackend, HostProcess, HOST_SYSTEM_SENTINEL};
pub use jedi_process_state::{ProcessState, SpawnOutcome, StateTransition};
pub use spawned::SpawnedProcess;
pub use streams::{ProcessReader, ProcessWriter};
pub use unix::UnixBackend;
