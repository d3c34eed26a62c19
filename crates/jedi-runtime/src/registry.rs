//! Process-wide backend selection.
//!
//! The registry starts out holding a [`HostBackend`]. Swap it once near
//! startup, before any exec is issued; swapping while processes are in
//! flight is not synchronized with them.

use std::sync::Arc;

use jedi_common::RuntimeResult;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::info;

use crate::admission;
use crate::backend::Backend;
use crate::config::{BackendKind, RuntimeConfig};
use crate::host::HostBackend;
use crate::unix::UnixBackend;

lazy_static! {
    static ref RUNTIME: RwLock<Arc<dyn Backend>> = RwLock::new(Arc::new(HostBackend::new()));
}

/// The active backend.
pub fn runtime() -> Arc<dyn Backend> {
    RUNTIME.read().clone()
}

/// Replace the active backend.
pub fn set_runtime(backend: Arc<dyn Backend>) {
    info!("Runtime backend set to {}", backend.name());
    *RUNTIME.write() = backend;
}

/// Apply `config`: size the global admission controller and install the
/// selected backend.
pub fn init(config: &RuntimeConfig) -> RuntimeResult<()> {
    config.validate()?;
    admission::configure_global(
        config.admission.max_processes,
        config.admission.poll_interval,
    );
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Host => Arc::new(HostBackend::new()),
        BackendKind::Unix => Arc::new(UnixBackend::new()),
    };
    set_runtime(backend);
    Ok(())
}
