//! Native Unix backend: admission-gated spawns with identity drop.

use std::path::Path;
use std::sync::Arc;

use jedi_common::{ExecRequest, RuntimeResult};
use tracing::debug;

use crate::admission::{self, AdmissionController};
use crate::backend::Backend;
use crate::facade::Process;
use crate::spawned::SpawnedProcess;

pub const UNIX_BACKEND: &str = "unix";

#[derive(Debug, Clone)]
pub struct UnixBackend {
    admission: Arc<AdmissionController>,
}

impl UnixBackend {
    /// Backend sharing the process-wide admission controller.
    pub fn new() -> Self {
        Self::with_admission(admission::global())
    }

    /// Backend with its own admission controller.
    pub fn with_admission(admission: Arc<AdmissionController>) -> Self {
        Self { admission }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }
}

impl Default for UnixBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for UnixBackend {
    fn name(&self) -> &'static str {
        UNIX_BACKEND
    }

    fn exec(&self, request: ExecRequest) -> RuntimeResult<Process> {
        SpawnedProcess::spawn(request, Arc::clone(&self.admission)).map(Process::from_native)
    }

    fn chmod(&self, path: &Path, mode: u32) -> RuntimeResult<()> {
        jedi_process::chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: u32, gid: Option<u32>) -> RuntimeResult<()> {
        jedi_process::chown(path, uid, gid)
    }

    fn chgrp(&self, path: &Path, gid: u32) -> RuntimeResult<()> {
        jedi_process::chgrp(path, gid)
    }

    fn kill_process(&self, pid: u32) -> RuntimeResult<()> {
        jedi_process::kill_process(pid)
    }

    fn signal_process(&self, pid: u32, signal: i32) -> RuntimeResult<()> {
        jedi_process::signal_process(pid, signal)
    }

    /// Spawn through [`Backend::exec`] and wait. Spawn failures and signal
    /// deaths come back as their error kinds.
    fn system(&self, command: &str) -> RuntimeResult<i32> {
        let process = self.exec(ExecRequest::new(command))?;
        let outcome = process.wait()?;
        debug!("system '{}' finished: {}", command, outcome);
        outcome.into_result(command)
    }
}
