//! Host-delegated backend: children launched through `std::process`.
//!
//! Stdio is always piped back to the caller. There is no admission control
//! and no identity override; requests that need one fail with
//! [`RuntimeError::Unsupported`] instead of being silently ignored.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;

use jedi_common::{ExecRequest, RuntimeError, RuntimeResult};
use jedi_process::{kill_process, signal_process, wait_for_exit};
use jedi_process_state::SpawnOutcome;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::completion::Completion;
use crate::events::ProcessId;
use crate::facade::Process;

pub const HOST_BACKEND: &str = "host";

/// Sentinel returned by [`HostBackend::system`], which never runs anything.
pub const HOST_SYSTEM_SENTINEL: i32 = 0;

#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        Self
    }

    fn unsupported<T>(&self, operation: &str) -> RuntimeResult<T> {
        debug!("{} is not available on the host backend", operation);
        Err(RuntimeError::unsupported(HOST_BACKEND, operation))
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        HOST_BACKEND
    }

    fn exec(&self, request: ExecRequest) -> RuntimeResult<Process> {
        request.validate()?;
        if request.identity.is_override() {
            return self.unsupported("exec with identity override");
        }
        if request.redirections.any_file() {
            return self.unsupported("exec with file redirection");
        }
        HostProcess::spawn(request).map(|(process, pipes)| Process::from_host(process, pipes))
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> RuntimeResult<()> {
        self.unsupported("chmod")
    }

    fn chown(&self, _path: &Path, _uid: u32, _gid: Option<u32>) -> RuntimeResult<()> {
        self.unsupported("chown")
    }

    fn chgrp(&self, _path: &Path, _gid: u32) -> RuntimeResult<()> {
        self.unsupported("chgrp")
    }

    fn kill_process(&self, _pid: u32) -> RuntimeResult<()> {
        self.unsupported("kill_process")
    }

    fn signal_process(&self, _pid: u32, _signal: i32) -> RuntimeResult<()> {
        self.unsupported("signal_process")
    }

    /// Stub: runs nothing and returns [`HOST_SYSTEM_SENTINEL`].
    fn system(&self, command: &str) -> RuntimeResult<i32> {
        warn!(
            "host backend system() is a stub; '{}' was not executed",
            command
        );
        Ok(HOST_SYSTEM_SENTINEL)
    }
}

/// Piped stdio taken from the child at spawn time.
pub(crate) struct HostPipes {
    pub(crate) stdin: Option<ChildStdin>,
    pub(crate) stdout: Option<ChildStdout>,
    pub(crate) stderr: Option<ChildStderr>,
}

/// A child launched by the host facility.
pub struct HostProcess {
    request: ExecRequest,
    completion: Arc<Completion>,
}

impl HostProcess {
    fn spawn(request: ExecRequest) -> RuntimeResult<(Self, HostPipes)> {
        let program = request.command.program().ok_or_else(|| {
            RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "empty command",
            ))
        })?;

        let mut child = Command::new(program)
            .args(&request.command.args()[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let id = ProcessId::next();
        let pid = child.id();
        let completion = Arc::new(Completion::new(id));
        completion.set_running(pid);

        let pipes = HostPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let reaper = Arc::clone(&completion);
        let worker = thread::Builder::new()
            .name(format!("jedi-reaper-{}", id.as_u64()))
            .spawn(move || reap(child, &reaper));
        if let Err(e) = worker {
            warn!("{} has no reaping worker, killing pid {}: {}", id, pid, e);
            discard_child(pid);
            return Err(e.into());
        }

        info!("{} launched on host as pid {}: {}", id, pid, request.command);
        Ok((
            Self {
                request,
                completion,
            },
            pipes,
        ))
    }

    pub fn id(&self) -> ProcessId {
        self.completion.id()
    }

    pub fn request(&self) -> &ExecRequest {
        &self.request
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Kill the child with `SIGKILL`. A no-op once it has terminated.
    pub fn destroy(&self) -> RuntimeResult<()> {
        self.deliver(kill_process)
    }

    /// Deliver `signal` to the child. A no-op once it has terminated.
    pub fn signal(&self, signal: i32) -> RuntimeResult<()> {
        self.deliver(|pid| signal_process(pid, signal))
    }

    fn deliver(&self, send: impl FnOnce(u32) -> RuntimeResult<()>) -> RuntimeResult<()> {
        match self.completion.signal_running(send) {
            Err(RuntimeError::NoSuchProcess { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Kill and reap a child that will never get a reaping worker.
fn discard_child(pid: u32) {
    if let Err(e) = kill_process(pid) {
        debug!("Killing abandoned pid {} failed: {}", pid, e);
    }
    if let Err(e) = wait_for_exit(pid) {
        debug!("Reaping abandoned pid {} failed: {}", pid, e);
    }
}

fn reap(mut child: Child, completion: &Completion) {
    match child.wait() {
        Ok(status) => {
            let outcome = match (status.code(), status.signal()) {
                (Some(code), _) => SpawnOutcome::Exited(code),
                (None, Some(signal)) => SpawnOutcome::Signaled(signal),
                (None, None) => {
                    completion.interrupt(format!("unclassified exit status {}", status), None);
                    return;
                }
            };
            debug!("{} finished: {}", completion.id(), outcome);
            completion.complete(outcome, None);
        }
        Err(e) => {
            warn!("{} lost its child: {}", completion.id(), e);
            completion.interrupt(format!("waiting for child failed: {}", e), None);
        }
    }
}
