//! Uniform process handle returned by every backend.

use std::fs::{File, OpenOptions};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use jedi_common::{Command, ExecRequest, RuntimeError, RuntimeResult, StdStream};
use jedi_process_state::{ProcessState, SpawnOutcome, StateTransition};
use parking_lot::Mutex;
use tracing::debug;

use crate::completion::Completion;
use crate::events::{ListenerId, ProcessEvent, ProcessEventListener, ProcessId};
use crate::host::{HostPipes, HostProcess, HOST_BACKEND};
use crate::spawned::SpawnedProcess;
use crate::streams::{ProcessReader, ProcessWriter};
use crate::unix::UNIX_BACKEND;

enum ProcessKind {
    Host(HostProcess),
    Native(SpawnedProcess),
}

#[derive(Default)]
struct StreamCache {
    stdin: Option<ProcessWriter>,
    stdout: Option<ProcessReader>,
    stderr: Option<ProcessReader>,
}

/// Handle to one child, whichever backend launched it.
///
/// Host-delegated children expose live pipes. Native children expose only
/// the streams that were redirected to files; each is opened on first
/// access and the same handle is returned afterwards.
///
/// ```rust,no_run
/// use jedi_common::ExecRequest;
/// use jedi_runtime::{Backend, UnixBackend};
///
/// let backend = UnixBackend::new();
/// let process = backend
///     .exec(ExecRequest::new("echo hello").stdout_to("/tmp/hello.txt"))
///     .unwrap();
/// process.wait().unwrap();
/// assert_eq!(process.stdout().unwrap().read_all().unwrap(), "hello\n");
/// ```
pub struct Process {
    kind: ProcessKind,
    streams: Mutex<StreamCache>,
}

impl Process {
    pub(crate) fn from_host(process: HostProcess, pipes: HostPipes) -> Self {
        let streams = StreamCache {
            stdin: pipes.stdin.map(ProcessWriter::new),
            stdout: pipes
                .stdout
                .map(|out| ProcessReader::new(StdStream::Stdout, out)),
            stderr: pipes
                .stderr
                .map(|err| ProcessReader::new(StdStream::Stderr, err)),
        };
        Self {
            kind: ProcessKind::Host(process),
            streams: Mutex::new(streams),
        }
    }

    pub(crate) fn from_native(process: SpawnedProcess) -> Self {
        Self {
            kind: ProcessKind::Native(process),
            streams: Mutex::new(StreamCache::default()),
        }
    }

    fn completion(&self) -> &Completion {
        match &self.kind {
            ProcessKind::Host(p) => p.completion(),
            ProcessKind::Native(p) => p.completion(),
        }
    }

    fn request(&self) -> &ExecRequest {
        match &self.kind {
            ProcessKind::Host(p) => p.request(),
            ProcessKind::Native(p) => p.request(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.completion().id()
    }

    /// Name of the backend that launched this process.
    pub fn backend(&self) -> &'static str {
        match &self.kind {
            ProcessKind::Host(_) => HOST_BACKEND,
            ProcessKind::Native(_) => UNIX_BACKEND,
        }
    }

    pub fn command(&self) -> &Command {
        &self.request().command
    }

    /// OS pid of a native child once launched. Host-delegated processes
    /// always return `None`.
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            ProcessKind::Host(_) => None,
            ProcessKind::Native(p) => p.completion().pid(),
        }
    }

    pub fn stdout(&self) -> RuntimeResult<ProcessReader> {
        self.reader(StdStream::Stdout)
    }

    pub fn stderr(&self) -> RuntimeResult<ProcessReader> {
        self.reader(StdStream::Stderr)
    }

    pub fn stdin(&self) -> RuntimeResult<ProcessWriter> {
        let mut cache = self.streams.lock();
        if let Some(writer) = &cache.stdin {
            return Ok(writer.clone());
        }
        let path = self.redirect_path(StdStream::Stdin)?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| RuntimeError::from_io("open stdin", path.display().to_string(), e))?;
        let writer = ProcessWriter::new(file);
        cache.stdin = Some(writer.clone());
        Ok(writer)
    }

    fn reader(&self, stream: StdStream) -> RuntimeResult<ProcessReader> {
        let mut cache = self.streams.lock();
        let slot = if stream == StdStream::Stdout {
            &mut cache.stdout
        } else {
            &mut cache.stderr
        };
        if let Some(reader) = slot.as_ref() {
            return Ok(reader.clone());
        }
        let path = self.redirect_path(stream)?;
        let file = File::open(path).map_err(|e| {
            RuntimeError::from_io(&format!("open {}", stream), path.display().to_string(), e)
        })?;
        let reader = ProcessReader::new(stream, file);
        *slot = Some(reader.clone());
        Ok(reader)
    }

    /// Redirection file behind `stream`, or `StreamUnavailable`.
    fn redirect_path(&self, stream: StdStream) -> RuntimeResult<&std::path::Path> {
        let path = match &self.kind {
            ProcessKind::Native(p) => p.request().redirections.get(stream).path(),
            ProcessKind::Host(_) => None,
        };
        path.ok_or(RuntimeError::StreamUnavailable { stream })
    }

    pub fn is_running(&self) -> bool {
        self.completion().is_running()
    }

    pub fn state(&self) -> ProcessState {
        self.completion().state()
    }

    /// Recorded outcome, without blocking.
    pub fn outcome(&self) -> Option<SpawnOutcome> {
        self.completion().outcome()
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        self.completion().state_history()
    }

    /// Block until the process is terminal and return its outcome.
    ///
    /// Fails with [`RuntimeError::Interrupted`] if the reaping worker lost
    /// the child before it finished.
    pub fn wait(&self) -> RuntimeResult<SpawnOutcome> {
        self.completion().wait()
    }

    /// Bounded [`Process::wait`]. `Ok(None)` means the process is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> RuntimeResult<Option<SpawnOutcome>> {
        self.completion().wait_timeout(timeout)
    }

    pub async fn wait_async(&self) -> RuntimeResult<SpawnOutcome> {
        self.completion().wait_async().await
    }

    /// Exit code of a cleanly exited child.
    ///
    /// `IllegalState` while running; the matching error kind for a signal
    /// or spawn failure.
    pub fn exit_value(&self) -> RuntimeResult<i32> {
        match self.state() {
            ProcessState::Completed(outcome) => {
                outcome.into_result(&self.request().command.to_string())
            }
            ProcessState::Interrupted => Err(RuntimeError::interrupted(self.id().to_string())),
            running => Err(RuntimeError::illegal_state(
                "exit_value",
                running.to_string(),
            )),
        }
    }

    /// Kill the child. A no-op on a terminated process.
    pub fn destroy(&self) -> RuntimeResult<()> {
        match &self.kind {
            ProcessKind::Host(p) => p.destroy(),
            ProcessKind::Native(p) => p.destroy(),
        }
    }

    /// Deliver `signal` to a host-delegated child. Native processes ignore
    /// it: there is no signal path for them besides [`Process::destroy`].
    pub fn signal(&self, signal: i32) -> RuntimeResult<()> {
        match &self.kind {
            ProcessKind::Host(p) => p.signal(signal),
            ProcessKind::Native(_) => {
                debug!("{}: signal {} ignored for native process", self.id(), signal);
                Ok(())
            }
        }
    }

    /// Register a listener. Fails with `IllegalState` once terminal.
    pub fn add_listener(
        &self,
        listener: Arc<dyn ProcessEventListener>,
    ) -> RuntimeResult<ListenerId> {
        self.completion().add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.completion().remove_listener(id)
    }

    /// Channel receiving the terminal event. Fails with `IllegalState` once
    /// terminal.
    pub fn subscribe(&self) -> RuntimeResult<mpsc::Receiver<ProcessEvent>> {
        self.completion().subscribe()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("backend", &self.backend())
            .field("command", &self.command().to_string())
            .field("state", &self.state())
            .finish()
    }
}
