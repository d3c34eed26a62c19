//! Natively spawned process with a dedicated reaping worker.

use std::sync::Arc;
use std::thread;

use jedi_common::{ExecRequest, RuntimeError, RuntimeResult};
use jedi_process::{await_exit, kill_process, launch, prepare_spawn, reap_exited, Launch};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::completion::Completion;
use crate::events::ProcessId;

/// One native child. Construction schedules the reaping worker immediately;
/// the child itself starts once admission grants a slot.
pub struct SpawnedProcess {
    request: ExecRequest,
    completion: Arc<Completion>,
}

impl SpawnedProcess {
    pub fn spawn(request: ExecRequest, admission: Arc<AdmissionController>) -> RuntimeResult<Self> {
        request.validate()?;

        let id = ProcessId::next();
        let completion = Arc::new(Completion::new(id));
        let reaper = Reaper {
            request: request.clone(),
            completion: Arc::clone(&completion),
            admission,
        };

        thread::Builder::new()
            .name(format!("jedi-reaper-{}", id.as_u64()))
            .spawn(move || reaper.run())?;

        debug!("{} scheduled: {}", id, request.command);
        Ok(Self {
            request,
            completion,
        })
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

    /// Ask the OS to kill the child with `SIGKILL`.
    ///
    /// Blocks until the pid is known if the child has not launched yet. A
    /// process that already reached a terminal state is left alone. The
    /// reaping worker still records the outcome, normally `Signaled(9)`.
    pub fn destroy(&self) -> RuntimeResult<()> {
        if self.completion.wait_for_pid().is_none() {
            return Ok(());
        }
        let id = self.completion.id();
        let killed = self.completion.signal_running(|pid| {
            info!("Destroying {} (pid {})", id, pid);
            kill_process(pid)
        });
        match killed {
            Err(RuntimeError::NoSuchProcess { .. }) => Ok(()),
            other => other,
        }
    }
}

struct Reaper {
    request: ExecRequest,
    completion: Arc<Completion>,
    admission: Arc<AdmissionController>,
}

impl Reaper {
    fn run(self) {
        let id = self.completion.id();
        let permit = self.admission.acquire();
        debug!(
            "{} admitted ({} in flight)",
            id,
            self.admission.running()
        );

        let prepared = match prepare_spawn(&self.request) {
            Ok(prepared) => prepared,
            Err(outcome) => {
                warn!("{} could not be prepared: {}", id, outcome);
                self.completion.complete(outcome, Some(permit));
                return;
            }
        };
        debug!("{} launching '{}'", id, prepared.command());

        let pid = match launch(prepared) {
            Launch::Started(pid) => pid,
            Launch::Failed(outcome) => {
                warn!("{} failed to start: {}", id, outcome);
                self.completion.complete(outcome, Some(permit));
                return;
            }
        };
        self.completion.set_running(pid);

        match await_exit(pid) {
            Ok(outcome) => {
                debug!("{} (pid {}) finished: {}", id, pid, outcome);
                self.completion.complete_and_reap(outcome, Some(permit), || {
                    if let Err(e) = reap_exited(pid) {
                        warn!("{} could not reap pid {}: {}", id, pid, e);
                    }
                });
            }
            Err(e) => {
                warn!("{} lost track of pid {}: {}", id, pid, e);
                self.completion
                    .interrupt(format!("waiting for pid {} failed: {}", pid, e), Some(permit));
            }
        }
    }
}
