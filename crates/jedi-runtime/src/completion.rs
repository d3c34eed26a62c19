//! Shared completion state of one process.
//!
//! Both process variants record their lifecycle here. The reaping worker
//! drives `Created -> Running -> Completed | Interrupted`; callers block on
//! the condition variable (or the watch channel for async callers) until the
//! state is terminal.
//!
//! Lock order is listeners, then state, then admission. The terminal
//! transition and the admission release share one state critical section.
//! The listener lock is held from before the transition until dispatch is
//! over, so no listener can be registered in between. Signals go out under
//! the state lock while the process is running, and the native child is
//! reaped under that same lock, so a signal never reaches a recycled pid.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use jedi_common::{RuntimeError, RuntimeResult};
use jedi_process_state::{ProcessState, ProcessStateMachine, SpawnOutcome, StateTransition};
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::admission::AdmissionPermit;
use crate::events::{
    ChannelListener, ListenerId, ListenerSet, ProcessEvent, ProcessEventListener, ProcessId,
};

struct CoreState {
    machine: ProcessStateMachine,
    pid: Option<u32>,
}

pub(crate) struct Completion {
    id: ProcessId,
    state: Mutex<CoreState>,
    changed: Condvar,
    listeners: Mutex<ListenerSet>,
    terminal: watch::Sender<bool>,
}

impl Completion {
    pub(crate) fn new(id: ProcessId) -> Self {
        let (terminal, _) = watch::channel(false);
        Self {
            id,
            state: Mutex::new(CoreState {
                machine: ProcessStateMachine::new(&id.to_string()),
                pid: None,
            }),
            changed: Condvar::new(),
            listeners: Mutex::new(ListenerSet::default()),
            terminal,
        }
    }

    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn set_running(&self, pid: u32) {
        let mut state = self.state.lock();
        if let Err(e) = state.machine.transition_to_running(pid) {
            warn!("{}: {}", self.id, e);
            return;
        }
        state.pid = Some(pid);
        drop(state);
        self.changed.notify_all();
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Block until the pid is known, or the process ended without one.
    pub(crate) fn wait_for_pid(&self) -> Option<u32> {
        let mut state = self.state.lock();
        while state.pid.is_none() && state.machine.is_running() {
            self.changed.wait(&mut state);
        }
        state.pid
    }

    pub(crate) fn complete(&self, outcome: SpawnOutcome, permit: Option<AdmissionPermit>) {
        self.finish(ProcessState::Completed(outcome), None, permit, || {});
    }

    /// Like [`Self::complete`], running `reap` first inside the state
    /// critical section.
    pub(crate) fn complete_and_reap(
        &self,
        outcome: SpawnOutcome,
        permit: Option<AdmissionPermit>,
        reap: impl FnOnce(),
    ) {
        self.finish(ProcessState::Completed(outcome), None, permit, reap);
    }

    pub(crate) fn interrupt(&self, reason: String, permit: Option<AdmissionPermit>) {
        self.finish(ProcessState::Interrupted, Some(reason), permit, || {});
    }

    fn finish(
        &self,
        target: ProcessState,
        reason: Option<String>,
        permit: Option<AdmissionPermit>,
        reap: impl FnOnce(),
    ) {
        let mut listeners = self.listeners.lock();

        let pid = {
            let mut state = self.state.lock();
            reap();
            if let Err(e) = state.machine.transition_to(target, reason) {
                warn!("{}: {}", self.id, e);
                return;
            }
            // Released before any waiter can observe the terminal state.
            if let Some(permit) = permit {
                permit.release();
            }
            state.pid
        };

        self.changed.notify_all();
        self.terminal.send_replace(true);

        let event = match target.outcome() {
            Some(outcome) => ProcessEvent::completed(self.id, pid, outcome),
            None => ProcessEvent::interrupted(self.id, pid),
        };
        debug!(
            "{} is {}, notifying {} listener(s)",
            self.id,
            target,
            listeners.len()
        );
        listeners.dispatch_and_close(&event);
    }

    /// Call `send` with the pid if the process is running. The state lock is
    /// held for the duration of the call.
    pub(crate) fn signal_running(
        &self,
        send: impl FnOnce(u32) -> RuntimeResult<()>,
    ) -> RuntimeResult<()> {
        let state = self.state.lock();
        match state.pid {
            Some(pid) if state.machine.is_running() => send(pid),
            _ => Ok(()),
        }
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.state.lock().machine.current_state()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub(crate) fn outcome(&self) -> Option<SpawnOutcome> {
        self.state().outcome()
    }

    pub(crate) fn state_history(&self) -> Vec<StateTransition> {
        self.state.lock().machine.state_history().to_vec()
    }

    fn terminal_result(&self, state: ProcessState) -> RuntimeResult<SpawnOutcome> {
        match state {
            ProcessState::Completed(outcome) => Ok(outcome),
            other => Err(RuntimeError::interrupted(format!("{} ({})", self.id, other))),
        }
    }

    /// Block until terminal. Returns immediately once terminal.
    pub(crate) fn wait(&self) -> RuntimeResult<SpawnOutcome> {
        let mut state = self.state.lock();
        while state.machine.is_running() {
            self.changed.wait(&mut state);
        }
        self.terminal_result(state.machine.current_state())
    }

    /// Like [`Completion::wait`], bounded. `Ok(None)` means still running.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> RuntimeResult<Option<SpawnOutcome>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait().map(Some);
        };
        let mut state = self.state.lock();
        while state.machine.is_running() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if state.machine.is_running() {
                    return Ok(None);
                }
                break;
            }
        }
        self.terminal_result(state.machine.current_state()).map(Some)
    }

    pub(crate) async fn wait_async(&self) -> RuntimeResult<SpawnOutcome> {
        let mut terminal = self.terminal.subscribe();
        if terminal.wait_for(|done| *done).await.is_err() {
            return Err(RuntimeError::interrupted(self.id.to_string()));
        }
        self.terminal_result(self.state())
    }

    pub(crate) fn add_listener(
        &self,
        listener: Arc<dyn ProcessEventListener>,
    ) -> RuntimeResult<ListenerId> {
        self.listeners.lock().add(listener).ok_or_else(|| {
            RuntimeError::illegal_state("add_listener", self.state().to_string())
        })
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(id)
    }

    pub(crate) fn subscribe(&self) -> RuntimeResult<mpsc::Receiver<ProcessEvent>> {
        let (tx, rx) = mpsc::channel();
        self.add_listener(Arc::new(ChannelListener(tx)))?;
        Ok(rx)
    }
}
