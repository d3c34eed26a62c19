use chrono::{DateTime, Utc};
use jedi_common::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified result of one spawn attempt. Recorded exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnOutcome {
    /// The child exited normally with this status code.
    Exited(i32),
    /// The child was terminated by this signal number.
    Signaled(i32),
    /// `fork` failed; no child was created.
    ForkFailed,
    /// The parent/child coordination channel could not be allocated.
    SharedMemoryAllocationFailed,
    /// The child could not drop to the requested uid.
    SetUidFailed { uid: u32 },
    /// The child could not drop to the requested gid.
    SetGidFailed { gid: u32 },
    /// The image could not be replaced; carries the errno.
    ExecFailed(i32),
}

impl SpawnOutcome {
    /// True only for a normal exit, whatever its code.
    pub fn is_exit(&self) -> bool {
        matches!(self, SpawnOutcome::Exited(_))
    }

    /// True when the child never ran its image.
    pub fn is_spawn_failure(&self) -> bool {
        !matches!(self, SpawnOutcome::Exited(_) | SpawnOutcome::Signaled(_))
    }

    /// Re-surfaces the outcome as an exit code or the matching error kind.
    pub fn into_result(self, command: &str) -> RuntimeResult<i32> {
        match self {
            SpawnOutcome::Exited(code) => Ok(code),
            SpawnOutcome::Signaled(signal) => Err(RuntimeError::Signaled { signal }),
            SpawnOutcome::ForkFailed => Err(RuntimeError::fork_failed(command)),
            SpawnOutcome::SharedMemoryAllocationFailed => {
                Err(RuntimeError::shared_memory_allocation_failed(command))
            }
            SpawnOutcome::SetUidFailed { uid } => Err(RuntimeError::SetUidFailed { uid }),
            SpawnOutcome::SetGidFailed { gid } => Err(RuntimeError::SetGidFailed { gid }),
            SpawnOutcome::ExecFailed(errno) => Err(RuntimeError::exec_failed(command, errno)),
        }
    }
}

impl fmt::Display for SpawnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnOutcome::Exited(code) => write!(f, "exited({})", code),
            SpawnOutcome::Signaled(signal) => write!(f, "signaled({})", signal),
            SpawnOutcome::ForkFailed => write!(f, "fork_failed"),
            SpawnOutcome::SharedMemoryAllocationFailed => {
                write!(f, "shared_memory_allocation_failed")
            }
            SpawnOutcome::SetUidFailed { uid } => write!(f, "setuid_failed({})", uid),
            SpawnOutcome::SetGidFailed { gid } => write!(f, "setgid_failed({})", gid),
            SpawnOutcome::ExecFailed(errno) => write!(f, "exec_failed({})", errno),
        }
    }
}

/// Lifecycle phase of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Constructed; the reaping worker has not launched the child yet
    /// (it may be queued behind admission control).
    Created,
    /// The OS process exists and its pid is known.
    Running,
    /// Terminal: the outcome is recorded.
    Completed(SpawnOutcome),
    /// Terminal: the reaping worker lost the child before it finished.
    /// No outcome is recorded.
    Interrupted,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Completed(outcome) => write!(f, "completed[{}]", outcome),
            ProcessState::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl ProcessState {
    /// Running from the caller's point of view: not yet terminal.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Created | ProcessState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    pub fn outcome(&self) -> Option<SpawnOutcome> {
        match self {
            ProcessState::Completed(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

/// Process state machine that validates transitions and keeps a
/// timestamped history.
#[derive(Debug, Clone)]
pub struct ProcessStateMachine {
    process_id: String,
    current_state: ProcessState,
    previous_state: Option<ProcessState>,
    state_history: Vec<StateTransition>,
}

/// Represents a state transition with timestamp and optional reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ProcessState,
    pub to_state: ProcessState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ProcessStateMachine {
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            current_state: ProcessState::Created,
            previous_state: None,
            state_history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> ProcessState {
        self.current_state
    }

    pub fn previous_state(&self) -> Option<ProcessState> {
        self.previous_state
    }

    pub fn state_history(&self) -> &[StateTransition] {
        &self.state_history
    }

    pub fn is_running(&self) -> bool {
        self.current_state.is_running()
    }

    pub fn outcome(&self) -> Option<SpawnOutcome> {
        self.current_state.outcome()
    }

    /// Check if a transition from current state to target state is valid
    pub fn is_valid_transition(&self, target_state: ProcessState) -> bool {
        match (self.current_state, target_state) {
            (ProcessState::Created, ProcessState::Running) => true,
            // Spawn failures complete without ever running
            (ProcessState::Created, ProcessState::Completed(_)) => true,
            (ProcessState::Created, ProcessState::Interrupted) => true,

            (ProcessState::Running, ProcessState::Completed(_)) => true,
            (ProcessState::Running, ProcessState::Interrupted) => true,

            // Terminal states are final
            _ => false,
        }
    }

    /// Transition to a new state with optional reason
    pub fn transition_to(
        &mut self,
        target_state: ProcessState,
        reason: Option<String>,
    ) -> RuntimeResult<()> {
        if !self.is_valid_transition(target_state) {
            return Err(RuntimeError::illegal_state(
                format!("transition to {}", target_state),
                self.current_state.to_string(),
            ));
        }

        let now = Utc::now();
        let from_state = self.current_state;
        self.state_history.push(StateTransition {
            from_state,
            to_state: target_state,
            timestamp: now,
            reason,
        });

        self.previous_state = Some(from_state);
        self.current_state = target_state;

        tracing::debug!(
            "Process {} transitioned from {} to {}",
            self.process_id,
            from_state,
            target_state
        );

        Ok(())
    }

    pub fn transition_to_running(&mut self, pid: u32) -> RuntimeResult<()> {
        self.transition_to(ProcessState::Running, Some(format!("Launched as pid {}", pid)))
    }

    pub fn transition_to_completed(&mut self, outcome: SpawnOutcome) -> RuntimeResult<()> {
        self.transition_to(ProcessState::Completed(outcome), None)
    }

    pub fn transition_to_interrupted(&mut self, reason: String) -> RuntimeResult<()> {
        self.transition_to(ProcessState::Interrupted, Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_creation() {
        let sm = ProcessStateMachine::new("proc-1");
        assert_eq!(sm.current_state(), ProcessState::Created);
        assert_eq!(sm.previous_state(), None);
        assert!(sm.state_history().is_empty());
        assert!(sm.is_running());
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut sm = ProcessStateMachine::new("proc-1");

        sm.transition_to_running(4242).unwrap();
        assert_eq!(sm.current_state(), ProcessState::Running);
        assert!(sm.is_running());

        sm.transition_to_completed(SpawnOutcome::Exited(3)).unwrap();
        assert!(!sm.is_running());
        assert_eq!(sm.outcome(), Some(SpawnOutcome::Exited(3)));
        assert_eq!(sm.previous_state(), Some(ProcessState::Running));
        assert_eq!(sm.state_history().len(), 2);
        assert_eq!(
            sm.state_history()[0].reason.as_deref(),
            Some("Launched as pid 4242")
        );
    }

    #[test]
    fn test_spawn_failure_skips_running() {
        let mut sm = ProcessStateMachine::new("proc-2");
        sm.transition_to_completed(SpawnOutcome::ForkFailed).unwrap();
        assert_eq!(sm.outcome(), Some(SpawnOutcome::ForkFailed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut sm = ProcessStateMachine::new("proc-3");
        sm.transition_to_running(1).unwrap();
        sm.transition_to_completed(SpawnOutcome::Signaled(9)).unwrap();

        let err = sm
            .transition_to_completed(SpawnOutcome::Exited(0))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalState { .. }));
        assert!(sm.transition_to_interrupted("late".to_string()).is_err());
        assert_eq!(sm.outcome(), Some(SpawnOutcome::Signaled(9)));
    }

    #[test]
    fn test_interrupted_has_no_outcome() {
        let mut sm = ProcessStateMachine::new("proc-4");
        sm.transition_to_running(7).unwrap();
        sm.transition_to_interrupted("waitpid failed".to_string()).unwrap();
        assert!(!sm.is_running());
        assert_eq!(sm.outcome(), None);
    }

    #[test]
    fn test_running_cannot_go_back() {
        let mut sm = ProcessStateMachine::new("proc-5");
        sm.transition_to_running(7).unwrap();
        assert!(!sm.is_valid_transition(ProcessState::Created));
        assert!(!sm.is_valid_transition(ProcessState::Running));
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(SpawnOutcome::Exited(4).into_result("x").unwrap(), 4);
        assert!(matches!(
            SpawnOutcome::Signaled(15).into_result("x"),
            Err(RuntimeError::Signaled { signal: 15 })
        ));
        assert!(matches!(
            SpawnOutcome::SetUidFailed { uid: 12 }.into_result("x"),
            Err(RuntimeError::SetUidFailed { uid: 12 })
        ));
        assert!(matches!(
            SpawnOutcome::ExecFailed(2).into_result("x"),
            Err(RuntimeError::ExecFailed { errno: 2, .. })
        ));
        assert!(SpawnOutcome::ExecFailed(2).is_spawn_failure());
        assert!(!SpawnOutcome::Signaled(9).is_spawn_failure());
    }
}
