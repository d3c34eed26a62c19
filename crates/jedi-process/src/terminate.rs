//! Signal delivery.

use jedi_common::{RuntimeError, RuntimeResult};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::validation::validate_pid;

/// Send `signal` (a raw signal number) to `pid`.
///
/// `EPERM` maps to [`RuntimeError::PermissionDenied`] and `ESRCH` to
/// [`RuntimeError::NoSuchProcess`]. Signal 0 is rejected; use
/// [`crate::process_exists`] for existence probes.
pub fn signal_process(pid: u32, signal: i32) -> RuntimeResult<()> {
    validate_pid(pid)?;
    let sig = Signal::try_from(signal)
        .map_err(|_| RuntimeError::invalid_argument(format!("unknown signal {}", signal)))?;

    debug!("Sending {} to pid {}", sig, pid);
    kill(Pid::from_raw(pid as i32), sig).map_err(|e| match e {
        Errno::EPERM => RuntimeError::permission_denied(format!("kill -{}", signal), pid.to_string()),
        Errno::ESRCH => RuntimeError::NoSuchProcess { pid },
        other => RuntimeError::Io(std::io::Error::from_raw_os_error(other as i32)),
    })
}

/// Force kill a process with `SIGKILL`.
pub fn kill_process(pid: u32) -> RuntimeResult<()> {
    signal_process(pid, Signal::SIGKILL as i32)
}
