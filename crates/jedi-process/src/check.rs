//! Process existence checking.

use jedi_common::{RuntimeError, RuntimeResult};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::validation::validate_pid;

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`, which sends nothing. A process we may not signal
/// still exists, so `EPERM` reports `true`.
///
/// ```rust,no_run
/// use jedi_process::process_exists;
///
/// if process_exists(1234).unwrap() {
///     println!("Process 1234 is running");
/// }
/// ```
pub fn process_exists(pid: u32) -> RuntimeResult<bool> {
    validate_pid(pid)?;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Ok(true),
        Err(e) => Err(RuntimeError::Io(std::io::Error::from_raw_os_error(e as i32))),
    }
}
