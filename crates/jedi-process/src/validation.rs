//! Argument validation for process operations.
//!
//! These checks run before any system call so that a bad argument never
//! reaches the kernel with a surprising meaning (pid 0 signals the whole
//! process group, a pid above `i32::MAX` becomes negative).

use jedi_common::{RuntimeError, RuntimeResult};

/// Highest permission bits accepted by [`crate::chmod`]: setuid, setgid,
/// sticky and the nine rwx bits.
pub const MAX_MODE: u32 = 0o7777;

/// Validate that a pid addresses exactly one process.
pub fn validate_pid(pid: u32) -> RuntimeResult<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(RuntimeError::invalid_argument(format!(
            "pid {} does not name a single process",
            pid
        )));
    }
    Ok(())
}

/// Validate a permission mode.
pub fn validate_mode(mode: u32) -> RuntimeResult<()> {
    if mode > MAX_MODE {
        return Err(RuntimeError::invalid_argument(format!(
            "mode {:o} has bits outside {:o}",
            mode, MAX_MODE
        )));
    }
    Ok(())
}
