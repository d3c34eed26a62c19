//! Native process spawning with identity drop.
//!
//! A spawn happens in three steps, all on the caller's thread:
//!
//! 1. [`prepare_spawn`] resolves the executable, builds the argv and opens
//!    the redirection files. Nothing here runs in the child, so it may
//!    allocate freely.
//! 2. [`launch`] forks. The child resets its signal dispositions, applies
//!    `setgid` then `setuid`, wires stdio and replaces its image. Any failure
//!    in that sequence is written to a close-on-exec status pipe as
//!    `(stage, errno)` and the child exits. The parent reads the pipe: EOF
//!    means the image was replaced.
//! 3. [`wait_for_exit`] blocks until the child exits or is killed.
//!
//! Between `fork` and `exec` the child only performs async-signal-safe calls
//! and never returns or unwinds, so no destructor runs there.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use jedi_common::{ExecRequest, RuntimeError, RuntimeResult, StdioTarget};
use jedi_process_state::SpawnOutcome;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setgid, setuid, ForkResult, Gid, Pid, Uid};
use tracing::{debug, warn};

const DEV_NULL: &str = "/dev/null";

/// Mode for redirection files created on behalf of the child (before umask).
const REDIRECT_FILE_MODE: u32 = 0o666;

/// Signals whose disposition is reset to default in the child.
const RESET_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCHLD,
    Signal::SIGPIPE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Stage {
    SetGid = 1,
    SetUid = 2,
    Redirect = 3,
    Exec = 4,
}

impl Stage {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Stage::SetGid),
            2 => Some(Stage::SetUid),
            3 => Some(Stage::Redirect),
            4 => Some(Stage::Exec),
            _ => None,
        }
    }
}

/// Everything the child needs, built before `fork`.
#[derive(Debug)]
pub struct PreparedSpawn {
    command: String,
    program: CString,
    argv: Vec<CString>,
    uid: Option<u32>,
    gid: Option<u32>,
    stdin: File,
    stdout: File,
    stderr: File,
}

impl PreparedSpawn {
    /// Human-readable command line, for logging.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Result of [`launch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// The image was replaced; the child runs as this pid.
    Started(u32),
    /// The spawn failed before the image was replaced.
    Failed(SpawnOutcome),
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn open_output(target: &StdioTarget) -> std::io::Result<File> {
    let path = target.path().unwrap_or(Path::new(DEV_NULL));
    OpenOptions::new()
        .write(true)
        .create(target.path().is_some())
        .truncate(target.path().is_some())
        .mode(REDIRECT_FILE_MODE)
        .open(path)
}

fn open_input(target: &StdioTarget) -> std::io::Result<File> {
    File::open(target.path().unwrap_or(Path::new(DEV_NULL)))
}

/// Resolve the program, build argv and open stdio targets.
///
/// Failures here are classified as [`SpawnOutcome::ExecFailed`] with the
/// errno of the failing step: an empty command or an unresolvable
/// executable yields `ENOENT`.
pub fn prepare_spawn(request: &ExecRequest) -> Result<PreparedSpawn, SpawnOutcome> {
    let command = request.command.to_string();
    let program = request
        .command
        .program()
        .ok_or(SpawnOutcome::ExecFailed(libc::ENOENT))?;

    let resolved = which::which(program).map_err(|e| {
        debug!("Cannot resolve executable '{}': {}", program, e);
        SpawnOutcome::ExecFailed(libc::ENOENT)
    })?;

    let program = CString::new(resolved.as_os_str().as_bytes())
        .map_err(|_| SpawnOutcome::ExecFailed(libc::EINVAL))?;
    let argv = request
        .command
        .args()
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| SpawnOutcome::ExecFailed(libc::EINVAL))?;

    let redirections = &request.redirections;
    let stdout = open_output(&redirections.stdout).map_err(|e| {
        warn!("Cannot open stdout target for '{}': {}", command, e);
        SpawnOutcome::ExecFailed(errno_of(&e))
    })?;
    let stderr = open_output(&redirections.stderr).map_err(|e| {
        warn!("Cannot open stderr target for '{}': {}", command, e);
        SpawnOutcome::ExecFailed(errno_of(&e))
    })?;
    let stdin = open_input(&redirections.stdin).map_err(|e| {
        warn!("Cannot open stdin source for '{}': {}", command, e);
        SpawnOutcome::ExecFailed(errno_of(&e))
    })?;

    Ok(PreparedSpawn {
        command,
        program,
        argv,
        uid: request.identity.uid,
        gid: request.identity.gid,
        stdin,
        stdout,
        stderr,
    })
}

/// Create the close-on-exec status pipe shared by parent and child.
fn status_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let (read_end, write_end) = nix::unistd::pipe()?;
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            // SAFETY: fd is a live descriptor owned by this function.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                return Err(Errno::last());
            }
        }
        Ok((read_end, write_end))
    }
}

/// Fork and exec a prepared spawn.
///
/// Returns once the child has either replaced its image or reported a
/// failure; in the latter case the child has already been reaped.
pub fn launch(prepared: PreparedSpawn) -> Launch {
    let (read_end, write_end) = match status_pipe() {
        Ok(pipe) => pipe,
        Err(e) => {
            warn!("Cannot allocate status channel for '{}': {}", prepared.command, e);
            return Launch::Failed(SpawnOutcome::SharedMemoryAllocationFailed);
        }
    };

    let argv_ptrs: Vec<*const libc::c_char> = prepared
        .argv
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let ctx = ChildContext {
        program: prepared.program.as_ptr(),
        argv: argv_ptrs.as_ptr(),
        uid: prepared.uid,
        gid: prepared.gid,
        stdio: [
            prepared.stdin.as_raw_fd(),
            prepared.stdout.as_raw_fd(),
            prepared.stderr.as_raw_fd(),
        ],
        status_fd: write_end.as_raw_fd(),
    };

    // SAFETY: the child branch only calls async-signal-safe functions on
    // data prepared above and ends in execv or _exit.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe { ctx.run() },
        Ok(ForkResult::Parent { child }) => {
            drop(write_end);
            let pid = child.as_raw() as u32;
            match read_status(read_end) {
                None => {
                    debug!("Launched '{}' as pid {}", prepared.command, pid);
                    Launch::Started(pid)
                }
                Some((stage, errno)) => {
                    // The child already reported and is exiting; reap it.
                    let _ = wait_for_exit(pid);
                    let outcome = match stage {
                        Stage::SetGid => SpawnOutcome::SetGidFailed {
                            gid: prepared.gid.unwrap_or_default(),
                        },
                        Stage::SetUid => SpawnOutcome::SetUidFailed {
                            uid: prepared.uid.unwrap_or_default(),
                        },
                        Stage::Redirect | Stage::Exec => SpawnOutcome::ExecFailed(errno),
                    };
                    debug!(
                        "Spawn of '{}' failed at {:?} (errno {})",
                        prepared.command, stage, errno
                    );
                    Launch::Failed(outcome)
                }
            }
        }
        Err(e) => {
            warn!("fork() failed for '{}': {}", prepared.command, e);
            Launch::Failed(SpawnOutcome::ForkFailed)
        }
    }
}

/// Read the child's report. `None` means EOF: exec succeeded.
fn read_status(read_end: OwnedFd) -> Option<(Stage, i32)> {
    let mut reader = File::from(read_end);
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Reading spawn status failed: {}", e);
                break;
            }
        }
    }
    if filled < buf.len() {
        return None;
    }
    let stage = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Stage::from_u32(stage).map(|stage| (stage, errno))
}

/// Raw pointers and descriptors handed to the forked child.
struct ChildContext {
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    uid: Option<u32>,
    gid: Option<u32>,
    stdio: [RawFd; 3],
    status_fd: RawFd,
}

impl ChildContext {
    /// Runs in the forked child. Never returns.
    unsafe fn run(&self) -> ! {
        for sig in RESET_SIGNALS {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        if let Some(gid) = self.gid {
            if let Err(e) = setgid(Gid::from_raw(gid)) {
                self.report(Stage::SetGid, e as i32);
            }
        }
        if let Some(uid) = self.uid {
            if let Err(e) = setuid(Uid::from_raw(uid)) {
                self.report(Stage::SetUid, e as i32);
            }
        }

        for (target, &fd) in self.stdio.iter().enumerate() {
            let target = target as RawFd;
            if fd == target {
                // dup2 onto itself keeps FD_CLOEXEC; clear it explicitly.
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    self.report(Stage::Redirect, Errno::last() as i32);
                }
            } else if libc::dup2(fd, target) == -1 {
                self.report(Stage::Redirect, Errno::last() as i32);
            }
        }

        libc::execv(self.program, self.argv);
        self.report(Stage::Exec, Errno::last() as i32)
    }

    unsafe fn report(&self, stage: Stage, errno: i32) -> ! {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&(stage as u32).to_be_bytes());
        buf[4..].copy_from_slice(&errno.to_be_bytes());
        libc::write(self.status_fd, buf.as_ptr().cast(), buf.len());
        libc::_exit(127)
    }
}

/// Block until `pid` exits or is killed by a signal.
///
/// `EINTR` is retried. Any other `waitpid` failure (for example `ECHILD`
/// when someone else reaped the child) is returned as an I/O error: the
/// caller has lost track of the process.
pub fn wait_for_exit(pid: u32) -> RuntimeResult<SpawnOutcome> {
    let nix_pid = Pid::from_raw(pid as i32);
    loop {
        match waitpid(nix_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(SpawnOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(SpawnOutcome::Signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(RuntimeError::Io(std::io::Error::from_raw_os_error(
                    e as i32,
                )))
            }
        }
    }
}

/// Block until `pid` exits without reaping it where the platform supports
/// `waitid(WNOWAIT)`. The child stays a zombie, so its pid cannot be reused
/// until [`reap_exited`] is called. Elsewhere this reaps like
/// [`wait_for_exit`].
#[cfg(any(
    target_os = "android",
    target_os = "freebsd",
    all(target_os = "linux", not(target_env = "uclibc")),
))]
pub fn await_exit(pid: u32) -> RuntimeResult<SpawnOutcome> {
    use nix::sys::wait::{waitid, Id, WaitPidFlag};

    let nix_pid = Pid::from_raw(pid as i32);
    loop {
        match waitid(Id::Pid(nix_pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(SpawnOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(SpawnOutcome::Signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(RuntimeError::Io(std::io::Error::from_raw_os_error(
                    e as i32,
                )))
            }
        }
    }
}

#[cfg(not(any(
    target_os = "android",
    target_os = "freebsd",
    all(target_os = "linux", not(target_env = "uclibc")),
)))]
pub fn await_exit(pid: u32) -> RuntimeResult<SpawnOutcome> {
    wait_for_exit(pid)
}

/// Release the zombie left by [`await_exit`].
#[cfg(any(
    target_os = "android",
    target_os = "freebsd",
    all(target_os = "linux", not(target_env = "uclibc")),
))]
pub fn reap_exited(pid: u32) -> RuntimeResult<()> {
    wait_for_exit(pid).map(|_| ())
}

#[cfg(not(any(
    target_os = "android",
    target_os = "freebsd",
    all(target_os = "linux", not(target_env = "uclibc")),
)))]
pub fn reap_exited(_pid: u32) -> RuntimeResult<()> {
    Ok(())
}

/// Prepare, launch and wait in one call on the current thread.
pub fn run_to_completion(request: &ExecRequest) -> RuntimeResult<SpawnOutcome> {
    let prepared = match prepare_spawn(request) {
        Ok(prepared) => prepared,
        Err(outcome) => return Ok(outcome),
    };
    match launch(prepared) {
        Launch::Started(pid) => wait_for_exit(pid),
        Launch::Failed(outcome) => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_exit_code_is_captured() {
        let request = ExecRequest::new(["sh", "-c", "exit 7"]);
        assert_eq!(
            run_to_completion(&request).unwrap(),
            SpawnOutcome::Exited(7)
        );
    }

    #[test]
    fn test_prepared_spawn_keeps_command_line() {
        let request = ExecRequest::new(["sh", "-c", "exit 0"]);
        let prepared = prepare_spawn(&request).unwrap();
        assert_eq!(prepared.command(), request.command.to_string());
    }

    #[test]
    fn test_missing_executable_is_exec_failure() {
        let request = ExecRequest::new("/definitely/not/a/binary --flag");
        assert_eq!(
            run_to_completion(&request).unwrap(),
            SpawnOutcome::ExecFailed(libc::ENOENT)
        );
    }

    #[test]
    fn test_empty_command_is_exec_failure() {
        let request = ExecRequest::new("   ");
        assert!(matches!(
            prepare_spawn(&request),
            Err(SpawnOutcome::ExecFailed(libc::ENOENT))
        ));
    }

    #[test]
    fn test_signal_termination_is_classified() {
        let request = ExecRequest::new(["sh", "-c", "kill -TERM $$"]);
        assert_eq!(
            run_to_completion(&request).unwrap(),
            SpawnOutcome::Signaled(libc::SIGTERM)
        );
    }

    #[test]
    fn test_stdout_and_stdin_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::File::create(&input)
            .unwrap()
            .write_all(b"through the pipe\n")
            .unwrap();

        let request = ExecRequest::new("cat").stdin_from(&input).stdout_to(&output);
        assert_eq!(
            run_to_completion(&request).unwrap(),
            SpawnOutcome::Exited(0)
        );
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "through the pipe\n"
        );
    }

    #[test]
    fn test_missing_stdin_file_fails_before_fork() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest::new("cat").stdin_from(dir.path().join("absent"));
        assert!(matches!(
            prepare_spawn(&request),
            Err(SpawnOutcome::ExecFailed(libc::ENOENT))
        ));
    }

    #[test]
    fn test_missing_output_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let request =
            ExecRequest::new("true").stdout_to(dir.path().join("no-such-dir").join("out"));
        assert!(matches!(
            prepare_spawn(&request),
            Err(SpawnOutcome::ExecFailed(libc::ENOENT))
        ));
    }

    #[test]
    fn test_identity_drop() {
        let nobody = 65534;
        let request = ExecRequest::new("true").gid(nobody).uid(nobody);
        let outcome = run_to_completion(&request).unwrap();
        if Uid::effective().is_root() {
            assert_eq!(outcome, SpawnOutcome::Exited(0));
        } else {
            // Unprivileged callers cannot switch group; setgid is applied first.
            assert_eq!(outcome, SpawnOutcome::SetGidFailed { gid: nobody });
        }
    }

    #[test]
    fn test_uid_only_override() {
        let request = ExecRequest::new("true").uid(65534);
        let outcome = run_to_completion(&request).unwrap();
        if Uid::effective().is_root() {
            assert_eq!(outcome, SpawnOutcome::Exited(0));
        } else {
            assert_eq!(outcome, SpawnOutcome::SetUidFailed { uid: 65534 });
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_await_exit_keeps_pid_until_reaped() {
        let request = ExecRequest::new(["sh", "-c", "exit 5"]);
        let Launch::Started(pid) = launch(prepare_spawn(&request).unwrap()) else {
            panic!("launch failed");
        };

        assert_eq!(await_exit(pid).unwrap(), SpawnOutcome::Exited(5));
        assert!(crate::check::process_exists(pid).unwrap());

        reap_exited(pid).unwrap();
        assert!(!crate::check::process_exists(pid).unwrap());
    }

    #[test]
    fn test_wait_for_unknown_child_fails() {
        // pid 1 is never our child.
        assert!(matches!(wait_for_exit(1), Err(RuntimeError::Io(_))));
    }
}
